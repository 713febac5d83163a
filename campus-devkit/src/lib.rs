/*!
# Campus DevKit - test tooling for terminals and the coordinator

- `MockCoordinator`: WebSocket server that records terminal frames and pushes
  commands, for exercising the terminal link without a real coordinator
- `SimulatedSocket`: terminal-side client for driving a real coordinator
- polling helpers for asynchronous assertions
*/

pub mod mock_coordinator;
pub mod simulated_socket;
pub mod test_utils;

pub use mock_coordinator::MockCoordinator;
pub use simulated_socket::{Received, SimulatedSocket};
pub use test_utils::{init_logging, wait_until};
