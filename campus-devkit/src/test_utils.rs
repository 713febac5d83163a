/*!
Helpers for asynchronous assertions
*/

use std::time::Duration;
use tokio::time::{sleep, Instant};

const POLL_EVERY: Duration = Duration::from_millis(20);

/// Init env_logger once for a test binary
pub fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}

/// Poll `check` until it holds or `within` elapses
pub async fn wait_until<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(POLL_EVERY).await;
    }
}
