//! Pull loop with its consecutive-failure breaker

use super::DetectionScheduler;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
pub(crate) struct PullState {
    pub running: AtomicBool,
    pub tripped: AtomicBool,
    pub active: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Breaker {
    pub max_errors: u32,
    pub error_backoff: Duration,
}

/// Counts the loop as active for its whole lifetime, even if the task is aborted
struct ActiveLoop(Arc<PullState>);

impl ActiveLoop {
    fn enter(state: &Arc<PullState>) -> Self {
        state.active.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(state))
    }
}

impl Drop for ActiveLoop {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) async fn run(
    scheduler: Arc<DetectionScheduler>,
    token: CancellationToken,
    every: Duration,
    breaker: Breaker,
) {
    let state = Arc::clone(&scheduler.pull_state);
    let _active = ActiveLoop::enter(&state);
    let max_errors = breaker.max_errors.max(1);
    let mut consecutive = 0u32;

    info!(interval_secs = every.as_secs(), "Pull loop started");

    loop {
        let outcome = tokio::select! {
            _ = token.cancelled() => break,
            outcome = scheduler.run_cycle() => outcome,
        };

        let wait = match outcome {
            Ok(report) => {
                consecutive = 0;
                debug!(
                    detections = report.detections,
                    environment_only = report.environment_only,
                    failed_nodes = report.failed,
                    "Pull cycle finished"
                );
                every
            }
            Err(e) => {
                consecutive += 1;
                warn!(error = %e, consecutive, max_errors, "Pull cycle failed");
                if consecutive >= max_errors {
                    error!(consecutive, "Pull loop tripped after repeated failures");
                    state.tripped.store(true, Ordering::SeqCst);
                    break;
                }
                breaker.error_backoff
            }
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep(wait) => {}
        }
    }

    info!("Pull loop stopped");
}
