//! Detection Scheduler
//!
//! Owns the capture strategies of the terminal:
//! - push: frames delivered by the ingest routes are accepted while active
//! - pull: one polling loop per terminal fetches environment + frame from
//!   every data node, runs inference and uploads the results
//!
//! Transitions are serialised; anything no longer required is stopped (and
//! awaited) before anything new is started, then the mode is persisted.

pub mod model;
mod pull;
pub mod stats;
pub mod upload;

use crate::config::{ConfigStore, DetectionConfig};
use crate::error::{DetectionError, NodeError};
use crate::monitor::metrics::ResourceProbe;
use crate::nodes::NodeRegistry;
use campus_protocol::{DetectionMode, DetectionStatsView, EnvReading, NodeId, NodeReport};
use chrono::Utc;
use futures::future::join_all;
use model::ModelManager;
use parking_lot::Mutex;
use pull::{Breaker, PullState};
use stats::DetectionStats;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use upload::Uploader;

/// Outcome of one pull cycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub detections: usize,
    pub environment_only: usize,
    pub failed: usize,
}

struct PullTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct DetectionScheduler {
    config: Arc<ConfigStore>,
    nodes: Arc<NodeRegistry>,
    model: Arc<ModelManager>,
    uploader: Uploader,
    probe: Arc<dyn ResourceProbe>,
    stats: Mutex<DetectionStats>,
    transition: tokio::sync::Mutex<()>,
    push_running: AtomicBool,
    pull: Mutex<Option<PullTask>>,
    pull_state: Arc<PullState>,
    interval: Mutex<Duration>,
    frames_processed: AtomicU64,
    shutdown: CancellationToken,
}

impl DetectionScheduler {
    pub fn new(
        config: Arc<ConfigStore>,
        nodes: Arc<NodeRegistry>,
        model: Arc<ModelManager>,
        uploader: Uploader,
        probe: Arc<dyn ResourceProbe>,
    ) -> Arc<Self> {
        let interval = config.snapshot().interval();
        Arc::new(Self {
            config,
            nodes,
            model,
            uploader,
            probe,
            stats: Mutex::new(DetectionStats::default()),
            transition: tokio::sync::Mutex::new(()),
            push_running: AtomicBool::new(false),
            pull: Mutex::new(None),
            pull_state: Arc::new(PullState::default()),
            interval: Mutex::new(interval),
            frames_processed: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn model(&self) -> &Arc<ModelManager> {
        &self.model
    }

    /// Mode implied by the halves that are actually running
    pub fn mode(&self) -> DetectionMode {
        DetectionMode::from_flags(self.push_running(), self.pull_running())
    }

    pub fn push_running(&self) -> bool {
        self.push_running.load(Ordering::SeqCst)
    }

    pub fn pull_running(&self) -> bool {
        self.pull_state.running.load(Ordering::SeqCst)
    }

    /// The pull loop stopped itself after too many consecutive failures
    pub fn pull_tripped(&self) -> bool {
        self.pull_state.tripped.load(Ordering::SeqCst)
    }

    pub fn active_pull_loops(&self) -> usize {
        self.pull_state.active.load(Ordering::SeqCst)
    }

    pub fn interval(&self) -> Duration {
        *self.interval.lock()
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> DetectionStatsView {
        self.stats.lock().view()
    }

    pub fn link_connected(&self) -> bool {
        self.uploader.link().is_connected()
    }

    /// Switch to `mode`. Returns `false` when already there.
    pub async fn set_mode(self: &Arc<Self>, mode: DetectionMode) -> Result<bool, DetectionError> {
        let _transition = self.transition.lock().await;
        self.apply_mode(mode).await
    }

    /// Turn on the halves named by `which` (`both` turns on push and pull)
    pub async fn start(self: &Arc<Self>, which: DetectionMode) -> Result<DetectionMode, DetectionError> {
        let _transition = self.transition.lock().await;
        let target = DetectionMode::from_flags(
            self.push_running() || which.wants_push(),
            self.pull_running() || which.wants_pull(),
        );
        self.apply_mode(target).await?;
        Ok(self.mode())
    }

    /// Turn off the halves named by `which`
    pub async fn stop(self: &Arc<Self>, which: DetectionMode) -> Result<DetectionMode, DetectionError> {
        let _transition = self.transition.lock().await;
        let target = DetectionMode::from_flags(
            self.push_running() && !which.wants_push(),
            self.pull_running() && !which.wants_pull(),
        );
        self.apply_mode(target).await?;
        Ok(self.mode())
    }

    async fn apply_mode(self: &Arc<Self>, target: DetectionMode) -> Result<bool, DetectionError> {
        let current = self.mode();
        if current == target {
            debug!(mode = %target, "Mode unchanged");
            return Ok(false);
        }

        if !target.wants_pull() {
            self.stop_pull().await;
        }
        if !target.wants_push() && self.push_running.swap(false, Ordering::SeqCst) {
            info!("Push mode stopped");
        }
        if target.wants_push() && !self.push_running.swap(true, Ordering::SeqCst) {
            info!("Push mode started");
        }
        if target.wants_pull() && !self.pull_running() {
            self.start_pull();
        }

        self.config.update(|c| c.mode = target).await?;
        info!(from = %current, to = %target, "Detection mode changed");
        Ok(true)
    }

    /// Change the pull period; a running loop is restarted to pick it up
    pub async fn set_interval(self: &Arc<Self>, secs: u64) -> Result<bool, DetectionError> {
        if secs == 0 {
            return Err(DetectionError::InvalidInterval);
        }
        let _transition = self.transition.lock().await;
        let next = Duration::from_secs(secs);
        if self.interval() == next {
            return Ok(false);
        }

        *self.interval.lock() = next;
        self.config.update(|c| c.interval = secs).await?;
        if self.pull_running() {
            self.stop_pull().await;
            self.start_pull();
        }
        info!(interval_secs = secs, "Pull interval changed");
        Ok(true)
    }

    /// Soft restart: stop both halves, reload nodes and settings, resume the
    /// same mode
    pub async fn restart(self: &Arc<Self>) -> Result<DetectionMode, DetectionError> {
        let _transition = self.transition.lock().await;
        let mode = self.mode();
        self.stop_pull().await;
        self.push_running.store(false, Ordering::SeqCst);

        let config = self.config.snapshot();
        self.nodes.reload(&config.nodes);
        *self.interval.lock() = config.interval();

        if mode.wants_push() {
            self.push_running.store(true, Ordering::SeqCst);
        }
        if mode.wants_pull() {
            self.start_pull();
        }
        info!(mode = %mode, "Detection restarted");
        Ok(mode)
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let _transition = self.transition.lock().await;
        self.stop_pull().await;
        self.push_running.store(false, Ordering::SeqCst);
        self.model.unload().await;
    }

    fn start_pull(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let detection = self.config.snapshot().detection;
        let breaker = Breaker {
            max_errors: detection.max_errors,
            error_backoff: Duration::from_millis(detection.error_backoff_ms),
        };

        self.pull_state.running.store(true, Ordering::SeqCst);
        self.pull_state.tripped.store(false, Ordering::SeqCst);

        let token = self.shutdown.child_token();
        let handle = tokio::spawn(pull::run(Arc::clone(self), token.clone(), self.interval(), breaker));
        let previous = self.pull.lock().replace(PullTask { token, handle });
        if let Some(previous) = previous {
            // only a finished (tripped) loop can be left behind here
            previous.token.cancel();
        }
    }

    async fn stop_pull(&self) {
        let task = self.pull.lock().take();
        if let Some(task) = task {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Pull loop ended abnormally");
            }
        }
        self.pull_state.running.store(false, Ordering::SeqCst);
    }

    /// One pull cycle over every data node. Node failures are isolated; a
    /// sampling failure or an unavailable model fails the whole cycle.
    pub async fn run_cycle(self: &Arc<Self>) -> Result<CycleReport, DetectionError> {
        let sample = self
            .probe
            .sample()
            .map_err(|e| DetectionError::Resource(e.to_string()))?;
        debug!(cpu = sample.cpu_usage, memory = sample.memory.percent_used, "Pull cycle");

        let settings = self.config.snapshot().detection;
        let nodes = self.nodes.data_nodes();
        let results = join_all(nodes.iter().map(|id| self.pull_node(id, &settings))).await;

        let mut report = CycleReport::default();
        for (id, result) in nodes.iter().zip(results) {
            match result {
                Ok(Some(_)) => report.detections += 1,
                Ok(None) => report.environment_only += 1,
                Err(DetectionError::ModelUnavailable) => return Err(DetectionError::ModelUnavailable),
                Err(e) => {
                    report.failed += 1;
                    warn!(node = %id, error = %e, "Node skipped this cycle");
                }
            }
        }
        Ok(report)
    }

    async fn pull_node(
        self: &Arc<Self>,
        id: &NodeId,
        settings: &DetectionConfig,
    ) -> Result<Option<u32>, DetectionError> {
        let env = match self.nodes.fetch_environment(id, settings.env_retries).await {
            Ok(reading) if !reading.is_empty() => Some(reading),
            Ok(_) => None,
            Err(e) => {
                debug!(node = %id, error = %e, "No environment reading");
                None
            }
        };

        match self.nodes.capture_image(id, settings.image_retries).await {
            Ok(image) => self.process_frame(id, image, env).await.map(Some),
            Err(e) => {
                self.nodes.mark_error(id, e.to_string());
                let Some(env) = env else {
                    return Err(e.into());
                };
                self.deliver(NodeReport::capture_failed(id.clone(), &env, e.to_string()), None, Some(&env))
                    .await?;
                Ok(None)
            }
        }
    }

    /// Push path: a frame delivered from outside
    pub async fn process_pushed_frame(
        self: &Arc<Self>,
        node: &NodeId,
        image: Vec<u8>,
        env: Option<EnvReading>,
    ) -> Result<u32, DetectionError> {
        if !self.push_running() {
            return Err(DetectionError::PushInactive);
        }
        if !self.nodes.contains(node) {
            return Err(NodeError::Unknown(node.clone()).into());
        }
        self.process_frame(node, image, env.filter(|e| !e.is_empty())).await
    }

    /// Push path: an environmental reading delivered from outside
    pub async fn process_pushed_environment(&self, node: &NodeId, env: EnvReading) -> Result<(), DetectionError> {
        if !self.push_running() {
            return Err(DetectionError::PushInactive);
        }
        if !self.nodes.contains(node) {
            return Err(NodeError::Unknown(node.clone()).into());
        }
        self.deliver(NodeReport::environment(node.clone(), &env), None, Some(&env))
            .await
    }

    async fn process_frame(
        self: &Arc<Self>,
        id: &NodeId,
        image: Vec<u8>,
        env: Option<EnvReading>,
    ) -> Result<u32, DetectionError> {
        let config = self.config.snapshot();
        if config.save_image {
            if let Err(e) = save_frame(&config.capture_dir, id, &image).await {
                warn!(node = %id, error = %e, "Could not save frame");
            }
        }

        let count = match self.model.detect(image).await {
            Ok(count) => count,
            Err(DetectionError::ModelUnavailable) => return Err(DetectionError::ModelUnavailable),
            Err(e) => {
                self.nodes.mark_error(id, e.to_string());
                return Err(e);
            }
        };
        self.frames_processed.fetch_add(1, Ordering::SeqCst);
        info!(node = %id, count, "Objects detected");

        self.deliver(NodeReport::detection(id.clone(), count, env.as_ref()), Some(count), env.as_ref())
            .await?;
        Ok(count)
    }

    async fn deliver(
        &self,
        report: NodeReport,
        count: Option<u32>,
        env: Option<&EnvReading>,
    ) -> Result<(), DetectionError> {
        match self.uploader.upload(&report).await {
            Ok(route) => {
                match (count, env) {
                    (Some(count), env) => {
                        self.nodes.record_result(&report.id, count, env);
                        self.stats.lock().record(count);
                    }
                    (None, Some(env)) => self.nodes.record_environment(&report.id, env),
                    (None, None) => {}
                }
                debug!(node = %report.id, ?route, "Result delivered");
                Ok(())
            }
            Err(e) => {
                self.nodes.mark_error(&report.id, e.to_string());
                Err(e)
            }
        }
    }
}

async fn save_frame(dir: &std::path::Path, id: &NodeId, image: &[u8]) -> std::io::Result<PathBuf> {
    let dir = dir.join(format!("node_{id}"));
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(format!("{}.jpg", Utc::now().format("%Y%m%d_%H%M%S_%6f")));
    tokio::fs::write(&path, image).await?;
    Ok(path)
}
