//! System Monitor
//!
//! Periodic sampler of the terminal:
//! - host resources every `monitor_interval`
//! - `system_status` push every `status_push_interval`, or right away on request
//! - the local CO2 sensor every `co2_read_interval`
//! - node reachability, a small batch of nodes per cycle
//! - config changes (file edits or commands), dispatched as targeted
//!   reconfiguration instead of a restart

pub mod co2;
pub mod metrics;

use crate::config::{ConfigStore, MonitorConfig, TerminalConfig};
use crate::detection::DetectionScheduler;
use crate::nodes::NodeRegistry;
use crate::transport::TelemetrySink;
use anyhow::Result;
use campus_protocol::{DetectionMode, Message, NodeId, StatusSnapshot};
use co2::Co2Monitor;
use futures::future::join_all;
use metrics::{ResourceProbe, ResourceSample};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Targeted reconfiguration derived from two configs
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConfigDiff {
    pub mode: Option<DetectionMode>,
    pub interval: Option<u64>,
    pub nodes: bool,
    pub preload_model: bool,
    pub cadence: bool,
}

impl ConfigDiff {
    pub fn between(old: &TerminalConfig, new: &TerminalConfig) -> Self {
        Self {
            mode: (old.mode != new.mode).then_some(new.mode),
            interval: (old.interval != new.interval).then_some(new.interval),
            nodes: old.nodes != new.nodes,
            preload_model: !old.preload_model && new.preload_model,
            cadence: old.monitor.monitor_interval != new.monitor.monitor_interval
                || old.monitor.status_push_interval != new.monitor.status_push_interval,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct SystemMonitor {
    config: Arc<ConfigStore>,
    scheduler: Arc<DetectionScheduler>,
    nodes: Arc<NodeRegistry>,
    probe: Arc<dyn ResourceProbe>,
    link: Arc<dyn TelemetrySink>,
    co2: Co2Monitor,
    last_sample: Mutex<Option<ResourceSample>>,
    last_probe: Mutex<HashMap<NodeId, Instant>>,
    push_now: Notify,
}

impl SystemMonitor {
    pub fn new(
        config: Arc<ConfigStore>,
        scheduler: Arc<DetectionScheduler>,
        nodes: Arc<NodeRegistry>,
        probe: Arc<dyn ResourceProbe>,
        link: Arc<dyn TelemetrySink>,
    ) -> Arc<Self> {
        let co2 = Co2Monitor::from_config(&config.snapshot().monitor);
        Arc::new(Self {
            config,
            scheduler,
            nodes,
            probe,
            link,
            co2,
            last_sample: Mutex::new(None),
            last_probe: Mutex::new(HashMap::new()),
            push_now: Notify::new(),
        })
    }

    /// Ask the loop for an immediate `system_status`
    pub fn request_push(&self) {
        self.push_now.notify_one();
    }

    pub fn refresh(&self) -> Result<()> {
        self.co2.poll();
        let sample = self.probe.sample()?;
        *self.last_sample.lock() = Some(sample);
        Ok(())
    }

    /// Latest resource sample merged with the live scheduler and node state
    pub fn snapshot(&self) -> StatusSnapshot {
        let sample = self.last_sample.lock().clone().unwrap_or_default();
        let model = self.scheduler.model();

        StatusSnapshot {
            terminal_id: Some(self.config.snapshot().terminal_id),
            cpu_usage: sample.cpu_usage,
            memory_usage: sample.memory.percent_used,
            memory_total: sample.memory.total_bytes,
            memory_available: sample.memory.available_bytes,
            disk_usage: sample.disk.percent_used,
            disk_total: sample.disk.total_bytes,
            disk_free: sample.disk.free_bytes,
            system_uptime: sample.uptime_seconds,
            mode: self.scheduler.mode(),
            push_running: self.scheduler.push_running(),
            pull_running: self.scheduler.pull_running(),
            pull_tripped: self.scheduler.pull_tripped(),
            model_loaded: model.is_loaded(),
            model_state: model.state(),
            nodes: self.nodes.states(),
            node_details: self.nodes.details(),
            detection_stats: self.scheduler.stats(),
            frames_processed: self.scheduler.frames_processed(),
            cloud_connected: self.link.is_connected(),
            co2_level: self.co2.level().or_else(|| self.nodes.latest_co2()),
            co2_status: self.co2.status(),
        }
    }

    pub async fn push_status(&self) -> bool {
        if !self.link.is_connected() {
            return false;
        }
        let sent = self.link.send(Message::system_status(self.snapshot())).await;
        if !sent {
            debug!("Status push not delivered");
        }
        sent
    }

    /// Probe up to `node_ping_batch` nodes whose last probe is older than
    /// `node_ping_interval`, least recently probed first
    pub async fn ping_nodes(&self) -> usize {
        let settings = self.config.snapshot().monitor;
        let every = Duration::from_secs(settings.node_ping_interval);

        let due: Vec<NodeId> = {
            let last = self.last_probe.lock();
            let mut candidates: Vec<(Option<Instant>, NodeId)> = self
                .nodes
                .ids()
                .into_iter()
                .map(|id| (last.get(&id).copied(), id))
                .filter(|(at, _)| at.map_or(true, |at| at.elapsed() >= every))
                .collect();
            candidates.sort_by_key(|(at, _)| *at);
            candidates
                .into_iter()
                .take(settings.node_ping_batch.max(1))
                .map(|(_, id)| id)
                .collect()
        };

        {
            let mut last = self.last_probe.lock();
            let now = Instant::now();
            for id in &due {
                last.insert(id.clone(), now);
            }
        }

        join_all(due.iter().map(|id| self.nodes.probe(id))).await;
        due.len()
    }

    /// Pick up config changes (from disk or from commands) and apply them
    pub async fn check_config(&self, seen: &mut TerminalConfig) -> Option<ConfigDiff> {
        if let Err(e) = self.config.reload_if_changed().await {
            warn!(error = %e, "Ignoring unreadable config file");
        }

        let current = self.config.snapshot();
        if current.fingerprint() == seen.fingerprint() {
            return None;
        }
        let diff = ConfigDiff::between(seen, &current);
        *seen = current;
        if diff.is_empty() {
            return None;
        }

        info!(?diff, "Configuration changed");
        self.apply(&diff, seen).await;
        Some(diff)
    }

    async fn apply(&self, diff: &ConfigDiff, config: &TerminalConfig) {
        if let Some(mode) = diff.mode {
            if let Err(e) = self.scheduler.set_mode(mode).await {
                warn!(error = %e, mode = %mode, "Could not apply mode from config");
            }
        }
        if let Some(secs) = diff.interval {
            if let Err(e) = self.scheduler.set_interval(secs).await {
                warn!(error = %e, "Could not apply interval from config");
            }
        }
        if diff.nodes {
            self.nodes.reload(&config.nodes);
        }
        if diff.preload_model {
            self.scheduler.model().load_in_background();
        }
    }

    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut seen = self.config.snapshot();
        let mut cadence = Cadence::from(&seen.monitor);
        let mut ticker = cadence.ticker();
        let mut last_push: Option<Instant> = None;

        info!(
            refresh_secs = cadence.refresh.as_secs(),
            push_secs = cadence.push.as_secs(),
            "System monitor started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.push_now.notified() => {
                    self.refresh_logged();
                    self.push_status().await;
                    last_push = Some(Instant::now());
                }
                _ = ticker.tick() => {
                    self.refresh_logged();

                    if let Some(diff) = self.check_config(&mut seen).await {
                        if diff.cadence {
                            cadence = Cadence::from(&seen.monitor);
                            ticker = cadence.ticker();
                        }
                    }

                    self.ping_nodes().await;

                    if last_push.map_or(true, |at| at.elapsed() >= cadence.push) {
                        self.push_status().await;
                        last_push = Some(Instant::now());
                    }
                }
            }
        }

        info!("System monitor stopped");
    }

    fn refresh_logged(&self) {
        if let Err(e) = self.refresh() {
            warn!(error = %e, "Resource sampling failed");
        }
    }
}

struct Cadence {
    refresh: Duration,
    push: Duration,
}

impl Cadence {
    fn from(settings: &MonitorConfig) -> Self {
        Self {
            refresh: Duration::from_secs(settings.monitor_interval.max(1)),
            push: Duration::from_secs(settings.status_push_interval.max(1)),
        }
    }

    fn ticker(&self) -> Interval {
        let mut ticker = interval(self.refresh);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }
}
