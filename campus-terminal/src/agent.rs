//! Terminal agent
//!
//! Wires the coordinator link, node registry, detection scheduler, system
//! monitor and command handlers together and owns their lifecycle:
//! - startup applies the persisted mode and optionally preloads the model
//! - shutdown stops detection, then the monitor, then the link

use crate::actuators::Buzzer;
use crate::commands::handlers::{self, Controls};
use crate::config::{ConfigStore, TerminalConfig};
use crate::detection::model::{ExternalModelLoader, ModelLoader, ModelManager};
use crate::detection::upload::Uploader;
use crate::detection::DetectionScheduler;
use crate::ingest;
use crate::logbook::LogBook;
use crate::monitor::metrics::{ResourceProbe, SysinfoProbe};
use crate::monitor::SystemMonitor;
use crate::nodes::{HttpNodeSource, NodeRegistry, NodeSource};
use crate::transport::{TelemetrySink, TransportClient};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The parts of the agent that touch hardware or the outside world
pub struct AgentParts {
    pub node_source: Arc<dyn NodeSource>,
    pub loader: Arc<dyn ModelLoader>,
    pub probe: Arc<dyn ResourceProbe>,
}

impl AgentParts {
    pub fn from_config(config: &TerminalConfig) -> Self {
        Self {
            node_source: Arc::new(HttpNodeSource::new(Duration::from_secs(
                config.detection.fetch_timeout_secs,
            ))),
            loader: Arc::new(ExternalModelLoader::from_config(&config.detection)),
            probe: Arc::new(SysinfoProbe::new(&config.capture_dir)),
        }
    }
}

pub struct Agent {
    config: Arc<ConfigStore>,
    transport: TransportClient,
    controls: Controls,
}

impl Agent {
    pub fn build(config: Arc<ConfigStore>, logbook: LogBook, parts: AgentParts) -> Result<Self> {
        let settings = config.snapshot();
        let transport = TransportClient::new(&settings).context("Invalid coordinator address")?;
        let link: Arc<dyn TelemetrySink> = Arc::new(transport.clone());

        let nodes = Arc::new(NodeRegistry::new(&settings.nodes, parts.node_source));
        let model = Arc::new(ModelManager::new(
            parts.loader,
            Duration::from_secs(settings.detection.model_wait_secs),
        ));
        let uploader = Uploader::new(
            Arc::clone(&link),
            settings.api_url.clone(),
            Duration::from_secs(settings.detection.upload_timeout_secs),
        );
        let scheduler = DetectionScheduler::new(
            Arc::clone(&config),
            Arc::clone(&nodes),
            model,
            uploader,
            Arc::clone(&parts.probe),
        );
        let monitor = SystemMonitor::new(
            Arc::clone(&config),
            Arc::clone(&scheduler),
            Arc::clone(&nodes),
            parts.probe,
            link,
        );

        let controls = Controls {
            config: Arc::clone(&config),
            scheduler,
            nodes,
            monitor,
            logbook,
            buzzer: Arc::new(Buzzer::new(&settings.buzzer)),
        };

        Ok(Self {
            config,
            transport,
            controls,
        })
    }

    pub fn transport(&self) -> &TransportClient {
        &self.transport
    }

    pub fn controls(&self) -> &Controls {
        &self.controls
    }

    /// Run until `token` is cancelled, then shut everything down
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let settings = self.config.snapshot();
        info!(
            terminal_id = %settings.terminal_id,
            url = %self.transport.url(),
            mode = %settings.mode,
            "Campus terminal starting"
        );

        let registry = handlers::registry(self.controls.clone());
        registry.validate().context("Command table incomplete")?;
        self.transport.on_command(Arc::new(registry));
        self.transport.start();

        let tasks = token.child_token();
        self.controls
            .logbook
            .spawn_forwarder(Arc::new(self.transport.clone()), tasks.clone());

        if settings.preload_model {
            self.controls.scheduler.model().load_in_background();
        }
        if let Err(e) = self.controls.scheduler.set_mode(settings.mode).await {
            warn!(error = %e, mode = %settings.mode, "Could not apply configured mode");
        }

        let monitor: JoinHandle<()> = tokio::spawn(Arc::clone(&self.controls.monitor).run(tasks.clone()));
        let ingest = settings.ingest_addr.clone().map(|addr| {
            let scheduler = Arc::clone(&self.controls.scheduler);
            let token = tasks.clone();
            tokio::spawn(async move {
                if let Err(e) = ingest::serve(&addr, scheduler, token).await {
                    warn!(error = %e, "Push ingest stopped");
                }
            })
        });

        token.cancelled().await;
        info!("Shutting down");

        self.controls.buzzer.stop();
        self.controls.scheduler.shutdown().await;
        tasks.cancel();
        if let Err(e) = monitor.await {
            warn!(error = %e, "Monitor task ended abnormally");
        }
        if let Some(ingest) = ingest {
            let _ = ingest.await;
        }
        self.transport.stop().await;
        info!("Campus terminal stopped");
        Ok(())
    }
}
