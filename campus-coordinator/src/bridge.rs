//! Applies terminal telemetry to the store and status cache.

use crate::cache::StatusCache;
use crate::error::StoreError;
use crate::store::TerminalStore;
use campus_protocol::{LogRecord, NodeReport, StatusSnapshot, TerminalId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Bridge {
    store: Arc<dyn TerminalStore>,
    cache: StatusCache,
    backlog: Mutex<HashMap<TerminalId, VecDeque<LogRecord>>>,
    backlog_size: usize,
}

impl Bridge {
    pub fn new(store: Arc<dyn TerminalStore>, cache: StatusCache, backlog_size: usize) -> Self {
        Self {
            store,
            cache,
            backlog: Mutex::new(HashMap::new()),
            backlog_size,
        }
    }

    pub fn store(&self) -> &Arc<dyn TerminalStore> {
        &self.store
    }

    pub fn knows(&self, terminal: &TerminalId) -> bool {
        self.store.contains(terminal)
    }

    pub fn set_online(&self, terminal: &TerminalId, online: bool) {
        if let Err(e) = self.store.set_online(terminal, online, Utc::now()) {
            warn!(terminal_id = %terminal, error = %e, "Failed to record presence");
        }
    }

    pub fn on_status(&self, terminal: &TerminalId, status: &StatusSnapshot, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.store.apply_status(terminal, status, at)?;
        self.cache.put(terminal, status.clone());
        debug!(terminal_id = %terminal, mode = %status.mode, "Status stored");
        Ok(())
    }

    pub fn on_nodes(&self, terminal: &TerminalId, reports: &[NodeReport], at: DateTime<Utc>) -> Result<usize, StoreError> {
        let samples = self.store.apply_node_reports(terminal, reports, at)?;
        debug!(terminal_id = %terminal, nodes = reports.len(), samples, "Node data stored");
        Ok(samples)
    }

    /// HTTP upload path: the node id alone identifies the terminal
    pub fn on_upload(&self, report: &NodeReport, at: DateTime<Utc>) -> Result<TerminalId, StoreError> {
        let terminal = self
            .store
            .node_owner(&report.id)
            .ok_or_else(|| StoreError::UnknownNode(report.id.clone()))?;
        self.on_nodes(&terminal, std::slice::from_ref(report), at)?;
        Ok(terminal)
    }

    pub fn on_log(&self, terminal: &TerminalId, record: LogRecord) {
        if self.backlog_size == 0 {
            return;
        }
        let mut backlog = self.backlog.lock();
        let ring = backlog.entry(terminal.clone()).or_default();
        if ring.len() >= self.backlog_size {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    pub fn recent_logs(&self, terminal: &TerminalId) -> Vec<LogRecord> {
        self.backlog
            .lock()
            .get(terminal)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Cached snapshot first, then the last one persisted
    pub fn status(&self, terminal: &TerminalId) -> Option<StatusSnapshot> {
        self.cache
            .get(terminal)
            .or_else(|| self.store.terminal(terminal).and_then(|record| record.last_status))
    }
}
