use campus_protocol::{StatusSnapshot, TerminalId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Latest status snapshot per terminal, valid for `ttl`
pub struct StatusCache {
    ttl: Duration,
    entries: Mutex<HashMap<TerminalId, (Instant, StatusSnapshot)>>,
}

impl StatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &TerminalId) -> Option<StatusSnapshot> {
        let mut entries = self.entries.lock();
        match entries.get(id) {
            Some((stored, status)) if stored.elapsed() < self.ttl => Some(status.clone()),
            Some(_) => {
                entries.remove(id);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, id: &TerminalId, status: StatusSnapshot) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries.lock().insert(id.clone(), (Instant::now(), status));
    }

}
