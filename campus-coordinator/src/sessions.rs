//! Connection sessions grouped by terminal identity.

use campus_protocol::{Message, TerminalId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// Frames a session may have queued before it counts as stalled
pub const SESSION_QUEUE: usize = 256;

/// What the writer task of a session puts on the socket
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Frame(Message),
    Close(u16, String),
}

pub struct SessionHandle {
    pub id: Uuid,
    pub terminal: TerminalId,
    pub token: CancellationToken,
    outbound: Sender<Outgoing>,
    primary: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl SessionHandle {
    /// Handle plus the receiving end for its writer task
    pub fn open(terminal: TerminalId, token: CancellationToken) -> (Self, Receiver<Outgoing>) {
        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        (Self::new(terminal, tx, token), rx)
    }

    pub fn new(terminal: TerminalId, outbound: Sender<Outgoing>, token: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            terminal,
            token,
            outbound,
            primary: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// False once the writer has gone away. A session whose queue is full
    /// is stalled and gets cancelled.
    pub fn send(&self, message: Message) -> bool {
        match self.outbound.try_send(Outgoing::Frame(message)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if !self.token.is_cancelled() {
                    warn!(terminal_id = %self.terminal, session = %self.id, "Outbound queue full, dropping session");
                    self.token.cancel();
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a close frame and stop the session
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.outbound.try_send(Outgoing::Close(code, reason.into()));
        self.token.cancel();
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// True the first time only
    pub fn promote(&self) -> bool {
        !self.primary.swap(true, Ordering::SeqCst)
    }

    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    groups: RwLock<HashMap<TerminalId, HashMap<Uuid, Arc<SessionHandle>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, session: Arc<SessionHandle>) {
        self.groups
            .write()
            .entry(session.terminal.clone())
            .or_default()
            .insert(session.id, session);
    }

    pub fn leave(&self, terminal: &TerminalId, id: Uuid) -> Option<Arc<SessionHandle>> {
        let mut groups = self.groups.write();
        let group = groups.get_mut(terminal)?;
        let session = group.remove(&id);
        if group.is_empty() {
            groups.remove(terminal);
        }
        session
    }

    /// Send to every member of the group except `except`; returns the number reached
    pub fn broadcast(&self, terminal: &TerminalId, message: &Message, except: Option<Uuid>) -> usize {
        let groups = self.groups.read();
        let Some(group) = groups.get(terminal) else {
            return 0;
        };
        group
            .values()
            .filter(|s| Some(s.id) != except)
            .filter(|s| s.send(message.clone()))
            .count()
    }

    pub fn members(&self, terminal: &TerminalId) -> usize {
        self.groups.read().get(terminal).map_or(0, HashMap::len)
    }

    pub fn has_primary(&self, terminal: &TerminalId) -> bool {
        self.groups
            .read()
            .get(terminal)
            .is_some_and(|group| group.values().any(|s| s.is_primary()))
    }

    pub fn total(&self) -> usize {
        self.groups.read().values().map(HashMap::len).sum()
    }

    /// Close every session, used on shutdown
    pub fn close_all(&self, code: u16, reason: &str) {
        for session in self.groups.read().values().flat_map(HashMap::values) {
            session.close(code, reason);
        }
    }
}
