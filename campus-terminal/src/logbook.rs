//! In-memory log book
//!
//! A tracing layer that keeps the last N events for `get_logs` and forwards
//! warnings, errors and detection events to the coordinator as `log` frames.
//! Events emitted by the transport itself are never forwarded.

use crate::transport::TelemetrySink;
use campus_protocol::{LogRecord, Message};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const CRATE_TARGET: &str = "campus_terminal";
const TRANSPORT_TARGET: &str = "campus_terminal::transport";
const DETECTION_TARGET: &str = "campus_terminal::detection";

#[derive(Clone)]
pub struct LogBook {
    inner: Arc<Inner>,
}

struct Inner {
    records: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
    forward: Mutex<Option<mpsc::UnboundedSender<LogRecord>>>,
}

impl LogBook {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                capacity,
                forward: Mutex::new(None),
            }),
        }
    }

    /// tracing layer feeding this log book
    pub fn layer(&self) -> LogBookLayer {
        LogBookLayer { book: self.clone() }
    }

    pub fn push(&self, record: LogRecord) {
        let mut records = self.inner.records.lock();
        if records.len() == self.inner.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Most recent `count` records, oldest first
    pub fn recent(&self, count: usize) -> Vec<LogRecord> {
        let records = self.inner.records.lock();
        let skip = records.len().saturating_sub(count);
        records.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start forwarding to `sink`; records produced while the link is down are
    /// dropped from the forward queue (they stay in the book).
    pub fn spawn_forwarder(&self, sink: Arc<dyn TelemetrySink>, token: CancellationToken) {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogRecord>();
        *self.inner.forward.lock() = Some(tx);
        let book = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    record = rx.recv() => {
                        let Some(record) = record else { break };
                        if sink.is_connected() {
                            sink.send(Message::log(record)).await;
                        }
                    }
                }
            }
            book.inner.forward.lock().take();
        });
    }

    fn forward(&self, record: &LogRecord) {
        if let Some(tx) = self.inner.forward.lock().as_ref() {
            let _ = tx.send(record.clone());
        }
    }
}

/// Forward warnings and errors plus detection events, never the transport's own
fn should_forward(level: &Level, target: &str) -> bool {
    if target.starts_with(TRANSPORT_TARGET) {
        return false;
    }
    *level <= Level::WARN || target.starts_with(DETECTION_TARGET)
}

pub struct LogBookLayer {
    book: LogBook,
}

impl<S: Subscriber> Layer<S> for LogBookLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if !meta.target().starts_with(CRATE_TARGET) && *meta.level() > Level::WARN {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord {
            level: meta.level().as_str().to_ascii_lowercase(),
            message: visitor.finish(),
            source: meta.target().to_string(),
            timestamp: Utc::now(),
        };

        if should_forward(meta.level(), meta.target()) {
            self.book.forward(&record);
        }
        self.book.push(record);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_ring_keeps_newest() {
        let book = LogBook::new(3);
        for i in 0..5 {
            book.push(LogRecord {
                level: "info".into(),
                message: format!("line {i}"),
                source: "test".into(),
                timestamp: Utc::now(),
            });
        }
        assert_eq!(book.len(), 3);
        let recent: Vec<_> = book.recent(2).into_iter().map(|r| r.message).collect();
        assert_eq!(recent, vec!["line 3", "line 4"]);
        assert_eq!(book.recent(100).len(), 3);
    }

    #[test]
    fn test_forwarding_rules() {
        assert!(should_forward(&Level::ERROR, "campus_terminal::nodes"));
        assert!(should_forward(&Level::WARN, "campus_terminal::monitor"));
        assert!(should_forward(&Level::INFO, "campus_terminal::detection"));
        assert!(!should_forward(&Level::INFO, "campus_terminal::monitor"));
        assert!(!should_forward(&Level::ERROR, "campus_terminal::transport"));
    }

    #[test]
    fn test_layer_records_events_with_fields() {
        let book = LogBook::new(10);
        let subscriber = tracing_subscriber::registry().with(book.layer());
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "campus_terminal::nodes", node = 4, "Node unreachable");
            tracing::debug!(target: "hyper::client", "noise");
        });

        let records = book.recent(10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, "warn");
        assert_eq!(records[0].message, "Node unreachable node=4");
        assert_eq!(records[0].source, "campus_terminal::nodes");
    }
}
