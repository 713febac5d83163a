use crate::bridge::Bridge;
use crate::sessions::SessionHandle;
use campus_protocol::CLOSE_HEARTBEAT_TIMEOUT;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::warn;

pub fn is_expired(idle: Duration, timeout: Duration) -> bool {
    idle > timeout
}

/// Evict the session once it is a primary reporter that went quiet.
///
/// Observers are never evicted; they hold no presence.
pub async fn watch(session: Arc<SessionHandle>, bridge: Arc<Bridge>, check: Duration, timeout: Duration) {
    let mut ticks = interval_at(Instant::now() + check, check);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = session.token.cancelled() => return,
            _ = ticks.tick() => {}
        }

        let idle = session.idle_for();
        if session.is_primary() && is_expired(idle, timeout) {
            warn!(
                terminal_id = %session.terminal,
                session = %session.id,
                idle_secs = idle.as_secs(),
                "Heartbeat timeout, evicting reporter"
            );
            bridge.set_online(&session.terminal, false);
            session.close(CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StatusCache;
    use crate::config::{CoordinatorConfig, TerminalConf};
    use crate::sessions::Outgoing;
    use crate::store::{MemoryStore, TerminalStore};
    use campus_protocol::TerminalId;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_expiry_boundary() {
        let timeout = Duration::from_secs(120);
        assert!(!is_expired(Duration::from_secs(119), timeout));
        assert!(!is_expired(timeout, timeout));
        assert!(is_expired(Duration::from_secs(121), timeout));
    }

    #[tokio::test]
    async fn test_quiet_primary_is_evicted() {
        let mut config = CoordinatorConfig::default();
        config.terminals.insert(TerminalId::from("1"), TerminalConf::default());
        let store = Arc::new(MemoryStore::in_memory(&config));
        let bridge = Arc::new(Bridge::new(store.clone(), StatusCache::new(Duration::ZERO), 0));
        bridge.set_online(&TerminalId::from("1"), true);

        let (tx, mut rx) = mpsc::channel(8);
        let observer = Arc::new(SessionHandle::new(TerminalId::from("1"), tx.clone(), CancellationToken::new()));
        let reporter = Arc::new(SessionHandle::new(TerminalId::from("1"), tx, CancellationToken::new()));
        reporter.promote();

        let check = Duration::from_millis(20);
        let timeout = Duration::from_millis(60);
        let watched = tokio::spawn(watch(reporter.clone(), bridge.clone(), check, timeout));
        let idle = tokio::spawn(watch(observer.clone(), bridge.clone(), check, timeout));

        tokio::time::timeout(Duration::from_secs(2), watched).await.unwrap().unwrap();
        assert!(reporter.token.is_cancelled());
        assert_eq!(rx.recv().await.unwrap(), Outgoing::Close(CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout".into()));
        assert!(!store.terminal(&TerminalId::from("1")).unwrap().online);

        assert!(!observer.token.is_cancelled());
        observer.token.cancel();
        idle.await.unwrap();
    }
}
