//! Shared table of live connections.
//!
//! Three timing domains touch this state concurrently: connection tasks
//! (heartbeats, replay transitions), the heartbeat monitor (stale scans), and
//! the broadcaster (live-set snapshots). A single mutex over the map keeps
//! every operation atomic — an entry is either fully present in the table or
//! fully gone, never half-removed. Critical sections never await.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::frame::Frame;

pub type ConnId = u64;

/// Where a connection stands in the replay-then-live lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    NotStarted,
    Replaying,
    Live,
}

struct ConnEntry {
    /// Single-writer path to the socket: the connection task drains this
    /// queue, so the replayer and the broadcaster never touch the stream
    /// directly.
    outbox: mpsc::Sender<Frame>,
    last_heartbeat: Instant,
    state: ReplayState,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<ConnId, ConnEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly accepted connection with its initial heartbeat.
    pub fn add(&self, id: ConnId, outbox: mpsc::Sender<Frame>, now: Instant) {
        self.inner.lock().unwrap().insert(
            id,
            ConnEntry {
                outbox,
                last_heartbeat: now,
                state: ReplayState::NotStarted,
            },
        );
    }

    /// Removes a connection from every view of the table. Idempotent;
    /// returns whether the entry was still present.
    pub fn remove(&self, id: ConnId) -> bool {
        self.inner.lock().unwrap().remove(&id).is_some()
    }

    pub fn update_heartbeat(&self, id: ConnId, now: Instant) {
        if let Some(entry) = self.inner.lock().unwrap().get_mut(&id) {
            entry.last_heartbeat = now;
        }
    }

    /// Removes and returns every connection whose last heartbeat is older
    /// than `timeout`.
    pub fn evict_stale(&self, now: Instant, timeout: Duration) -> Vec<ConnId> {
        let mut table = self.inner.lock().unwrap();
        let stale: Vec<ConnId> = table
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_heartbeat) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            table.remove(id);
        }
        stale
    }

    /// Transitions NOT_STARTED → REPLAYING. Returns false if the connection
    /// is unknown or a replay already ran, so duplicate requests are ignored.
    pub fn mark_replaying(&self, id: ConnId) -> bool {
        let mut table = self.inner.lock().unwrap();
        match table.get_mut(&id) {
            Some(entry) if entry.state == ReplayState::NotStarted => {
                entry.state = ReplayState::Replaying;
                true
            }
            _ => false,
        }
    }

    /// Transitions into LIVE; from the next broadcast snapshot onward the
    /// connection receives every generated sample.
    pub fn mark_live(&self, id: ConnId) {
        if let Some(entry) = self.inner.lock().unwrap().get_mut(&id) {
            entry.state = ReplayState::Live;
        }
    }

    /// Clones the outbox of one connection, if it is still registered.
    pub fn outbox(&self, id: ConnId) -> Option<mpsc::Sender<Frame>> {
        self.inner
            .lock()
            .unwrap()
            .get(&id)
            .map(|entry| entry.outbox.clone())
    }

    /// One broadcast tick's snapshot of the connections eligible for live
    /// delivery.
    pub fn live_outboxes(&self) -> Vec<(ConnId, mpsc::Sender<Frame>)> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| entry.state == ReplayState::Live)
            .map(|(id, entry)| (*id, entry.outbox.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry; used at shutdown so connection tasks observe their
    /// outboxes closing.
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox() -> mpsc::Sender<Frame> {
        mpsc::channel(1).0
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        registry.add(1, outbox(), Instant::now());
        assert!(registry.remove(1));
        assert!(!registry.remove(1));
        assert!(registry.is_empty());
    }

    #[test]
    fn evicts_only_after_timeout() {
        let registry = ConnectionRegistry::new();
        let start = Instant::now();
        let timeout = Duration::from_secs(120);
        registry.add(1, outbox(), start);

        // Scan exactly at the threshold: still alive.
        assert!(registry.evict_stale(start + timeout, timeout).is_empty());
        // One scan period later the connection is gone.
        let evicted = registry.evict_stale(start + timeout + Duration::from_secs(60), timeout);
        assert_eq!(evicted, vec![1]);
        assert!(registry.is_empty());
    }

    #[test]
    fn heartbeat_refresh_defers_eviction() {
        let registry = ConnectionRegistry::new();
        let start = Instant::now();
        let timeout = Duration::from_secs(120);
        registry.add(1, outbox(), start);
        registry.update_heartbeat(1, start + Duration::from_secs(100));

        assert!(registry
            .evict_stale(start + Duration::from_secs(150), timeout)
            .is_empty());
        assert_eq!(
            registry.evict_stale(start + Duration::from_secs(300), timeout),
            vec![1]
        );
    }

    #[test]
    fn replay_state_gates_live_snapshot() {
        let registry = ConnectionRegistry::new();
        registry.add(1, outbox(), Instant::now());
        registry.add(2, outbox(), Instant::now());

        assert!(registry.live_outboxes().is_empty());
        assert!(registry.mark_replaying(1));
        registry.mark_live(1);

        let live: Vec<ConnId> = registry.live_outboxes().iter().map(|(id, _)| *id).collect();
        assert_eq!(live, vec![1]);
    }

    #[test]
    fn duplicate_replay_requests_are_rejected() {
        let registry = ConnectionRegistry::new();
        registry.add(1, outbox(), Instant::now());

        assert!(registry.mark_replaying(1));
        assert!(!registry.mark_replaying(1), "already replaying");
        registry.mark_live(1);
        assert!(!registry.mark_replaying(1), "already live");
        assert!(!registry.mark_replaying(7), "unknown connection");
    }
}
