//! Acceptor-level counters

use crate::error::ErrorKind;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Live counters shared by an acceptor and its sessions
#[derive(Debug, Default)]
pub struct Stats {
    active_sessions: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    rejections: [AtomicU64; ErrorKind::ALL.len()],
}

/// Point-in-time copy of [`Stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub active_sessions: u64,
    /// client to tunnel
    pub bytes_in: u64,
    /// tunnel to client
    pub bytes_out: u64,
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub rejections: BTreeMap<&'static str, u64>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, kind: ErrorKind) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        self.rejections[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    /// Count a session as active until the returned guard is dropped.
    pub fn session_guard(self: &Arc<Self>) -> ActiveSession {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        ActiveSession(self.clone())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let rejections = ErrorKind::ALL
            .iter()
            .map(|kind| (kind.as_str(), self.rejections[kind.index()].load(Ordering::Relaxed)))
            .filter(|(_, count)| *count > 0)
            .collect();
        StatsSnapshot {
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            connections_accepted: self.accepted.load(Ordering::Relaxed),
            connections_rejected: self.rejected.load(Ordering::Relaxed),
            rejections,
        }
    }
}

pub struct ActiveSession(Arc<Stats>);

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = Arc::new(Stats::new());
        stats.record_accepted();
        stats.record_accepted();
        stats.record_rejected(ErrorKind::PolicyDenied);
        stats.add_bytes_in(1024);
        stats.add_bytes_out(2048);
        let guard = stats.session_guard();

        let snap = stats.snapshot();
        assert_eq!(snap.connections_accepted, 2);
        assert_eq!(snap.connections_rejected, 1);
        assert_eq!(snap.rejections.get("policy_denied"), Some(&1));
        assert_eq!(snap.rejections.len(), 1);
        assert_eq!((snap.bytes_in, snap.bytes_out), (1024, 2048));
        assert_eq!(snap.active_sessions, 1);

        drop(guard);
        assert_eq!(stats.snapshot().active_sessions, 0);
    }

    #[test]
    fn snapshot_serializes_flat() {
        let stats = Stats::new();
        stats.record_rejected(ErrorKind::Auth);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["connections_rejected"], 1);
        assert_eq!(json["rejections"]["auth_failure"], 1);
    }
}
