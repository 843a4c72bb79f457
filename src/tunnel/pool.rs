//! Per-target pool of pre-warmed tunnel connections

use super::TunnelConnection;
use crate::addr::TargetAddr;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

struct IdleTunnel {
    conn: TunnelConnection,
    idle_since: Instant,
}

#[derive(Default)]
struct PoolSlot {
    idle: Mutex<VecDeque<IdleTunnel>>,
    warming: AtomicUsize,
}

/// Idle tunnels keyed by forward target, at most `capacity` per target
/// (counting connections still being warmed).
pub struct TunnelPool {
    capacity: usize,
    idle_timeout: Duration,
    slots: DashMap<TargetAddr, Arc<PoolSlot>>,
    reused: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub warming: usize,
    pub reused: u64,
    pub discarded: u64,
}

impl TunnelPool {
    pub fn new(capacity: usize, idle_timeout: Duration) -> Self {
        Self {
            capacity,
            idle_timeout,
            slots: DashMap::new(),
            reused: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn slot(&self, target: &TargetAddr) -> Arc<PoolSlot> {
        self.slots.entry(target.clone()).or_default().value().clone()
    }

    /// Take a validated idle connection. Connections that sat idle too long
    /// or whose peer has gone away are discarded on the way.
    pub fn take(&self, target: &TargetAddr) -> Option<TunnelConnection> {
        let slot = self.slots.get(target)?.value().clone();
        let mut discarded = Vec::new();
        let found = {
            let mut idle = slot.idle.lock();
            loop {
                match idle.pop_front() {
                    Some(IdleTunnel { mut conn, idle_since }) => {
                        if idle_since.elapsed() < self.idle_timeout && conn.is_reusable() {
                            break Some(conn);
                        }
                        discarded.push(conn);
                    }
                    None => break None,
                }
            }
        };

        if !discarded.is_empty() {
            debug!("Discarded {} stale pooled tunnels to {}", discarded.len(), target);
            self.discarded
                .fetch_add(discarded.len() as u64, Ordering::Relaxed);
        }
        if found.is_some() {
            self.reused.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Reserve room for new connections to `target`; returns how many the
    /// caller should open. Each reservation must be settled by `finish_warm`.
    pub fn reserve_warm(&self, target: &TargetAddr) -> usize {
        let slot = self.slot(target);
        let idle = slot.idle.lock().len();
        let mut reserved = 0;
        loop {
            let warming = slot.warming.load(Ordering::Acquire);
            let wanted = self.capacity.saturating_sub(idle + warming);
            if wanted == 0 {
                break;
            }
            if slot
                .warming
                .compare_exchange(warming, warming + wanted, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                reserved = wanted;
                break;
            }
        }
        reserved
    }

    /// Settle one reservation, pooling the connection if there is room.
    /// Returns the connection back when it was not pooled.
    pub fn finish_warm(
        &self,
        target: &TargetAddr,
        conn: Option<TunnelConnection>,
    ) -> Option<TunnelConnection> {
        let slot = self.slot(target);
        // Saturating: a drain() may have raced with this warmer.
        let _ = slot
            .warming
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| w.checked_sub(1));
        let conn = conn?;

        let mut idle = slot.idle.lock();
        if idle.len() >= self.capacity {
            return Some(conn);
        }
        idle.push_back(IdleTunnel {
            conn,
            idle_since: Instant::now(),
        });
        None
    }

    pub fn idle_count(&self, target: &TargetAddr) -> usize {
        self.slots
            .get(target)
            .map(|slot| slot.idle.lock().len())
            .unwrap_or(0)
    }

    /// Remove every idle connection, returning them for the caller to close.
    pub fn drain(&self) -> Vec<TunnelConnection> {
        let mut drained = Vec::new();
        for slot in self.slots.iter() {
            drained.extend(slot.idle.lock().drain(..).map(|entry| entry.conn));
        }
        self.slots.clear();
        drained
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            capacity: self.capacity,
            reused: self.reused.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            ..Default::default()
        };
        for slot in self.slots.iter() {
            stats.idle += slot.idle.lock().len();
            stats.warming += slot.warming.load(Ordering::Relaxed);
        }
        stats
    }
}
