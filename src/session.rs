//! Accepted local connections

use crate::addr::TargetAddr;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One accepted local connection and what it negotiated
#[derive(Debug)]
pub struct ClientSession {
    id: u64,
    peer: SocketAddr,
    target: Option<TargetAddr>,
    initial_payload: Bytes,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl ClientSession {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            target: None,
            initial_payload: Bytes::new(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Destination negotiated by the client; `None` means the configured
    /// forward address is the destination.
    pub fn target(&self) -> Option<&TargetAddr> {
        self.target.as_ref()
    }

    pub fn set_target(&mut self, target: TargetAddr) {
        self.target = Some(target);
    }

    /// Client bytes read during negotiation that belong to the tunnel
    pub fn initial_payload(&self) -> &Bytes {
        &self.initial_payload
    }

    pub fn set_initial_payload(&mut self, payload: Bytes) {
        self.initial_payload = payload;
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub(crate) fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }
}
