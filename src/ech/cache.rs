//! TTL cache of ECH configurations with one in-flight fetch per domain

use super::EchConfiguration;
use crate::dns::{DnsLookup, FetchError};
use crate::error::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

type FetchOutcome = std::result::Result<EchConfiguration, FetchError>;

/// ECH configuration cache keyed by cover domain
pub struct EchConfigCache {
    dns: Arc<dyn DnsLookup>,
    ttl: Duration,
    fetch_timeout: Duration,
    entries: DashMap<String, EchConfiguration>,
    inflight: DashMap<String, watch::Receiver<Option<FetchOutcome>>>,
    fetches: AtomicU64,
    hits: AtomicU64,
    invalidations: AtomicU64,
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub fetches: u64,
    pub hits: u64,
    pub invalidations: u64,
}

/// Removes the in-flight marker even if the leading fetch is dropped midway.
struct InflightGuard<'a> {
    inflight: &'a DashMap<String, watch::Receiver<Option<FetchOutcome>>>,
    domain: &'a str,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.inflight.remove(self.domain);
    }
}

impl EchConfigCache {
    pub fn new(dns: Arc<dyn DnsLookup>, ttl: Duration, fetch_timeout: Duration) -> Self {
        Self {
            dns,
            ttl,
            fetch_timeout,
            entries: DashMap::new(),
            inflight: DashMap::new(),
            fetches: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached configuration for `domain`, fetching it from
    /// `dns_server` when missing or expired.
    pub async fn get(&self, dns_server: &str, domain: &str) -> Result<EchConfiguration> {
        if let Some(config) = self.fresh(domain) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("ECH config cache hit for {}", domain);
            return Ok(config);
        }

        let joined = match self.inflight.entry(domain.to_string()) {
            Entry::Occupied(existing) => Err(existing.get().clone()),
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                slot.insert(rx);
                Ok(tx)
            }
        };
        let sender = match joined {
            Ok(tx) => tx,
            Err(mut rx) => {
                debug!("Joining in-flight ECH lookup for {}", domain);
                return Self::await_leader(&mut rx, domain).await;
            }
        };
        let _guard = InflightGuard {
            inflight: &self.inflight,
            domain,
        };

        // A previous leader may have finished between our cache check and
        // taking the in-flight slot.
        if let Some(config) = self.fresh(domain) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            sender.send_replace(Some(Ok(config.clone())));
            return Ok(config);
        }

        let outcome = self.fetch(dns_server, domain).await;
        if let Ok(config) = &outcome {
            self.entries.insert(domain.to_string(), config.clone());
        }
        sender.send_replace(Some(outcome.clone()));
        outcome.map_err(|e| e.into_tunnel_error(domain))
    }

    async fn fetch(&self, dns_server: &str, domain: &str) -> FetchOutcome {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        // One resolver query plus its DoH GET fallback, each bounded by
        // `fetch_timeout`.
        let deadline = self.fetch_timeout * 2;
        let bytes = match tokio::time::timeout(
            deadline,
            self.dns.fetch_ech_config_list(dns_server, domain),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!("ECH config lookup for {} timed out", domain);
                return Err(FetchError::Resolution(format!(
                    "query timed out after {:?}",
                    deadline
                )));
            }
        };

        let config = EchConfiguration::new(bytes, domain)?;
        info!(
            "Fetched ECH config for {} via {} ({} bytes, {} ms)",
            domain,
            dns_server,
            config.bytes().len(),
            start.elapsed().as_millis()
        );
        Ok(config)
    }

    async fn await_leader(
        rx: &mut watch::Receiver<Option<FetchOutcome>>,
        domain: &str,
    ) -> Result<EchConfiguration> {
        let outcome = match rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Ok(config)) => Ok(config),
            Some(Err(e)) => Err(e.into_tunnel_error(domain)),
            None => Err(FetchError::Resolution("lookup abandoned".to_string())
                .into_tunnel_error(domain)),
        }
    }

    fn fresh(&self, domain: &str) -> Option<EchConfiguration> {
        self.entries
            .get(domain)
            .filter(|entry| !entry.is_expired(self.ttl))
            .map(|entry| entry.value().clone())
    }

    /// Drop `stale` from the cache, unless a different configuration has
    /// already replaced it. Returns whether an entry was removed.
    pub fn invalidate(&self, stale: &EchConfiguration) -> bool {
        let removed = self
            .entries
            .remove_if(stale.domain(), |_, current| current == stale)
            .is_some();
        if removed {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
            info!("Invalidated stale ECH config for {}", stale.domain());
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            fetches: self.fetches.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}
