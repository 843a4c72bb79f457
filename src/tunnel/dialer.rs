//! Routes sessions onto tunnels: pooled or fresh connections, stale-config
//! retry and the relay preamble

use super::{relay, TunnelConnection, TunnelConnector, TunnelPool};
use crate::addr::TargetAddr;
use crate::ech::EchConfigCache;
use crate::error::{ErrorKind, Result, TunnelError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Static routing inputs of a dialer
#[derive(Debug, Clone)]
pub struct DialerSettings {
    pub dns_server: String,
    pub ech_domain: String,
    /// Remote relay every tunnel goes to; `None` tunnels straight to the
    /// session's own target.
    pub forward: Option<TargetAddr>,
    /// Presented to the relay in the CONNECT preamble
    pub token: Option<String>,
    pub connect_timeout: Duration,
}

struct DialerCore {
    settings: DialerSettings,
    cache: Arc<EchConfigCache>,
    connector: Arc<dyn TunnelConnector>,
    pool: Arc<TunnelPool>,
}

impl DialerCore {
    /// Connect with the cached ECH config; on a stale-config rejection,
    /// refresh the config and try exactly once more.
    async fn connect_fresh(&self, target: &TargetAddr) -> Result<TunnelConnection> {
        let settings = &self.settings;
        let ech = self
            .cache
            .get(&settings.dns_server, &settings.ech_domain)
            .await?;

        match self
            .connector
            .connect(target, &ech, settings.connect_timeout)
            .await
        {
            Err(e) if e.is_stale_config() => {
                warn!("ECH config for {} rejected by {}: {}", ech.domain(), target, e);
                self.cache.invalidate(&ech);
                let fresh = self
                    .cache
                    .get(&settings.dns_server, &settings.ech_domain)
                    .await?;
                self.connector
                    .connect(target, &fresh, settings.connect_timeout)
                    .await
                    .map_err(|e| {
                        if e.is_stale_config() {
                            TunnelError::handshake(format!(
                                "ECH config still rejected after refresh: {}",
                                e
                            ))
                        } else {
                            e
                        }
                    })
            }
            other => other,
        }
    }
}

/// Opens tunnels for sessions; keeps the forward target's pool warm.
pub struct TunnelDialer {
    core: Arc<DialerCore>,
    warmers: TaskTracker,
    cancel: CancellationToken,
}

impl TunnelDialer {
    pub fn new(
        settings: DialerSettings,
        cache: Arc<EchConfigCache>,
        connector: Arc<dyn TunnelConnector>,
        pool: Arc<TunnelPool>,
    ) -> Self {
        Self {
            core: Arc::new(DialerCore {
                settings,
                cache,
                connector,
                pool,
            }),
            warmers: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &DialerSettings {
        &self.core.settings
    }

    pub fn cache(&self) -> &EchConfigCache {
        &self.core.cache
    }

    pub fn pool(&self) -> &TunnelPool {
        &self.core.pool
    }

    /// Decide where the tunnel goes and what, if anything, the relay must
    /// connect to on the session's behalf.
    pub fn route(&self, session_target: Option<&TargetAddr>) -> Result<(TargetAddr, Option<TargetAddr>)> {
        match (&self.core.settings.forward, session_target) {
            (Some(forward), target) => Ok((forward.clone(), target.cloned())),
            (None, Some(target)) => Ok((target.clone(), None)),
            (None, None) => Err(TunnelError::Protocol(
                "session has no target and no forward address is configured".to_string(),
            )),
        }
    }

    /// Open a tunnel carrying the session's traffic.
    ///
    /// A pooled tunnel that breaks during the relay preamble is replaced by a
    /// fresh one once; answers from the relay itself are not retried.
    pub async fn open(&self, session_target: Option<&TargetAddr>) -> Result<TunnelConnection> {
        let (tunnel_target, relay_target) = self.route(session_target)?;
        let (conn, pooled) = self.acquire(&tunnel_target).await?;
        let Some(relay_target) = relay_target else {
            return Ok(conn);
        };

        match self.negotiate(conn, &relay_target).await {
            Err(e) if pooled && matches!(e.kind(), ErrorKind::ProtocolParse | ErrorKind::Other) => {
                debug!(
                    "Pooled tunnel to {} failed the relay preamble ({}), retrying on a fresh one",
                    tunnel_target, e
                );
                let conn = self.core.connect_fresh(&tunnel_target).await?;
                self.negotiate(conn, &relay_target).await
            }
            other => other,
        }
    }

    async fn negotiate(
        &self,
        mut conn: TunnelConnection,
        relay_target: &TargetAddr,
    ) -> Result<TunnelConnection> {
        let token = self.core.settings.token.as_deref();
        let timeout = self.core.settings.connect_timeout;
        let negotiated =
            match tokio::time::timeout(timeout, relay::negotiate(&mut conn, relay_target, token))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(TunnelError::Timeout(format!(
                    "relay did not answer CONNECT {} within {:?}",
                    relay_target, timeout
                ))),
            };
        match negotiated {
            Ok(early) => {
                if !early.is_empty() {
                    conn.push_pending(early);
                }
                Ok(conn)
            }
            Err(e) => {
                conn.close().await;
                Err(e)
            }
        }
    }

    /// Returns the connection and whether it came from the pool.
    async fn acquire(&self, target: &TargetAddr) -> Result<(TunnelConnection, bool)> {
        let poolable = self.core.settings.forward.as_ref() == Some(target);
        if !poolable {
            return Ok((self.core.connect_fresh(target).await?, false));
        }

        let acquired = match self.core.pool.take(target) {
            Some(conn) => {
                debug!("Reusing pooled tunnel {} to {}", conn.id(), target);
                (conn, true)
            }
            None => (self.core.connect_fresh(target).await?, false),
        };
        self.warm(target);
        Ok(acquired)
    }

    /// Pre-open tunnels to the forward target, if one is configured.
    pub fn warm_up(&self) {
        if let Some(forward) = self.core.settings.forward.clone() {
            info!("Warming {} tunnels to {}", self.core.pool.capacity(), forward);
            self.warm(&forward);
        }
    }

    fn warm(&self, target: &TargetAddr) {
        if self.cancel.is_cancelled() {
            return;
        }
        let wanted = self.core.pool.reserve_warm(target);
        for _ in 0..wanted {
            let core = self.core.clone();
            let cancel = self.cancel.clone();
            let target = target.clone();
            self.warmers.spawn(async move {
                let conn = tokio::select! {
                    _ = cancel.cancelled() => None,
                    result = core.connect_fresh(&target) => match result {
                        Ok(conn) => Some(conn),
                        Err(e) => {
                            debug!("Warming tunnel to {} failed: {}", target, e);
                            None
                        }
                    },
                };
                if let Some(extra) = core.pool.finish_warm(&target, conn) {
                    extra.close().await;
                }
            });
        }
    }

    /// Stop warming, wait for in-flight warmers and close pooled tunnels.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.warmers.close();
        self.warmers.wait().await;
        let drained = self.core.pool.drain();
        if !drained.is_empty() {
            debug!("Closing {} pooled tunnels", drained.len());
        }
        for conn in drained {
            conn.close().await;
        }
    }
}
