//! Process-facing control surface: builds a subsystem from a `ServerConfig`,
//! starts and stops it, and reports its counters.

use crate::acceptor::{
    Acceptor, LocalAcceptor, ProxyHandler, TcpForwardHandler, TunnelServices, WebSocketHandler,
};
use crate::cert::{generate_self_signed, load_server_config};
use crate::config::{ListenMode, ListenSpec, ServerConfig};
use crate::dns::{DnsLookup, ResolverPool};
use crate::ech::EchConfigCache;
use crate::error::{Result, TunnelError};
use crate::forward::ConnectionForwarder;
use crate::policy::AccessPolicy;
use crate::stats::Stats;
use crate::tunnel::{DialerSettings, EchTunnelConnector, TunnelConnector, TunnelDialer, TunnelPool};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a start or stop request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlOutcome {
    pub success: bool,
    pub message: String,
}

impl ControlOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

struct RunningService {
    acceptor: Box<dyn LocalAcceptor>,
    dialer: Arc<TunnelDialer>,
    local_addr: SocketAddr,
}

/// Owns at most one running subsystem.
///
/// `start`/`stop` calls are serialized; `is_running` and `stats` only read
/// in-memory state.
#[derive(Default)]
pub struct ServiceController {
    ops: tokio::sync::Mutex<()>,
    running: Mutex<Option<Arc<RunningService>>>,
    released: AtomicBool,
}

impl ServiceController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with the production DNS resolver and ECH connector.
    pub async fn start(&self, config: ServerConfig) -> ControlOutcome {
        let dns: Arc<dyn DnsLookup> = Arc::new(ResolverPool::new(config.dns_timeout()));
        let raw_ip = match config.raw_ip() {
            Ok(ip) => ip,
            Err(e) => return ControlOutcome::failed(e.to_string()),
        };
        let connector = EchTunnelConnector::new(dns.clone(), config.dns_server.clone())
            .with_raw_ip(raw_ip)
            .insecure(config.insecure)
            .fallback(config.fallback);
        self.start_with_backends(config, dns, Arc::new(connector))
            .await
    }

    /// Start with caller-supplied DNS and connector implementations.
    pub async fn start_with_backends(
        &self,
        config: ServerConfig,
        dns: Arc<dyn DnsLookup>,
        connector: Arc<dyn TunnelConnector>,
    ) -> ControlOutcome {
        let _ops = self.ops.lock().await;
        if self.released.load(Ordering::SeqCst) {
            return ControlOutcome::failed("controller has been released");
        }
        if let Some(running) = self.running.lock().as_ref() {
            return ControlOutcome::failed(format!(
                "already running on {}",
                running.local_addr
            ));
        }

        match launch(&config, dns, connector).await {
            Ok(service) => {
                let message = format!("listening on {}", service.local_addr);
                info!("ECH tunnel {}", message);
                *self.running.lock() = Some(Arc::new(service));
                ControlOutcome::ok(message)
            }
            Err(e) => {
                warn!("Failed to start ECH tunnel: {}", e);
                ControlOutcome::failed(e.to_string())
            }
        }
    }

    /// Stop the running subsystem. Stopping an idle controller succeeds.
    pub async fn stop(&self) -> ControlOutcome {
        let _ops = self.ops.lock().await;
        let running = self.running.lock().take();
        match running {
            Some(service) => {
                service.acceptor.stop().await;
                service.dialer.shutdown().await;
                info!("ECH tunnel on {} stopped", service.local_addr);
                ControlOutcome::ok(format!("stopped {}", service.local_addr))
            }
            None => ControlOutcome::ok("not running"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map(|service| service.acceptor.is_running())
            .unwrap_or(false)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|service| service.local_addr)
    }

    /// Nested counters of the running subsystem; zeros when idle.
    pub fn stats(&self) -> serde_json::Value {
        let running = self.running.lock().clone();
        match running {
            Some(service) => json!({
                "running": service.acceptor.is_running(),
                "local_addr": service.local_addr.to_string(),
                "acceptor": service.acceptor.stats(),
                "ech_cache": service.dialer.cache().stats(),
                "pool": service.dialer.pool().stats(),
            }),
            None => json!({
                "running": false,
                "acceptor": Stats::new().snapshot(),
            }),
        }
    }

    /// Stop everything and refuse further starts.
    pub async fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.stop().await;
    }
}

async fn launch(
    config: &ServerConfig,
    dns: Arc<dyn DnsLookup>,
    connector: Arc<dyn TunnelConnector>,
) -> Result<RunningService> {
    let spec = config.validate()?;
    let forward = config.forward_target()?;
    let token = config.token().map(str::to_string);

    let cache = Arc::new(EchConfigCache::new(
        dns.clone(),
        config.ech_ttl(),
        config.dns_timeout(),
    ));
    let pool_size = if forward.is_some() {
        config.connection_num
    } else {
        0
    };
    let pool = Arc::new(TunnelPool::new(pool_size, config.pool_idle_timeout()));
    let dialer = Arc::new(TunnelDialer::new(
        DialerSettings {
            dns_server: config.dns_server.clone(),
            ech_domain: config.ech_domain.clone(),
            forward,
            token: token.clone(),
            connect_timeout: config.connect_timeout(),
        },
        cache,
        connector,
        pool,
    ));

    let stats = Arc::new(Stats::new());
    let services = Arc::new(TunnelServices {
        dialer: dialer.clone(),
        forwarder: ConnectionForwarder::new(stats.clone(), config.half_close_grace()),
        policy: AccessPolicy::new(config.allowed_cidrs()?, token),
        dns,
        dns_server: config.dns_server.clone(),
        stats,
    });

    let acceptor = build_acceptor(config, spec, services)?;
    let local_addr = acceptor.start().await?;
    dialer.warm_up();

    Ok(RunningService {
        acceptor,
        dialer,
        local_addr,
    })
}

fn build_acceptor(
    config: &ServerConfig,
    spec: ListenSpec,
    services: Arc<TunnelServices>,
) -> Result<Box<dyn LocalAcceptor>> {
    let drain = config.drain_timeout();
    let acceptor: Box<dyn LocalAcceptor> = match spec.mode {
        ListenMode::Tcp { target } => Box::new(Acceptor::new(
            spec.addr,
            TcpForwardHandler::new(target),
            services,
            drain,
        )),
        ListenMode::Proxy => Box::new(Acceptor::new(spec.addr, ProxyHandler, services, drain)),
        ListenMode::WebSocket { path, tls } => {
            let tls_config = if tls {
                Some(listener_tls(config, &spec.addr)?)
            } else {
                None
            };
            Box::new(Acceptor::new(
                spec.addr,
                WebSocketHandler::new(path, tls_config),
                services,
                drain,
            ))
        }
    };
    Ok(acceptor)
}

fn listener_tls(config: &ServerConfig, listen_addr: &str) -> Result<Arc<rustls::ServerConfig>> {
    match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => load_server_config(cert, key),
        (None, None) => {
            let host = listen_addr
                .rsplit_once(':')
                .map(|(host, _)| host.trim_start_matches('[').trim_end_matches(']'))
                .filter(|host| !host.is_empty() && *host != "0.0.0.0" && *host != "::")
                .unwrap_or("localhost");
            info!("No listener certificate configured, generating one for {}", host);
            generate_self_signed(&[host.to_string()])?.server_config()
        }
        _ => Err(TunnelError::Config(
            "cert_path and key_path must be set together".to_string(),
        )),
    }
}
