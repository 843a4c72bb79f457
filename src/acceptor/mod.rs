//! Local entry points: transparent TCP, SOCKS5/HTTP proxy and WebSocket relay
//!
//! All three share one lifecycle ([`Acceptor`]) and differ only in how a
//! session negotiates its destination ([`SessionHandler`]).

mod http;
mod proxy;
mod socks5;
mod tcp;
mod websocket;

pub use proxy::ProxyHandler;
pub use tcp::TcpForwardHandler;
pub use websocket::WebSocketHandler;

use crate::dns::DnsLookup;
use crate::error::{Result, TunnelError};
use crate::forward::{ConnectionForwarder, ForwardOutcome};
use crate::policy::AccessPolicy;
use crate::session::ClientSession;
use crate::stats::{Stats, StatsSnapshot};
use crate::tunnel::{TunnelConnection, TunnelDialer};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Local client stream after any listener-side TLS
pub trait ClientIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ClientIo for T {}

/// Lifecycle of a local acceptor
#[async_trait]
pub trait LocalAcceptor: Send + Sync {
    /// Bind and start accepting. Returns the bound address.
    async fn start(&self) -> Result<SocketAddr>;
    /// Stop accepting, cancel and drain sessions. Idempotent.
    async fn stop(&self);
    fn is_running(&self) -> bool;
    fn stats(&self) -> StatsSnapshot;
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Per-variant session negotiation
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Negotiate, open a tunnel and forward. Errors are returned only for
    /// sessions that never reached forwarding; the handler has already sent
    /// the client whatever protocol reply fits.
    async fn handle(
        &self,
        stream: TcpStream,
        session: ClientSession,
        services: &TunnelServices,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// What every session needs once its destination is known
pub struct TunnelServices {
    pub dialer: Arc<TunnelDialer>,
    pub forwarder: ConnectionForwarder,
    pub policy: AccessPolicy,
    pub dns: Arc<dyn DnsLookup>,
    pub dns_server: String,
    pub stats: Arc<Stats>,
}

impl TunnelServices {
    /// Check the session's destination against the policy, then open its
    /// tunnel. No tunnel is requested for a denied destination.
    pub async fn connect(&self, session: &ClientSession) -> Result<TunnelConnection> {
        if let Some(target) = session.target() {
            self.policy
                .check_destination(target, self.dns.as_ref(), &self.dns_server)
                .await?;
        }
        self.dialer.open(session.target()).await
    }

    pub async fn forward<C>(
        &self,
        session: &ClientSession,
        client: C,
        tunnel: TunnelConnection,
        cancel: &CancellationToken,
    ) -> ForwardOutcome
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.forwarder.forward(session, client, tunnel, cancel).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct Running {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
}

/// Listener plus session set, generic over the negotiation variant
pub struct Acceptor<H: SessionHandler> {
    listen_addr: String,
    handler: Arc<H>,
    services: Arc<TunnelServices>,
    drain_timeout: Duration,
    state: Mutex<AcceptorState>,
    running: Mutex<Option<Running>>,
    /// Signalled whenever the state settles back to Stopped or Running
    settled: Notify,
}

impl<H: SessionHandler> Acceptor<H> {
    pub fn new(
        listen_addr: impl Into<String>,
        handler: H,
        services: Arc<TunnelServices>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            handler: Arc::new(handler),
            services,
            drain_timeout,
            state: Mutex::new(AcceptorState::Stopped),
            running: Mutex::new(None),
            settled: Notify::new(),
        }
    }

    pub fn state(&self) -> AcceptorState {
        *self.state.lock()
    }

    pub fn services(&self) -> &Arc<TunnelServices> {
        &self.services
    }

    fn settle(&self, state: AcceptorState) {
        *self.state.lock() = state;
        self.settled.notify_waiters();
    }

    /// Go from Starting to Running, unless a stop arrived while binding.
    fn finish_start(&self, listener: TcpListener, local_addr: SocketAddr) -> Result<SocketAddr> {
        {
            let mut state = self.state.lock();
            if *state == AcceptorState::Starting {
                let cancel = CancellationToken::new();
                let accept_task = tokio::spawn(accept_loop(
                    listener,
                    self.handler.clone(),
                    self.services.clone(),
                    cancel.clone(),
                    self.drain_timeout,
                ));
                *self.running.lock() = Some(Running {
                    local_addr,
                    cancel,
                    accept_task,
                });
                *state = AcceptorState::Running;
            } else {
                drop(state);
                drop(listener);
                info!("{} acceptor stopped while starting", self.handler.name());
                self.settle(AcceptorState::Stopped);
                return Err(TunnelError::Cancelled);
            }
        }
        self.settled.notify_waiters();
        info!("{} acceptor listening on {}", self.handler.name(), local_addr);
        Ok(local_addr)
    }
}

#[async_trait]
impl<H: SessionHandler> LocalAcceptor for Acceptor<H> {
    async fn start(&self) -> Result<SocketAddr> {
        {
            let mut state = self.state.lock();
            if *state != AcceptorState::Stopped {
                return Err(TunnelError::Config(format!(
                    "{} acceptor is already {:?}",
                    self.handler.name(),
                    *state
                )));
            }
            *state = AcceptorState::Starting;
        }

        let bound = match TcpListener::bind(&self.listen_addr).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                self.settle(AcceptorState::Stopped);
                return Err(TunnelError::Bind {
                    addr: self.listen_addr.clone(),
                    source,
                });
            }
        };

        self.finish_start(listener, local_addr)
    }

    /// Stop accepting, cancel sessions and wait for them. A stop that lands
    /// while the listener is still binding waits for `start` to give up.
    async fn stop(&self) {
        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            let running = {
                let mut state = self.state.lock();
                match *state {
                    AcceptorState::Stopped => return,
                    AcceptorState::Running => {
                        *state = AcceptorState::Stopping;
                        self.running.lock().take()
                    }
                    AcceptorState::Starting => {
                        *state = AcceptorState::Stopping;
                        None
                    }
                    AcceptorState::Stopping => None,
                }
            };

            let Some(running) = running else {
                settled.await;
                continue;
            };
            info!("Stopping {} acceptor on {}", self.handler.name(), running.local_addr);
            running.cancel.cancel();
            if let Err(e) = running.accept_task.await {
                warn!("{} accept loop ended abnormally: {}", self.handler.name(), e);
            }
            self.settle(AcceptorState::Stopped);
            return;
        }
    }

    fn is_running(&self) -> bool {
        *self.state.lock() == AcceptorState::Running
    }

    fn stats(&self) -> StatsSnapshot {
        self.services.stats.snapshot()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }
}

async fn accept_loop<H: SessionHandler>(
    listener: TcpListener,
    handler: Arc<H>,
    services: Arc<TunnelServices>,
    cancel: CancellationToken,
    drain_timeout: Duration,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    services.stats.record_accepted();
                    let _ = stream.set_nodelay(true);
                    sessions.spawn(run_session(
                        handler.clone(),
                        services.clone(),
                        stream,
                        peer,
                        cancel.child_token(),
                    ));
                }
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    warn!("{} accept failed: {}", handler.name(), e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }
    drop(listener);

    let active = sessions.len();
    if active > 0 {
        debug!("Draining {} {} sessions", active, handler.name());
    }
    let drained = tokio::time::timeout(drain_timeout, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "Aborting {} {} sessions still open after {:?}",
            sessions.len(),
            handler.name(),
            drain_timeout
        );
        sessions.abort_all();
        while sessions.join_next().await.is_some() {}
    }
}

async fn run_session<H: SessionHandler>(
    handler: Arc<H>,
    services: Arc<TunnelServices>,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let session = ClientSession::new(peer);
    let id = session.id();
    let _active = services.stats.session_guard();
    debug!("Session {} from {} on {}", id, peer, handler.name());

    if let Err(e) = handler.handle(stream, session, &services, &cancel).await {
        services.stats.record_rejected(e.kind());
        match e.kind() {
            crate::error::ErrorKind::ProtocolParse | crate::error::ErrorKind::PolicyDenied => {
                debug!("Session {} from {} rejected: {}", id, peer, e)
            }
            _ => warn!("Session {} from {} failed: {}", id, peer, e),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-crate doubles for handler tests

    use super::*;
    use crate::addr::TargetAddr;
    use crate::dns::FetchError;
    use crate::ech::config::sample_config_list;
    use crate::ech::{EchConfigCache, EchConfiguration};
    use crate::tunnel::{DialerSettings, TunnelConnector, TunnelPool};
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    pub struct StaticDns;

    #[async_trait]
    impl DnsLookup for StaticDns {
        async fn fetch_ech_config_list(
            &self,
            _dns_server: &str,
            domain: &str,
        ) -> std::result::Result<Vec<u8>, FetchError> {
            Ok(sample_config_list(domain, 1))
        }

        async fn lookup_ip(&self, _dns_server: &str, _host: &str) -> Result<Vec<IpAddr>> {
            Ok(vec![IpAddr::from([93, 184, 216, 34])])
        }
    }

    /// Tunnels to an in-memory echo server; counts connect calls.
    #[derive(Default)]
    pub struct EchoConnector {
        pub calls: AtomicUsize,
    }

    impl EchoConnector {
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TunnelConnector for EchoConnector {
        async fn connect(
            &self,
            target: &TargetAddr,
            ech: &EchConfiguration,
            _timeout: Duration,
        ) -> Result<TunnelConnection> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (local, mut remote) = tokio::io::duplex(64 * 1024);
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match remote.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if remote.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
            Ok(TunnelConnection::new(Box::new(local), target.clone(), ech.clone(), true))
        }
    }

    pub fn services(
        connector: Arc<EchoConnector>,
        cidrs: &str,
        token: Option<&str>,
    ) -> Arc<TunnelServices> {
        let dns: Arc<dyn DnsLookup> = Arc::new(StaticDns);
        let cache = Arc::new(EchConfigCache::new(
            dns.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(1),
        ));
        let dialer = TunnelDialer::new(
            DialerSettings {
                dns_server: "dns".to_string(),
                ech_domain: "cloudflare-ech.com".to_string(),
                forward: None,
                token: None,
                connect_timeout: Duration::from_secs(1),
            },
            cache,
            connector,
            Arc::new(TunnelPool::new(0, Duration::from_secs(60))),
        );
        let stats = Arc::new(Stats::new());
        Arc::new(TunnelServices {
            dialer: Arc::new(dialer),
            forwarder: ConnectionForwarder::new(stats.clone(), Duration::from_millis(200)),
            policy: AccessPolicy::new(
                crate::config::parse_cidr_list(cidrs).unwrap(),
                token.map(str::to_string),
            ),
            dns,
            dns_server: "dns".to_string(),
            stats,
        })
    }
}
