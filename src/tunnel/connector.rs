//! ECH (Encrypted Client Hello) TLS connection establishment
//!
//! The outer ClientHello carries the public name from the ECH config; the
//! encrypted inner one carries the forward target's host.

use super::{TunnelConnection, TunnelConnector};
use crate::addr::TargetAddr;
use crate::dns::DnsLookup;
use crate::ech::EchConfiguration;
use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{EchConfig, EchMode, EchStatus};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, DigitallySignedStruct, PeerIncompatible, RootCertStore, SignatureScheme,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// rustls-based tunnel connector
pub struct EchTunnelConnector {
    dns: Arc<dyn DnsLookup>,
    dns_server: String,
    raw_ip: Option<IpAddr>,
    root_store: Arc<RootCertStore>,
    crypto_provider: Arc<CryptoProvider>,
    insecure: bool,
    fallback: bool,
}

impl EchTunnelConnector {
    pub fn new(dns: Arc<dyn DnsLookup>, dns_server: impl Into<String>) -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        Self {
            dns,
            dns_server: dns_server.into(),
            raw_ip: None,
            root_store: Arc::new(root_store),
            crypto_provider: crate::tls_crypto::build_provider(),
            insecure: false,
            fallback: false,
        }
    }

    /// Send TCP to this address instead of resolving the target host.
    pub fn with_raw_ip(mut self, raw_ip: Option<IpAddr>) -> Self {
        self.raw_ip = raw_ip;
        self
    }

    pub fn with_root_store(mut self, root_store: RootCertStore) -> Self {
        self.root_store = Arc::new(root_store);
        self
    }

    /// Skip server certificate verification.
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Use plain TLS when the ECH config cannot be used locally.
    pub fn fallback(mut self, fallback: bool) -> Self {
        self.fallback = fallback;
        self
    }

    /// Build the client config, with ECH when the configuration is usable.
    /// Returns whether ECH is enabled on the config.
    fn build_tls_config(&self, ech: &EchConfiguration) -> Result<(Arc<ClientConfig>, bool)> {
        let hpke_suites = rustls::crypto::aws_lc_rs::hpke::ALL_SUPPORTED_SUITES;

        let (builder, ech_enabled) = match EchConfig::new(ech.config_list(), hpke_suites) {
            Ok(ech_config) => {
                // with_ech implies TLS 1.3
                let builder = ClientConfig::builder_with_provider(self.crypto_provider.clone())
                    .with_ech(EchMode::Enable(ech_config))?;
                (builder, true)
            }
            Err(e) if self.fallback => {
                warn!(
                    "ECH config for {} unusable, falling back to standard TLS: {}",
                    ech.domain(),
                    e
                );
                let builder = ClientConfig::builder_with_provider(self.crypto_provider.clone())
                    .with_safe_default_protocol_versions()?;
                (builder, false)
            }
            Err(e) => {
                return Err(TunnelError::handshake(format!(
                    "ECH config for {} unusable: {}",
                    ech.domain(),
                    e
                )))
            }
        };

        let config = if self.insecure {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification(
                    self.crypto_provider.clone(),
                )))
                .with_no_client_auth()
        } else {
            builder
                .with_root_certificates(self.root_store.clone())
                .with_no_client_auth()
        };

        Ok((Arc::new(config), ech_enabled))
    }

    async fn resolve(&self, target: &TargetAddr) -> Result<Vec<SocketAddr>> {
        if let Some(ip) = self.raw_ip {
            return Ok(vec![SocketAddr::new(ip, target.port())]);
        }
        match target {
            TargetAddr::Ip(addr) => Ok(vec![*addr]),
            TargetAddr::Domain(host, port) => {
                let addrs = self.dns.lookup_ip(&self.dns_server, host).await?;
                Ok(addrs
                    .into_iter()
                    .map(|ip| SocketAddr::new(ip, *port))
                    .collect())
            }
        }
    }

    async fn connect_tcp(&self, target: &TargetAddr, addrs: Vec<SocketAddr>) -> Result<TcpStream> {
        let mut last_error = None;
        for addr in addrs {
            debug!("Trying to connect to {} via {}", target, addr);
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Err(e) => {
                    warn!("Failed to connect to {}: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(TunnelError::Connect {
            target: target.to_string(),
            source: last_error.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses to try")
            }),
        })
    }

    async fn establish(
        &self,
        target: &TargetAddr,
        ech: &EchConfiguration,
    ) -> Result<TunnelConnection> {
        let start = Instant::now();
        let (tls_config, ech_enabled) = self.build_tls_config(ech)?;
        let connector = TlsConnector::from(tls_config);

        let server_name = ServerName::try_from(target.host().to_string())
            .map_err(|_| TunnelError::Config(format!("Invalid server name: {}", target.host())))?;

        let addrs = self.resolve(target).await?;
        let tcp = self.connect_tcp(target, addrs).await?;
        let peer = tcp.peer_addr().ok();

        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(classify_handshake_error)?;

        let (_, conn) = tls.get_ref();
        let ech_status = conn.ech_status();
        info!(
            "Tunnel to {} established via {:?} (ECH status: {:?})",
            target, peer, ech_status
        );
        debug!(
            "TLS connect to {} completed in {} ms, protocol: {:?}",
            target,
            start.elapsed().as_millis(),
            conn.protocol_version()
        );

        let ech_accepted = ech_enabled && matches!(ech_status, EchStatus::Accepted);
        Ok(TunnelConnection::new(
            Box::new(tls),
            target.clone(),
            ech.clone(),
            ech_accepted,
        ))
    }
}

#[async_trait]
impl TunnelConnector for EchTunnelConnector {
    async fn connect(
        &self,
        target: &TargetAddr,
        ech: &EchConfiguration,
        timeout: Duration,
    ) -> Result<TunnelConnection> {
        match tokio::time::timeout(timeout, self.establish(target, ech)).await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::Timeout(format!(
                "connecting to {} took longer than {:?}",
                target, timeout
            ))),
        }
    }
}

/// Map a failed handshake onto the error taxonomy, flagging ECH rejections.
fn classify_handshake_error(e: std::io::Error) -> TunnelError {
    let tls_error = e
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());

    match tls_error {
        Some(
            tls_error @ rustls::Error::PeerIncompatible(
                PeerIncompatible::ServerRejectedEncryptedClientHello(_),
            ),
        ) => TunnelError::stale_config(tls_error.to_string()),
        Some(tls_error) => TunnelError::handshake(tls_error.to_string()),
        None => match e.kind() {
            std::io::ErrorKind::TimedOut => TunnelError::Timeout(e.to_string()),
            _ => TunnelError::handshake(e.to_string()),
        },
    }
}

/// Accepts any server certificate; only used with `insecure`.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::generate_self_signed;
    use crate::dns::FetchError;
    use crate::ech::config::sample_config_list;
    use crate::error::ErrorKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    struct LocalDns;

    #[async_trait]
    impl DnsLookup for LocalDns {
        async fn fetch_ech_config_list(
            &self,
            _dns_server: &str,
            _domain: &str,
        ) -> std::result::Result<Vec<u8>, FetchError> {
            Err(FetchError::Resolution("unused".into()))
        }

        async fn lookup_ip(&self, _dns_server: &str, _host: &str) -> Result<Vec<IpAddr>> {
            Ok(vec![IpAddr::from([127, 0, 0, 1])])
        }
    }

    /// ECH config whose KEM no HPKE suite supports
    fn unusable_config() -> EchConfiguration {
        let mut list = sample_config_list("localhost", 1);
        list[7] = 0x99;
        list[8] = 0x99;
        EchConfiguration::new(list, "localhost").unwrap()
    }

    /// TLS echo server for "localhost"; returns its port and a trusting root store.
    async fn echo_server() -> (u16, RootCertStore) {
        let generated = generate_self_signed(&["localhost".to_string()]).unwrap();
        let mut roots = RootCertStore::empty();
        roots.add(generated.cert_der.clone()).unwrap();
        let acceptor = TlsAcceptor::from(generated.server_config().unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(mut tls) = acceptor.accept(tcp).await {
                        let mut buf = [0u8; 64];
                        while let Ok(n) = tls.read(&mut buf).await {
                            if n == 0 || tls.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                            let _ = tls.flush().await;
                        }
                    }
                });
            }
        });
        (port, roots)
    }

    fn target(port: u16) -> TargetAddr {
        TargetAddr::Domain("localhost".to_string(), port)
    }

    #[tokio::test]
    async fn unusable_config_without_fallback_is_not_stale() {
        let (port, roots) = echo_server().await;
        let connector = EchTunnelConnector::new(Arc::new(LocalDns), "dns").with_root_store(roots);

        let err = connector
            .connect(&target(port), &unusable_config(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Handshake);
        assert!(!err.is_stale_config());
    }

    #[tokio::test]
    async fn fallback_connects_without_ech() {
        let (port, roots) = echo_server().await;
        let connector = EchTunnelConnector::new(Arc::new(LocalDns), "dns")
            .with_root_store(roots)
            .fallback(true);

        let mut conn = connector
            .connect(&target(port), &unusable_config(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!conn.ech_accepted());
        assert_eq!(conn.target(), &target(port));

        conn.write_all(b"ping").await.unwrap();
        conn.flush().await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        conn.close().await;
    }

    #[tokio::test]
    async fn ech_rejected_by_server_is_stale() {
        let (port, roots) = echo_server().await;
        let connector = EchTunnelConnector::new(Arc::new(LocalDns), "dns").with_root_store(roots);
        let ech = EchConfiguration::new(sample_config_list("localhost", 1), "localhost").unwrap();

        let err = connector
            .connect(&target(port), &ech, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_stale_config(), "unexpected error: {err}");
    }

    #[test]
    fn only_the_ech_rejection_is_stale() {
        let rejected = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            rustls::Error::PeerIncompatible(PeerIncompatible::ServerRejectedEncryptedClientHello(
                None,
            )),
        );
        assert!(classify_handshake_error(rejected).is_stale_config());

        let other = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            rustls::Error::PeerIncompatible(PeerIncompatible::Tls13RequiredForQuic),
        );
        let err = classify_handshake_error(other);
        assert_eq!(err.kind(), ErrorKind::Handshake);
        assert!(!err.is_stale_config());
    }

    #[tokio::test]
    async fn refused_connection_is_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = EchTunnelConnector::new(Arc::new(LocalDns), "dns").fallback(true);
        let err = connector
            .connect(&target(port), &unusable_config(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connect);
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((tcp, _)) = listener.accept().await {
                held.push(tcp);
            }
        });

        let connector = EchTunnelConnector::new(Arc::new(LocalDns), "dns").fallback(true);
        let err = connector
            .connect(&target(port), &unusable_config(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn raw_ip_overrides_resolution() {
        struct NoDns;

        #[async_trait]
        impl DnsLookup for NoDns {
            async fn fetch_ech_config_list(
                &self,
                _dns_server: &str,
                _domain: &str,
            ) -> std::result::Result<Vec<u8>, FetchError> {
                Err(FetchError::Resolution("unused".into()))
            }

            async fn lookup_ip(&self, _dns_server: &str, host: &str) -> Result<Vec<IpAddr>> {
                Err(FetchError::Network("offline".into()).into_tunnel_error(host))
            }
        }

        let (port, roots) = echo_server().await;
        let connector = EchTunnelConnector::new(Arc::new(NoDns), "dns")
            .with_root_store(roots)
            .with_raw_ip(Some(IpAddr::from([127, 0, 0, 1])))
            .fallback(true);
        let conn = connector
            .connect(&target(port), &unusable_config(), Duration::from_secs(5))
            .await
            .unwrap();
        conn.close().await;
    }
}
