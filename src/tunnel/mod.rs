//! Outbound tunnels: ECH connections, their pool and the session dialer

mod connector;
mod dialer;
mod pool;
pub mod relay;

pub use connector::EchTunnelConnector;
pub use dialer::{DialerSettings, TunnelDialer};
pub use pool::{PoolStats, TunnelPool};

use crate::addr::TargetAddr;
use crate::ech::EchConfiguration;
use crate::error::Result;
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use futures::task::noop_waker_ref;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Byte stream carried by a tunnel
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelIo for T {}

static NEXT_TUNNEL_ID: AtomicU64 = AtomicU64::new(1);

/// One established outbound connection.
///
/// Reads first drain any bytes that arrived together with a relay response
/// head, then continue from the underlying stream.
pub struct TunnelConnection {
    id: u64,
    io: Box<dyn TunnelIo>,
    target: TargetAddr,
    ech: EchConfiguration,
    ech_accepted: bool,
    created_at: Instant,
    pending: BytesMut,
}

impl TunnelConnection {
    pub fn new(
        io: Box<dyn TunnelIo>,
        target: TargetAddr,
        ech: EchConfiguration,
        ech_accepted: bool,
    ) -> Self {
        Self {
            id: NEXT_TUNNEL_ID.fetch_add(1, Ordering::Relaxed),
            io,
            target,
            ech,
            ech_accepted,
            created_at: Instant::now(),
            pending: BytesMut::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &TargetAddr {
        &self.target
    }

    pub fn ech_config(&self) -> &EchConfiguration {
        &self.ech
    }

    pub fn ech_accepted(&self) -> bool {
        self.ech_accepted
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether an idle connection can still carry a new session.
    ///
    /// Polls the stream once without blocking, above TLS, so a buffered
    /// close_notify counts as a close. Bytes that arrived while idle are kept
    /// in `pending` and make the connection unfit for another session.
    pub fn is_reusable(&mut self) -> bool {
        if !self.pending.is_empty() {
            return false;
        }
        let mut cx = Context::from_waker(noop_waker_ref());
        let mut scratch = [0u8; 4096];
        let mut buf = ReadBuf::new(&mut scratch);
        match Pin::new(&mut self.io).poll_read(&mut cx, &mut buf) {
            Poll::Pending => true,
            Poll::Ready(Ok(())) if buf.filled().is_empty() => false,
            Poll::Ready(Ok(())) => {
                self.pending.extend_from_slice(buf.filled());
                false
            }
            Poll::Ready(Err(_)) => false,
        }
    }

    /// Queue bytes to be returned by the next reads before the stream itself.
    pub(crate) fn push_pending(&mut self, data: Bytes) {
        self.pending.extend_from_slice(&data);
    }

    /// Shut the connection down. Consumes it, so it can only happen once.
    pub async fn close(mut self) {
        let _ = self.io.shutdown().await;
    }
}

impl fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("ech_domain", &self.ech.domain())
            .field("ech_accepted", &self.ech_accepted)
            .finish()
    }
}

impl AsyncRead for TunnelConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.pending.is_empty() {
            let n = this.pending.len().min(buf.remaining());
            buf.put_slice(&this.pending[..n]);
            this.pending.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// Establishes tunnel connections to a forward target
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    async fn connect(
        &self,
        target: &TargetAddr,
        ech: &EchConfiguration,
        timeout: Duration,
    ) -> Result<TunnelConnection>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::generate_self_signed;
    use crate::ech::config::sample_config_list;
    use crate::tls_crypto::build_provider;
    use rustls::pki_types::ServerName;
    use rustls::{ClientConfig, RootCertStore};
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    #[tokio::test]
    async fn pending_bytes_are_read_first() {
        let (local, mut remote) = tokio::io::duplex(64);
        let ech = EchConfiguration::new(sample_config_list("c.example", 1), "c.example").unwrap();
        let mut conn = TunnelConnection::new(
            Box::new(local),
            "example.com:443".parse().unwrap(),
            ech,
            true,
        );
        conn.push_pending(Bytes::from_static(b"early"));
        assert!(!conn.is_reusable());

        remote.write_all(b"-later").await.unwrap();
        let mut buf = vec![0u8; 11];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early-later");
        assert!(conn.is_reusable());
    }

    fn over(io: impl TunnelIo + 'static) -> TunnelConnection {
        let ech = EchConfiguration::new(sample_config_list("c.example", 1), "c.example").unwrap();
        TunnelConnection::new(Box::new(io), "example.com:443".parse().unwrap(), ech, true)
    }

    #[tokio::test]
    async fn closed_tcp_peer_is_not_reusable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let mut conn = over(client);
        assert!(conn.is_reusable());

        drop(server);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!conn.is_reusable());
    }

    #[tokio::test]
    async fn tls_close_notify_is_not_reusable() {
        let generated = generate_self_signed(&["localhost".to_string()]).unwrap();
        let acceptor = TlsAcceptor::from(generated.server_config().unwrap());
        let mut roots = RootCertStore::empty();
        roots.add(generated.cert_der.clone()).unwrap();
        let client_config = ClientConfig::builder_with_provider(build_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(tcp).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            tls.shutdown().await.unwrap();
            let _ = closed_tx.send(());
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(tls);
        });

        let tcp = TcpStream::connect(addr).await.unwrap();
        let tls = TlsConnector::from(Arc::new(client_config))
            .connect(ServerName::try_from("localhost").unwrap(), tcp)
            .await
            .unwrap();
        let mut conn = over(tls);
        assert!(conn.is_reusable());

        closed_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!conn.is_reusable());
    }

    #[tokio::test]
    async fn unsolicited_bytes_are_kept_but_block_reuse() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut conn = over(local);
        remote.write_all(b"hello").await.unwrap();

        assert!(!conn.is_reusable());
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
