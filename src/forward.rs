//! Bidirectional byte pump between a local client and its tunnel

use crate::session::ClientSession;
use crate::stats::Stats;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const BUFFER_SIZE: usize = 32 * 1024;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Why forwarding stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Both directions reached EOF, or one did and the grace period ran out
    Eof,
    Cancelled,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardOutcome {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub reason: CloseReason,
}

pub struct ConnectionForwarder {
    stats: Arc<Stats>,
    half_close_grace: Duration,
}

impl ConnectionForwarder {
    pub fn new(stats: Arc<Stats>, half_close_grace: Duration) -> Self {
        Self {
            stats,
            half_close_grace,
        }
    }

    /// Pump bytes both ways until EOF, error or cancellation. Both streams
    /// are shut down and dropped before this returns.
    pub async fn forward<C, T>(
        &self,
        session: &ClientSession,
        client: C,
        tunnel: T,
        cancel: &CancellationToken,
    ) -> ForwardOutcome
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut tunnel_r, mut tunnel_w) = tokio::io::split(tunnel);

        let reason = {
            let upload = async {
                let initial = session.initial_payload();
                if !initial.is_empty() {
                    tunnel_w.write_all(initial).await?;
                    tunnel_w.flush().await?;
                    self.count_in(session, initial.len());
                }
                pump(&mut client_r, &mut tunnel_w, |n| self.count_in(session, n)).await
            };
            let download = pump(&mut tunnel_r, &mut client_w, |n| self.count_out(session, n));
            tokio::pin!(upload, download);

            let grace = tokio::time::sleep(self.half_close_grace);
            tokio::pin!(grace);
            let mut upload_done = false;
            let mut download_done = false;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break CloseReason::Cancelled,
                    result = &mut upload, if !upload_done => match result {
                        Ok(()) => {
                            upload_done = true;
                            if download_done {
                                break CloseReason::Eof;
                            }
                            grace.as_mut().reset(Instant::now() + self.half_close_grace);
                        }
                        Err(e) => break CloseReason::Error(format!("client side: {}", e)),
                    },
                    result = &mut download, if !download_done => match result {
                        Ok(()) => {
                            download_done = true;
                            if upload_done {
                                break CloseReason::Eof;
                            }
                            grace.as_mut().reset(Instant::now() + self.half_close_grace);
                        }
                        Err(e) => break CloseReason::Error(format!("tunnel side: {}", e)),
                    },
                    _ = &mut grace, if upload_done || download_done => {
                        debug!("Session {} half-close grace expired", session.id());
                        break CloseReason::Eof;
                    }
                }
            }
        };

        let mut client = client_r.unsplit(client_w);
        let mut tunnel = tunnel_r.unsplit(tunnel_w);
        let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, tunnel.shutdown()).await;
        let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, client.shutdown()).await;
        drop(tunnel);
        drop(client);

        let outcome = ForwardOutcome {
            bytes_in: session.bytes_in(),
            bytes_out: session.bytes_out(),
            reason,
        };
        debug!(
            "Session {} finished: {:?} (in {} / out {})",
            session.id(),
            outcome.reason,
            outcome.bytes_in,
            outcome.bytes_out
        );
        outcome
    }

    fn count_in(&self, session: &ClientSession, n: usize) {
        session.add_bytes_in(n as u64);
        self.stats.add_bytes_in(n as u64);
    }

    fn count_out(&self, session: &ClientSession, n: usize) {
        session.add_bytes_out(n as u64);
        self.stats.add_bytes_out(n as u64);
    }
}

/// Copy until EOF, then shut the writer down to pass the half-close on.
async fn pump<R, W, F>(reader: &mut R, writer: &mut W, mut on_write: F) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(usize),
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        on_write(n);
    }
}
