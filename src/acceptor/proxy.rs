use super::{http, socks5, SessionHandler, TunnelServices};
use crate::error::{Result, TunnelError};
use crate::session::ClientSession;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Deadline for a client to finish its SOCKS5/HTTP negotiation
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// SOCKS5 and HTTP proxy on one port, told apart by the first byte.
#[derive(Debug, Default)]
pub struct ProxyHandler;

#[async_trait]
impl SessionHandler for ProxyHandler {
    fn name(&self) -> &'static str {
        "proxy"
    }

    async fn handle(
        &self,
        mut stream: TcpStream,
        mut session: ClientSession,
        services: &TunnelServices,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut first = [0u8; 1];
        let peeked = tokio::select! {
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
            peeked = tokio::time::timeout(NEGOTIATION_TIMEOUT, stream.peek(&mut first)) => peeked,
        };
        match peeked {
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(TunnelError::Timeout("client sent nothing".to_string())),
        }

        let negotiation = async {
            if first[0] == socks5::VERSION {
                socks5::negotiate(&mut stream, &mut session, services).await
            } else {
                http::negotiate(&mut stream, &mut session, services).await
            }
        };
        let tunnel = tokio::select! {
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
            negotiated = tokio::time::timeout(NEGOTIATION_TIMEOUT, negotiation) => match negotiated {
                Ok(result) => result?,
                Err(_) => return Err(TunnelError::Timeout("proxy negotiation".to_string())),
            },
        };

        services.forward(&session, stream, tunnel, cancel).await;
        Ok(())
    }
}
