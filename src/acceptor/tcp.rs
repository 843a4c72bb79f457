use super::{SessionHandler, TunnelServices};
use crate::addr::TargetAddr;
use crate::error::Result;
use crate::session::ClientSession;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Transparent forwarder: every connection goes to one fixed destination.
///
/// Without a target the forward address itself is the destination.
pub struct TcpForwardHandler {
    target: Option<TargetAddr>,
}

impl TcpForwardHandler {
    pub fn new(target: Option<TargetAddr>) -> Self {
        Self { target }
    }
}

#[async_trait]
impl SessionHandler for TcpForwardHandler {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn handle(
        &self,
        stream: TcpStream,
        mut session: ClientSession,
        services: &TunnelServices,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Some(target) = &self.target {
            session.set_target(target.clone());
        }

        // Nothing to reply on a raw stream; failing just closes it.
        let tunnel = services.connect(&session).await?;
        debug!(
            "Session {} tunnelled to {:?} via {}",
            session.id(),
            session.target(),
            tunnel.target()
        );
        services.forward(&session, stream, tunnel, cancel).await;
        Ok(())
    }
}
