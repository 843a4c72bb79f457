//! WebSocket relay: one upgraded connection per session, binary frames as bytes

use super::{ClientIo, SessionHandler, TunnelServices};
use crate::addr::TargetAddr;
use crate::error::{ErrorKind, Result, TunnelError};
use crate::policy::{token_from_authorization, AccessPolicy};
use crate::session::ClientSession;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::{Sink, SinkExt, Stream};
use http::header::{HeaderValue, AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use http::StatusCode;
use percent_encoding::percent_decode_str;
use std::borrow::Cow;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const TARGET_HEADER: &str = "x-target";

/// Accepts `ws://` (or `wss://` when given a TLS acceptor) upgrades.
pub struct WebSocketHandler {
    path: Option<String>,
    tls: Option<TlsAcceptor>,
}

impl WebSocketHandler {
    pub fn new(path: Option<String>, tls: Option<Arc<rustls::ServerConfig>>) -> Self {
        Self {
            path,
            tls: tls.map(TlsAcceptor::from),
        }
    }
}

/// What the upgrade request asked for
#[derive(Debug)]
struct UpgradeRequest {
    target: Option<TargetAddr>,
    protocol: Option<HeaderValue>,
}

fn inspect_request(request: &Request, policy: &AccessPolicy) -> Result<UpgradeRequest> {
    let offered: Vec<&str> = request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    // A browser can only pass the token as a subprotocol, and the chosen
    // subprotocol has to be echoed back.
    let mut protocol = offered.first().copied();
    if policy.requires_token() {
        if let Some(matching) = offered
            .iter()
            .find(|p| policy.verify_token(Some(**p)).is_ok())
        {
            protocol = Some(*matching);
        } else {
            let bearer = request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(token_from_authorization);
            policy.verify_token(bearer.as_deref().or(offered.first().copied()))?;
        }
    }

    let target = match request.headers().get(TARGET_HEADER) {
        Some(value) => Some(value.to_str().map_err(|_| {
            TunnelError::Protocol("X-Target is not valid text".to_string())
        })?),
        None => None,
    }
    .map(str::to_string)
    .or_else(|| query_param(request.uri().query().unwrap_or(""), "target"))
    .map(|raw| {
        TargetAddr::parse_with_default(raw.trim(), Some(443))
            .map_err(|e| TunnelError::Protocol(format!("bad target {}: {}", raw, e)))
    })
    .transpose()?;

    Ok(UpgradeRequest {
        target,
        protocol: protocol.and_then(|p| HeaderValue::from_str(p).ok()),
    })
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| percent_decode_str(value).decode_utf8_lossy().into_owned())
        .filter(|value| !value.is_empty())
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Auth => StatusCode::UNAUTHORIZED,
        ErrorKind::PolicyDenied => StatusCode::FORBIDDEN,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn error_response(status: StatusCode) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(status.canonical_reason().unwrap_or("").to_string()));
    *response.status_mut() = status;
    response
}

fn close_code(kind: ErrorKind) -> CloseCode {
    match kind {
        ErrorKind::PolicyDenied | ErrorKind::Auth => CloseCode::Policy,
        ErrorKind::ProtocolParse => CloseCode::Protocol,
        _ => CloseCode::Error,
    }
}

impl WebSocketHandler {
    async fn upgrade(
        &self,
        stream: TcpStream,
        session: &mut ClientSession,
        services: &TunnelServices,
    ) -> Result<WebSocketStream<Box<dyn ClientIo>>> {
        let io: Box<dyn ClientIo> = match &self.tls {
            Some(acceptor) => Box::new(
                acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| TunnelError::handshake(format!("listener TLS: {}", e)))?,
            ),
            None => Box::new(stream),
        };

        let mut inspected: Option<Result<UpgradeRequest>> = None;
        let callback = |request: &Request, mut response: Response| {
            if let Some(path) = self.path.as_deref() {
                if request.uri().path() != path {
                    inspected = Some(Err(TunnelError::Protocol(format!(
                        "unexpected path {}",
                        request.uri().path()
                    ))));
                    return Err(error_response(StatusCode::NOT_FOUND));
                }
            }
            match inspect_request(request, &services.policy) {
                Ok(upgrade) => {
                    if let Some(protocol) = &upgrade.protocol {
                        response
                            .headers_mut()
                            .insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
                    }
                    inspected = Some(Ok(upgrade));
                    Ok(response)
                }
                Err(e) => {
                    let rejection = error_response(status_for(e.kind()));
                    inspected = Some(Err(e));
                    Err(rejection)
                }
            }
        };

        let upgraded = tokio_tungstenite::accept_hdr_async(io, callback).await;
        let ws = match (upgraded, inspected) {
            (Ok(ws), Some(Ok(upgrade))) => {
                if let Some(target) = upgrade.target {
                    session.set_target(target);
                }
                ws
            }
            (_, Some(Err(e))) => return Err(e),
            (Err(e), _) => {
                return Err(TunnelError::Protocol(format!("WebSocket upgrade: {}", e)))
            }
            (Ok(_), None) => {
                return Err(TunnelError::Protocol("upgrade without a request".to_string()))
            }
        };
        debug!(
            "Session {} upgraded to WebSocket, target {:?}",
            session.id(),
            session.target()
        );
        Ok(ws)
    }
}

#[async_trait]
impl SessionHandler for WebSocketHandler {
    fn name(&self) -> &'static str {
        if self.tls.is_some() {
            "wss"
        } else {
            "ws"
        }
    }

    async fn handle(
        &self,
        stream: TcpStream,
        mut session: ClientSession,
        services: &TunnelServices,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<()> {
        let mut ws = tokio::select! {
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
            upgraded = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.upgrade(stream, &mut session, services)) => match upgraded {
                Ok(ws) => ws?,
                Err(_) => return Err(TunnelError::Timeout("WebSocket upgrade".to_string())),
            },
        };

        let tunnel = match services.connect(&session).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                let frame = CloseFrame {
                    code: close_code(e.kind()),
                    reason: Cow::Borrowed(e.kind().as_str()),
                };
                let _ = ws.send(Message::Close(Some(frame))).await;
                return Err(e);
            }
        };

        services
            .forward(&session, WsByteStream::new(ws), tunnel, cancel)
            .await;
        Ok(())
    }
}

/// Byte stream over a WebSocket: each write is one binary frame, reads
/// concatenate data frames and end at a close frame.
pub(crate) struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    pending: Bytes,
    closed: bool,
}

impl<S> WsByteStream<S> {
    pub(crate) fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            closed: false,
        }
    }
}

fn ws_io_error(e: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                buf.put_slice(&self.pending[..n]);
                self.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            if self.closed {
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(message))) => match message {
                    Message::Binary(data) => self.pending = Bytes::from(data),
                    Message::Text(text) => self.pending = Bytes::from(text.into_bytes()),
                    Message::Close(_) => self.closed = true,
                    // Pings are answered by tungstenite itself.
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                },
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(ws_io_error(e))),
                Poll::Ready(None) => self.closed = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = Pin::new(&mut self.inner);
        match inner.as_mut().poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(ws_io_error(e))),
            Poll::Pending => return Poll::Pending,
        }
        inner
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(ws_io_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(ws_io_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.inner).poll_close(cx) {
            Poll::Ready(Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed))
            | Poll::Ready(Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed)) => {
                Poll::Ready(Ok(()))
            }
            other => other.map_err(ws_io_error),
        }
    }
}
