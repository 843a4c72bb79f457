//! HTTP proxy: CONNECT tunnels and absolute-form plain requests

use super::TunnelServices;
use crate::addr::TargetAddr;
use crate::error::{ErrorKind, Result, TunnelError};
use crate::policy::token_from_authorization;
use crate::session::ClientSession;
use crate::tunnel::relay::read_head;
use crate::tunnel::TunnelConnection;
use bytes::{Bytes, BytesMut};
use http::Uri;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const MAX_HEADERS: usize = 64;

/// Hop-by-hop headers dropped when rewriting a plain request
const HOP_HEADERS: [&str; 4] = [
    "proxy-authorization",
    "proxy-connection",
    "connection",
    "keep-alive",
];

struct ParsedRequest {
    method: String,
    target: String,
    minor_version: u8,
    headers: Vec<(String, Vec<u8>)>,
}

impl ParsedRequest {
    fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

fn parse_request(head: &[u8]) -> Result<ParsedRequest> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(TunnelError::Protocol("truncated HTTP request".to_string()))
        }
        Err(e) => return Err(TunnelError::Protocol(format!("invalid HTTP request: {}", e))),
    }

    Ok(ParsedRequest {
        method: request.method.unwrap_or_default().to_string(),
        target: request.path.unwrap_or_default().to_string(),
        minor_version: request.version.unwrap_or(1),
        headers: request
            .headers
            .iter()
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect(),
    })
}

fn status_for(kind: ErrorKind) -> (u16, &'static str) {
    match kind {
        ErrorKind::PolicyDenied => (403, "Forbidden"),
        ErrorKind::Auth => (407, "Proxy Authentication Required"),
        ErrorKind::Timeout => (504, "Gateway Timeout"),
        ErrorKind::ProtocolParse => (400, "Bad Request"),
        _ => (502, "Bad Gateway"),
    }
}

async fn respond_error<S: AsyncWrite + Unpin>(stream: &mut S, kind: ErrorKind) {
    let (code, reason) = status_for(kind);
    let mut response = format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n"
    );
    if kind == ErrorKind::Auth {
        response.push_str("Proxy-Authenticate: Basic realm=\"ech-tunnel\"\r\n");
    }
    response.push_str("\r\n");
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.flush().await;
}

/// Turn an absolute-form request into origin form for the destination.
fn rewrite_plain_request(request: &ParsedRequest, uri: &Uri, host: &str) -> Vec<u8> {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/");

    let mut out = format!(
        "{} {} HTTP/1.{}\r\n",
        request.method, path, request.minor_version
    )
    .into_bytes();
    let mut has_host = false;
    for (name, value) in &request.headers {
        let lower = name.to_ascii_lowercase();
        if HOP_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        has_host |= lower == "host";
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
    if !has_host {
        out.extend_from_slice(format!("Host: {}\r\n", host).as_bytes());
    }
    // One destination per session, so no keep-alive to a second host.
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out
}

/// Read the request, authenticate it, open the tunnel and answer the client.
/// On success the session's initial payload holds whatever must reach the
/// destination first.
pub(super) async fn negotiate<S>(
    stream: &mut S,
    session: &mut ClientSession,
    services: &TunnelServices,
) -> Result<TunnelConnection>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match open(stream, session, services).await {
        Ok((tunnel, is_connect)) => {
            if is_connect {
                stream
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await?;
                stream.flush().await?;
            }
            Ok(tunnel)
        }
        Err(e) => {
            respond_error(stream, e.kind()).await;
            Err(e)
        }
    }
}

async fn open<S>(
    stream: &mut S,
    session: &mut ClientSession,
    services: &TunnelServices,
) -> Result<(TunnelConnection, bool)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    let head_len = read_head(stream, &mut buf).await?;
    let request = parse_request(&buf[..head_len])?;
    let leftover = buf.split_off(head_len).freeze();

    let token = request
        .header("proxy-authorization")
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(token_from_authorization);
    services.policy.verify_token(token.as_deref())?;

    let (target, initial) = if request.is_connect() {
        let target = TargetAddr::parse_with_default(&request.target, Some(443))
            .map_err(|e| TunnelError::Protocol(format!("bad CONNECT target: {}", e)))?;
        (target, leftover)
    } else {
        let uri: Uri = request
            .target
            .parse()
            .map_err(|e| TunnelError::Protocol(format!("bad request target: {}", e)))?;
        let authority = uri.authority().ok_or_else(|| {
            TunnelError::Protocol(format!(
                "proxy request needs an absolute URL, got {}",
                request.target
            ))
        })?;
        let default_port = match uri.scheme_str() {
            Some("https") => 443,
            _ => 80,
        };
        let host_port = authority
            .as_str()
            .rsplit_once('@')
            .map(|(_, hp)| hp)
            .unwrap_or(authority.as_str());
        let target = TargetAddr::parse_with_default(host_port, Some(default_port))
            .map_err(|e| TunnelError::Protocol(format!("bad request host: {}", e)))?;

        let mut initial = rewrite_plain_request(&request, &uri, host_port);
        initial.extend_from_slice(&leftover);
        (target, Bytes::from(initial))
    };

    debug!(
        "Session {} HTTP {} {}",
        session.id(),
        request.method,
        target
    );
    session.set_target(target);
    let tunnel = services.connect(session).await?;
    session.set_initial_payload(initial);
    Ok((tunnel, request.is_connect()))
}

#[cfg(test)]
mod tests {
    use super::super::testing::{services, EchoConnector};
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::sync::Arc;
    use tokio::io::duplex;

    fn session() -> ClientSession {
        ClientSession::new("127.0.0.1:50001".parse().unwrap())
    }

    async fn response_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
        let mut buf = BytesMut::new();
        let len = read_head(stream, &mut buf).await.unwrap();
        String::from_utf8(buf[..len].to_vec()).unwrap()
    }

    #[tokio::test]
    async fn connect_replies_established_and_keeps_pipelined_bytes() {
        let connector = Arc::new(EchoConnector::default());
        let services = services(connector.clone(), crate::config::DEFAULT_CIDRS, None);
        let (mut server, mut client) = duplex(4096);

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nhello")
            .await
            .unwrap();
        let mut session = session();
        let tunnel = negotiate(&mut server, &mut session, &services).await.unwrap();
        assert_eq!(tunnel.target(), &"example.com:443".parse().unwrap());
        assert_eq!(&session.initial_payload()[..], b"hello");

        let head = response_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200 Connection Established"));
    }

    #[tokio::test]
    async fn plain_request_is_rewritten_to_origin_form() {
        let services = services(Arc::new(EchoConnector::default()), crate::config::DEFAULT_CIDRS, None);
        let (mut server, mut client) = duplex(4096);

        client
            .write_all(
                b"GET http://example.com/index.html?q=1 HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\n\r\n",
            )
            .await
            .unwrap();
        let mut session = session();
        negotiate(&mut server, &mut session, &services).await.unwrap();
        assert_eq!(session.target(), Some(&"example.com:80".parse().unwrap()));

        let forwarded = String::from_utf8(session.initial_payload().to_vec()).unwrap();
        assert!(forwarded.starts_with("GET /index.html?q=1 HTTP/1.1\r\n"));
        assert!(forwarded.contains("Host: example.com\r\n"));
        assert!(!forwarded.to_ascii_lowercase().contains("proxy-connection"));
        assert!(forwarded.ends_with("Connection: close\r\n\r\n"));
    }

    #[tokio::test]
    async fn missing_token_gets_407_without_tunnel() {
        let connector = Arc::new(EchoConnector::default());
        let services = services(connector.clone(), crate::config::DEFAULT_CIDRS, Some("s3cret"));
        let (mut server, mut client) = duplex(4096);

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let err = negotiate(&mut server, &mut session(), &services).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
        let head = response_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 407"));
        assert!(head.contains("Proxy-Authenticate"));
        assert_eq!(connector.calls(), 0);
    }

    #[tokio::test]
    async fn basic_credentials_carry_the_token() {
        let services = services(Arc::new(EchoConnector::default()), crate::config::DEFAULT_CIDRS, Some("s3cret"));
        let (mut server, mut client) = duplex(4096);

        let request = format!(
            "CONNECT example.com:443 HTTP/1.1\r\nProxy-Authorization: Basic {}\r\n\r\n",
            STANDARD.encode("any:s3cret")
        );
        client.write_all(request.as_bytes()).await.unwrap();
        assert!(negotiate(&mut server, &mut session(), &services).await.is_ok());
    }

    #[tokio::test]
    async fn denied_destination_gets_403() {
        let connector = Arc::new(EchoConnector::default());
        let services = services(connector.clone(), "127.0.0.0/8", None);
        let (mut server, mut client) = duplex(4096);

        client
            .write_all(b"CONNECT 10.0.0.1:80 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let err = negotiate(&mut server, &mut session(), &services).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PolicyDenied);
        assert!(response_head(&mut client).await.starts_with("HTTP/1.1 403"));
        assert_eq!(connector.calls(), 0);
    }

    #[tokio::test]
    async fn garbage_gets_400() {
        let services = services(Arc::new(EchoConnector::default()), crate::config::DEFAULT_CIDRS, None);
        let (mut server, mut client) = duplex(4096);

        client.write_all(b"\x16\x03\x01 nonsense\r\n\r\n").await.unwrap();
        let err = negotiate(&mut server, &mut session(), &services).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolParse);
        assert!(response_head(&mut client).await.starts_with("HTTP/1.1 400"));
    }

    #[test]
    fn statuses_follow_error_kinds() {
        assert_eq!(status_for(ErrorKind::Connect).0, 502);
        assert_eq!(status_for(ErrorKind::Resolution).0, 502);
        assert_eq!(status_for(ErrorKind::Handshake).0, 502);
        assert_eq!(status_for(ErrorKind::Timeout).0, 504);
    }
}
