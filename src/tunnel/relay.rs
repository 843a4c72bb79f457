//! HTTP CONNECT negotiation with the remote relay over an established tunnel

use crate::addr::TargetAddr;
use crate::error::{Result, TunnelError};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Largest response or request head accepted
pub(crate) const MAX_HEAD_LEN: usize = 8 * 1024;
const MAX_HEADERS: usize = 32;

/// Read from `stream` into `buf` until it holds a complete HTTP head.
/// Returns the head length; anything after it stays in `buf`.
pub(crate) async fn read_head<S>(stream: &mut S, buf: &mut BytesMut) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = find_head_end(buf) {
            return Ok(pos);
        }
        if buf.len() >= MAX_HEAD_LEN {
            return Err(TunnelError::Protocol("HTTP head too large".to_string()));
        }
        buf.reserve(1024);
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(TunnelError::Protocol(
                "connection closed before end of HTTP head".to_string(),
            ));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Ask the relay at the far end of `stream` to connect to `target`.
///
/// Returns bytes the relay already sent past its response head; they belong
/// to the destination's stream.
pub async fn negotiate<S>(stream: &mut S, target: &TargetAddr, token: Option<&str>) -> Result<Bytes>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = target.to_string();
    let mut request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n"
    );
    if let Some(token) = token {
        request.push_str(&format!("Proxy-Authorization: Bearer {token}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    let head_len = read_head(stream, &mut buf).await?;

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(&buf[..head_len]) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(TunnelError::Protocol("truncated relay response".to_string()))
        }
        Err(e) => {
            return Err(TunnelError::Protocol(format!("invalid relay response: {}", e)))
        }
    }

    let code = response.code.unwrap_or(0);
    debug!("Relay answered {} for {}", code, authority);
    match code {
        200..=299 => {
            let _ = buf.split_to(head_len);
            Ok(buf.freeze())
        }
        407 | 401 => Err(TunnelError::Auth(format!("relay rejected credentials ({code})"))),
        403 => Err(TunnelError::PolicyDenied(format!("{authority} (refused by relay)"))),
        504 => Err(TunnelError::Timeout(format!("relay timed out reaching {authority}"))),
        _ => Err(TunnelError::Protocol(format!(
            "relay answered {} {} for {}",
            code,
            response.reason.unwrap_or(""),
            authority
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    async fn relay_reply(reply: &'static [u8], token: Option<&str>) -> (Result<Bytes>, String) {
        let (mut local, mut remote) = tokio::io::duplex(4096);
        let relay = tokio::spawn(async move {
            let mut buf = BytesMut::new();
            let len = read_head(&mut remote, &mut buf).await.unwrap();
            remote.write_all(reply).await.unwrap();
            String::from_utf8(buf[..len].to_vec()).unwrap()
        });
        let target: TargetAddr = "example.com:443".parse().unwrap();
        let result = negotiate(&mut local, &target, token).await;
        (result, relay.await.unwrap())
    }

    #[tokio::test]
    async fn sends_connect_with_bearer_token() {
        let (result, request) =
            relay_reply(b"HTTP/1.1 200 Connection Established\r\n\r\n", Some("t0k")).await;
        assert!(result.unwrap().is_empty());
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(request.contains("Host: example.com:443\r\n"));
        assert!(request.contains("Proxy-Authorization: Bearer t0k\r\n"));
    }

    #[tokio::test]
    async fn keeps_bytes_after_the_head() {
        let (result, request) = relay_reply(b"HTTP/1.1 200 OK\r\n\r\nhello", None).await;
        assert_eq!(&result.unwrap()[..], b"hello");
        assert!(!request.contains("Proxy-Authorization"));
    }

    #[tokio::test]
    async fn maps_refusals_onto_error_kinds() {
        let (result, _) = relay_reply(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n", None).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Auth);

        let (result, _) = relay_reply(b"HTTP/1.1 403 Forbidden\r\n\r\n", None).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::PolicyDenied);

        let (result, _) = relay_reply(b"HTTP/1.1 502 Bad Gateway\r\n\r\n", None).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::ProtocolParse);

        let (result, _) = relay_reply(b"garbage\r\n\r\n", None).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::ProtocolParse);
    }
}
