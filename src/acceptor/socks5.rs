//! SOCKS5 (RFC 1928) CONNECT with optional RFC 1929 token authentication

use super::TunnelServices;
use crate::addr::TargetAddr;
use crate::error::{ErrorKind, Result, TunnelError};
use crate::session::ClientSession;
use crate::tunnel::TunnelConnection;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub(super) const VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_NOT_ALLOWED: u8 = 0x02;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_TTL_EXPIRED: u8 = 0x06;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Reply code for a failure after the request was read
fn reply_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::PolicyDenied | ErrorKind::Auth => REPLY_NOT_ALLOWED,
        ErrorKind::Resolution | ErrorKind::Network => REPLY_HOST_UNREACHABLE,
        ErrorKind::Connect => REPLY_CONNECTION_REFUSED,
        ErrorKind::Timeout => REPLY_TTL_EXPIRED,
        ErrorKind::ProtocolParse => REPLY_COMMAND_NOT_SUPPORTED,
        _ => REPLY_GENERAL_FAILURE,
    }
}

async fn reply<S: AsyncWrite + Unpin>(stream: &mut S, code: u8) -> Result<()> {
    // BND.ADDR is not meaningful for a tunnel; report 0.0.0.0:0.
    stream
        .write_all(&[VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    stream.flush().await?;
    Ok(())
}

/// Run the SOCKS5 exchange up to and including the CONNECT reply.
pub(super) async fn negotiate<S>(
    stream: &mut S,
    session: &mut ClientSession,
    services: &TunnelServices,
) -> Result<TunnelConnection>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    select_method(stream, services).await?;
    let target = read_request(stream).await?;
    debug!("Session {} SOCKS5 CONNECT {}", session.id(), target);
    session.set_target(target);

    match services.connect(session).await {
        Ok(tunnel) => {
            reply(stream, REPLY_SUCCEEDED).await?;
            Ok(tunnel)
        }
        Err(e) => {
            let _ = reply(stream, reply_code(e.kind())).await;
            Err(e)
        }
    }
}

async fn select_method<S>(stream: &mut S, services: &TunnelServices) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(TunnelError::Protocol(format!(
            "unsupported SOCKS version {}",
            header[0]
        )));
    }
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    let wanted = if services.policy.requires_token() {
        METHOD_USER_PASS
    } else {
        METHOD_NO_AUTH
    };
    if !methods.contains(&wanted) {
        stream.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        return Err(if wanted == METHOD_USER_PASS {
            TunnelError::Auth("client offered no username/password method".to_string())
        } else {
            TunnelError::Protocol("no acceptable SOCKS5 auth method".to_string())
        });
    }
    stream.write_all(&[VERSION, wanted]).await?;

    if wanted == METHOD_USER_PASS {
        authenticate(stream, services).await?;
    }
    Ok(())
}

/// RFC 1929 sub-negotiation; the password carries the token.
async fn authenticate<S>(stream: &mut S, services: &TunnelServices) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ver_ulen = [0u8; 2];
    stream.read_exact(&mut ver_ulen).await?;
    if ver_ulen[0] != 0x01 {
        return Err(TunnelError::Protocol(format!(
            "unsupported auth version {}",
            ver_ulen[0]
        )));
    }
    let mut username = vec![0u8; ver_ulen[1] as usize];
    stream.read_exact(&mut username).await?;
    let plen = stream.read_u8().await?;
    let mut password = vec![0u8; plen as usize];
    stream.read_exact(&mut password).await?;

    let password = String::from_utf8_lossy(&password);
    match services.policy.verify_token(Some(&*password)) {
        Ok(()) => {
            stream.write_all(&[0x01, 0x00]).await?;
            Ok(())
        }
        Err(e) => {
            let _ = stream.write_all(&[0x01, 0x01]).await;
            Err(e)
        }
    }
}

async fn read_request<S>(stream: &mut S) -> Result<TargetAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, command, _reserved, atyp] = header;
    if version != VERSION {
        return Err(TunnelError::Protocol(format!(
            "unsupported SOCKS version {} in request",
            version
        )));
    }
    if command != CMD_CONNECT {
        let _ = reply(stream, REPLY_COMMAND_NOT_SUPPORTED).await;
        return Err(TunnelError::Protocol(format!(
            "SOCKS5 command {} not supported",
            command
        )));
    }

    let target = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut name = vec![0u8; len as usize];
            stream.read_exact(&mut name).await?;
            let port = stream.read_u16().await?;
            let host = String::from_utf8(name)
                .map_err(|_| TunnelError::Protocol("domain is not UTF-8".to_string()))?;
            match host.parse::<IpAddr>() {
                Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
                Err(_) if !host.is_empty() => TargetAddr::Domain(host.to_ascii_lowercase(), port),
                Err(_) => {
                    let _ = reply(stream, REPLY_ADDRESS_NOT_SUPPORTED).await;
                    return Err(TunnelError::Protocol("empty domain".to_string()));
                }
            }
        }
        other => {
            let _ = reply(stream, REPLY_ADDRESS_NOT_SUPPORTED).await;
            return Err(TunnelError::Protocol(format!(
                "address type {} not supported",
                other
            )));
        }
    };
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::super::testing::{services, EchoConnector};
    use super::*;
    use std::sync::Arc;
    use tokio::io::duplex;

    fn session() -> ClientSession {
        ClientSession::new("127.0.0.1:50000".parse().unwrap())
    }

    fn connect_request(host: &str, port: u16) -> Vec<u8> {
        let mut req = vec![VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, host.len() as u8];
        req.extend_from_slice(host.as_bytes());
        req.extend_from_slice(&port.to_be_bytes());
        req
    }

    #[tokio::test]
    async fn connect_without_auth() {
        let connector = Arc::new(EchoConnector::default());
        let services = services(connector.clone(), crate::config::DEFAULT_CIDRS, None);
        let (mut server, mut client) = duplex(1024);

        client.write_all(&[VERSION, 1, METHOD_NO_AUTH]).await.unwrap();
        client.write_all(&connect_request("Example.com", 443)).await.unwrap();

        let mut session = session();
        let tunnel = negotiate(&mut server, &mut session, &services).await.unwrap();
        assert_eq!(tunnel.target(), &"example.com:443".parse().unwrap());
        assert_eq!(session.target(), Some(&"example.com:443".parse().unwrap()));

        let mut replies = [0u8; 12];
        client.read_exact(&mut replies).await.unwrap();
        assert_eq!(&replies[..2], &[VERSION, METHOD_NO_AUTH]);
        assert_eq!(replies[3], REPLY_SUCCEEDED);
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test]
    async fn wrong_token_fails_before_any_tunnel() {
        let connector = Arc::new(EchoConnector::default());
        let services = services(connector.clone(), crate::config::DEFAULT_CIDRS, Some("right"));
        let (mut server, mut client) = duplex(1024);

        client.write_all(&[VERSION, 1, METHOD_USER_PASS]).await.unwrap();
        client.write_all(&[0x01, 4]).await.unwrap();
        client.write_all(b"user").await.unwrap();
        client.write_all(&[5]).await.unwrap();
        client.write_all(b"wrong").await.unwrap();

        let err = negotiate(&mut server, &mut session(), &services).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);

        let mut replies = [0u8; 4];
        client.read_exact(&mut replies).await.unwrap();
        assert_eq!(replies, [VERSION, METHOD_USER_PASS, 0x01, 0x01]);
        assert_eq!(connector.calls(), 0);
    }

    #[tokio::test]
    async fn token_required_but_not_offered() {
        let connector = Arc::new(EchoConnector::default());
        let services = services(connector.clone(), crate::config::DEFAULT_CIDRS, Some("right"));
        let (mut server, mut client) = duplex(1024);

        client.write_all(&[VERSION, 1, METHOD_NO_AUTH]).await.unwrap();
        let err = negotiate(&mut server, &mut session(), &services).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [VERSION, METHOD_NONE_ACCEPTABLE]);
    }

    #[tokio::test]
    async fn denied_destination_gets_not_allowed() {
        let connector = Arc::new(EchoConnector::default());
        let services = services(connector.clone(), "127.0.0.0/8", None);
        let (mut server, mut client) = duplex(1024);

        client.write_all(&[VERSION, 1, METHOD_NO_AUTH]).await.unwrap();
        client
            .write_all(&[VERSION, CMD_CONNECT, 0, ATYP_IPV4, 10, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        let err = negotiate(&mut server, &mut session(), &services).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PolicyDenied);

        let mut replies = [0u8; 12];
        client.read_exact(&mut replies).await.unwrap();
        assert_eq!(replies[3], REPLY_NOT_ALLOWED);
        assert_eq!(connector.calls(), 0);
    }

    #[tokio::test]
    async fn udp_associate_is_not_supported() {
        let services = services(Arc::new(EchoConnector::default()), crate::config::DEFAULT_CIDRS, None);
        let (mut server, mut client) = duplex(1024);

        client.write_all(&[VERSION, 1, METHOD_NO_AUTH]).await.unwrap();
        client
            .write_all(&[VERSION, 0x03, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let err = negotiate(&mut server, &mut session(), &services).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolParse);

        let mut replies = [0u8; 12];
        client.read_exact(&mut replies).await.unwrap();
        assert_eq!(replies[3], REPLY_COMMAND_NOT_SUPPORTED);
    }

    #[test]
    fn reply_codes_follow_error_kinds() {
        assert_eq!(reply_code(ErrorKind::PolicyDenied), 0x02);
        assert_eq!(reply_code(ErrorKind::Resolution), 0x04);
        assert_eq!(reply_code(ErrorKind::Network), 0x04);
        assert_eq!(reply_code(ErrorKind::Connect), 0x05);
        assert_eq!(reply_code(ErrorKind::Timeout), 0x06);
        assert_eq!(reply_code(ErrorKind::Handshake), 0x01);
    }
}
