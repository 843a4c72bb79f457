//! Destination addresses as negotiated by the local entry points

use crate::error::{Result, TunnelError};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// A host/port pair, either already an IP or still a domain name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// Parse `host:port`, `[v6]:port` or `ip:port`.
    ///
    /// When the port is missing, `default_port` is used if given.
    pub fn parse_with_default(s: &str, default_port: Option<u16>) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TunnelError::Protocol("empty target address".to_string()));
        }

        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(TargetAddr::Ip(addr));
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let end = rest
                .find(']')
                .ok_or_else(|| TunnelError::Protocol(format!("unterminated IPv6 literal: {}", s)))?;
            let host = &rest[..end];
            let port = match rest[end + 1..].strip_prefix(':') {
                Some(p) => Some(parse_port(p, s)?),
                None => None,
            };
            (host, port)
        } else if let Some(colon) = s.rfind(':') {
            // A bare IPv6 literal has several colons and no port.
            if s[..colon].contains(':') {
                (s, None)
            } else {
                (&s[..colon], Some(parse_port(&s[colon + 1..], s)?))
            }
        } else {
            (s, None)
        };

        let port = port
            .or(default_port)
            .ok_or_else(|| TunnelError::Protocol(format!("missing port in {}", s)))?;

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(TargetAddr::Ip(SocketAddr::new(ip, port)));
        }
        if host.is_empty() || host.len() > 255 {
            return Err(TunnelError::Protocol(format!("invalid host in {}", s)));
        }
        Ok(TargetAddr::Domain(host.to_ascii_lowercase(), port))
    }

    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(addr) => addr.ip().to_string(),
            TargetAddr::Domain(host, _) => host.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            TargetAddr::Ip(addr) => Some(addr.ip()),
            TargetAddr::Domain(..) => None,
        }
    }
}

fn parse_port(p: &str, whole: &str) -> Result<u16> {
    p.parse::<u16>()
        .map_err(|_| TunnelError::Protocol(format!("invalid port in {}", whole)))
}

impl FromStr for TargetAddr {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_with_default(s, None)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}
