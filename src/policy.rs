//! Admission checks applied before a session may consume a tunnel

use crate::addr::TargetAddr;
use crate::dns::DnsLookup;
use crate::error::{Result, TunnelError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ipnet::IpNet;
use std::net::IpAddr;
use tracing::debug;

/// CIDR allow-list for destinations plus the optional bearer token
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    allowed: Vec<IpNet>,
    token: Option<String>,
}

impl AccessPolicy {
    pub fn new(allowed: Vec<IpNet>, token: Option<String>) -> Self {
        Self {
            allowed,
            token: token.filter(|t| !t.is_empty()),
        }
    }

    pub fn requires_token(&self) -> bool {
        self.token.is_some()
    }

    /// True when the list covers the whole IPv4 and IPv6 space.
    pub fn allows_all(&self) -> bool {
        let v4 = self
            .allowed
            .iter()
            .any(|net| matches!(net, IpNet::V4(n) if n.prefix_len() == 0));
        let v6 = self
            .allowed
            .iter()
            .any(|net| matches!(net, IpNet::V6(n) if n.prefix_len() == 0));
        v4 && v6
    }

    pub fn allows_ip(&self, ip: IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        self.allowed.iter().any(|net| net.contains(&ip))
    }

    /// Check the session destination against the allow-list.
    ///
    /// Domains are resolved through `dns`; every resolved address has to be
    /// allowed. Resolution is skipped when the list permits everything.
    pub async fn check_destination(
        &self,
        target: &TargetAddr,
        dns: &dyn DnsLookup,
        dns_server: &str,
    ) -> Result<()> {
        if self.allows_all() {
            return Ok(());
        }

        match target {
            TargetAddr::Ip(addr) => {
                if self.allows_ip(addr.ip()) {
                    Ok(())
                } else {
                    Err(TunnelError::PolicyDenied(target.to_string()))
                }
            }
            TargetAddr::Domain(host, _) => {
                let addrs = dns.lookup_ip(dns_server, host).await?;
                if addrs.is_empty() {
                    return Err(TunnelError::Resolution {
                        domain: host.clone(),
                        reason: "no addresses".to_string(),
                    });
                }
                if let Some(denied) = addrs.iter().find(|ip| !self.allows_ip(**ip)) {
                    debug!("{} resolved to {} outside the allow-list", host, denied);
                    return Err(TunnelError::PolicyDenied(format!("{} ({})", target, denied)));
                }
                Ok(())
            }
        }
    }

    /// Validate a presented token. Passes trivially when none is configured.
    pub fn verify_token(&self, presented: Option<&str>) -> Result<()> {
        match (&self.token, presented) {
            (None, _) => Ok(()),
            (Some(expected), Some(got)) if constant_time_eq(expected.as_bytes(), got.as_bytes()) => {
                Ok(())
            }
            (Some(_), Some(_)) => Err(TunnelError::Auth("token mismatch".to_string())),
            (Some(_), None) => Err(TunnelError::Auth("token required".to_string())),
        }
    }
}

/// Extract a token from an `Authorization`/`Proxy-Authorization` value.
///
/// `Bearer <token>` yields the token, `Basic base64(user:pass)` yields the
/// password.
pub fn token_from_authorization(value: &str) -> Option<String> {
    let value = value.trim();
    let (scheme, rest) = value.split_once(' ')?;
    let rest = rest.trim();
    if scheme.eq_ignore_ascii_case("bearer") {
        return Some(rest.to_string());
    }
    if scheme.eq_ignore_ascii_case("basic") {
        let decoded = STANDARD.decode(rest).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (_, password) = decoded.split_once(':')?;
        return Some(password.to_string());
    }
    None
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
