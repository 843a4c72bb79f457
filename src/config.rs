//! Session configuration
//!
//! A [`ServerConfig`] is built once (from defaults, a TOML file, CLI flags or
//! JSON handed over the C ABI) and then owned by the subsystem it configures.

use crate::addr::TargetAddr;
use crate::error::{Result, TunnelError};
use ipnet::IpNet;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DNS_SERVER: &str = "https://cloudflare-dns.com/dns-query";
pub const DEFAULT_ECH_DOMAIN: &str = "cloudflare-ech.com";
pub const DEFAULT_CIDRS: &str = "0.0.0.0/0,::/0";
pub const DEFAULT_CONNECTION_NUM: usize = 3;

/// Configuration bundle for one running session
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen URL: `tcp://addr[/target]`, `socks5://addr`, `http://addr`,
    /// `proxy://addr`, `ws://addr[/path]` or `wss://addr[/path]`
    pub listen: String,
    /// Remote relay endpoint (`host:port`) the tunnel terminates at
    pub forward: Option<String>,
    /// Raw IP used for the TCP connection instead of resolving the forward host
    pub ip: Option<String>,
    /// PEM certificate chain for `wss://` listeners
    pub cert_path: Option<PathBuf>,
    /// PEM private key for `wss://` listeners
    pub key_path: Option<PathBuf>,
    /// Bearer token local clients must present
    pub token: Option<String>,
    /// Comma-separated CIDR allow-list for destinations
    pub cidrs: String,
    /// DNS server used for ECH and address lookups
    pub dns_server: String,
    /// Cover domain whose ECH configuration is used
    pub ech_domain: String,
    /// Pre-warmed tunnel connections per forward target
    pub connection_num: usize,
    /// Skip server certificate verification on the tunnel
    pub insecure: bool,
    /// Allow plain TLS when the ECH configuration cannot be used locally
    pub fallback: bool,
    pub connect_timeout_secs: u64,
    pub dns_timeout_secs: u64,
    pub ech_ttl_secs: u64,
    pub drain_timeout_secs: u64,
    pub half_close_grace_secs: u64,
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "socks5://127.0.0.1:1080".to_string(),
            forward: None,
            ip: None,
            cert_path: None,
            key_path: None,
            token: None,
            cidrs: DEFAULT_CIDRS.to_string(),
            dns_server: DEFAULT_DNS_SERVER.to_string(),
            ech_domain: DEFAULT_ECH_DOMAIN.to_string(),
            connection_num: DEFAULT_CONNECTION_NUM,
            insecure: false,
            fallback: false,
            connect_timeout_secs: 10,
            dns_timeout_secs: 5,
            ech_ttl_secs: 3600,
            drain_timeout_secs: 5,
            half_close_grace_secs: 2,
            pool_idle_timeout_secs: 60,
        }
    }
}

/// Which local entry point a listen URL selects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenMode {
    /// Transparent forwarder; `None` means the forward address is the target
    Tcp { target: Option<TargetAddr> },
    /// SOCKS5 and HTTP proxy on one port
    Proxy,
    /// WebSocket relay, optionally restricted to one request path
    WebSocket { path: Option<String>, tls: bool },
}

/// Parsed listen URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenSpec {
    pub mode: ListenMode,
    pub addr: String,
}

impl ListenSpec {
    pub fn parse(listen: &str) -> Result<Self> {
        let (scheme, rest) = listen
            .split_once("://")
            .ok_or_else(|| TunnelError::Config(format!("listen address needs a scheme: {}", listen)))?;

        let (addr, path) = match rest.find('/') {
            Some(slash) => (&rest[..slash], Some(&rest[slash + 1..])),
            None => (rest, None),
        };
        if addr.is_empty() {
            return Err(TunnelError::Config(format!("missing listen address: {}", listen)));
        }
        let path = path.filter(|p| !p.is_empty());

        let mode = match scheme.to_ascii_lowercase().as_str() {
            "tcp" => ListenMode::Tcp {
                target: path
                    .map(|p| {
                        TargetAddr::parse_with_default(p, None)
                            .map_err(|e| TunnelError::Config(format!("bad tcp target: {}", e)))
                    })
                    .transpose()?,
            },
            "socks5" | "socks" | "http" | "proxy" => {
                if path.is_some() {
                    return Err(TunnelError::Config(format!(
                        "proxy listeners take no path: {}",
                        listen
                    )));
                }
                ListenMode::Proxy
            }
            "ws" | "wss" => ListenMode::WebSocket {
                path: path.map(|p| format!("/{}", p)),
                tls: scheme.eq_ignore_ascii_case("wss"),
            },
            other => {
                return Err(TunnelError::Config(format!(
                    "unsupported listen scheme '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            mode,
            addr: addr.to_string(),
        })
    }
}

impl ServerConfig {
    /// Load a TOML config file; missing keys take their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| TunnelError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| TunnelError::Config(e.to_string()))
    }

    pub fn listen_spec(&self) -> Result<ListenSpec> {
        ListenSpec::parse(&self.listen)
    }

    /// The remote relay endpoint, when one is configured.
    pub fn forward_target(&self) -> Result<Option<TargetAddr>> {
        match self.forward.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(None),
            Some(forward) => {
                let stripped = forward
                    .strip_prefix("https://")
                    .or_else(|| forward.strip_prefix("tls://"))
                    .unwrap_or(forward);
                let authority = stripped.split('/').next().unwrap_or(stripped);
                TargetAddr::parse_with_default(authority, Some(443))
                    .map(Some)
                    .map_err(|e| TunnelError::Config(format!("bad forward address: {}", e)))
            }
        }
    }

    pub fn raw_ip(&self) -> Result<Option<IpAddr>> {
        match self.ip.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(None),
            Some(ip) => ip
                .trim_start_matches('[')
                .trim_end_matches(']')
                .parse()
                .map(Some)
                .map_err(|_| TunnelError::Config(format!("bad ip override: {}", ip))),
        }
    }

    pub fn allowed_cidrs(&self) -> Result<Vec<IpNet>> {
        parse_cidr_list(&self.cidrs)
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_timeout_secs)
    }

    pub fn ech_ttl(&self) -> Duration {
        Duration::from_secs(self.ech_ttl_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn half_close_grace(&self) -> Duration {
        Duration::from_secs(self.half_close_grace_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    /// Check everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<ListenSpec> {
        let spec = self.listen_spec()?;
        let forward = self.forward_target()?;
        self.raw_ip()?;
        self.allowed_cidrs()?;

        if let ListenMode::Tcp { target: None } = spec.mode {
            if forward.is_none() {
                return Err(TunnelError::Config(
                    "tcp listener needs a target path or a forward address".to_string(),
                ));
            }
        }
        if self.cert_path.is_some() != self.key_path.is_some() {
            return Err(TunnelError::Config(
                "cert_path and key_path must be set together".to_string(),
            ));
        }
        if self.ech_domain.trim().is_empty() {
            return Err(TunnelError::Config("ech_domain must not be empty".to_string()));
        }
        Ok(spec)
    }
}

/// Parse `"10.0.0.0/8, ::/0"`. Bare addresses become host routes.
pub fn parse_cidr_list(list: &str) -> Result<Vec<IpNet>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpNet>()
                .or_else(|_| s.parse::<IpAddr>().map(IpNet::from))
                .map_err(|_| TunnelError::Config(format!("invalid CIDR '{}'", s)))
        })
        .collect()
}
