//! Error types for the ECH tunnel

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("DNS resolution failed for {domain}: {reason}")]
    Resolution { domain: String, reason: String },

    #[error("DNS resolver unreachable: {0}")]
    Network(String),

    #[error("TLS handshake failed: {reason}")]
    Handshake { reason: String, stale_config: bool },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Connect to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Destination {0} denied by CIDR policy")]
    PolicyDenied(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, TunnelError>;

/// Failure taxonomy used for rejection counters and protocol replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    Resolution,
    Network,
    Handshake,
    Timeout,
    Connect,
    PolicyDenied,
    Auth,
    Bind,
    ProtocolParse,
    Other,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::Resolution,
        ErrorKind::Network,
        ErrorKind::Handshake,
        ErrorKind::Timeout,
        ErrorKind::Connect,
        ErrorKind::PolicyDenied,
        ErrorKind::Auth,
        ErrorKind::Bind,
        ErrorKind::ProtocolParse,
        ErrorKind::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Resolution => "resolution_failure",
            ErrorKind::Network => "network_failure",
            ErrorKind::Handshake => "handshake_failure",
            ErrorKind::Timeout => "timeout_failure",
            ErrorKind::Connect => "connect_failure",
            ErrorKind::PolicyDenied => "policy_denied",
            ErrorKind::Auth => "auth_failure",
            ErrorKind::Bind => "bind_failure",
            ErrorKind::ProtocolParse => "protocol_parse_failure",
            ErrorKind::Other => "other",
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::Resolution { .. } => ErrorKind::Resolution,
            TunnelError::Network(_) => ErrorKind::Network,
            TunnelError::Handshake { .. } | TunnelError::Tls(_) => ErrorKind::Handshake,
            TunnelError::Timeout(_) => ErrorKind::Timeout,
            TunnelError::Connect { .. } => ErrorKind::Connect,
            TunnelError::PolicyDenied(_) => ErrorKind::PolicyDenied,
            TunnelError::Auth(_) => ErrorKind::Auth,
            TunnelError::Bind { .. } => ErrorKind::Bind,
            TunnelError::Protocol(_) => ErrorKind::ProtocolParse,
            TunnelError::Config(_)
            | TunnelError::Certificate(_)
            | TunnelError::Io(_)
            | TunnelError::Cancelled => ErrorKind::Other,
        }
    }

    /// True when the remote rejected the ECH configuration we offered.
    pub fn is_stale_config(&self) -> bool {
        matches!(
            self,
            TunnelError::Handshake {
                stale_config: true,
                ..
            }
        )
    }

    pub(crate) fn handshake(reason: impl Into<String>) -> Self {
        TunnelError::Handshake {
            reason: reason.into(),
            stale_config: false,
        }
    }

    pub(crate) fn stale_config(reason: impl Into<String>) -> Self {
        TunnelError::Handshake {
            reason: reason.into(),
            stale_config: true,
        }
    }
}
