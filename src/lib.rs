//! ECH tunnel - local proxy that carries traffic through Encrypted Client Hello
//!
//! Local clients connect over plain TCP, SOCKS5/HTTP or WebSocket. Each
//! session is paired with an outbound TLS connection whose ClientHello is
//! encrypted with the cover domain's ECH configuration, so on-path observers
//! only ever see the cover domain.

pub mod acceptor;
pub mod addr;
pub mod cert;
pub mod config;
pub mod controller;
pub mod dns;
pub mod ech;
pub mod error;
pub mod ffi;
pub mod forward;
pub mod policy;
pub mod session;
pub mod stats;
pub mod tls_crypto;
pub mod tunnel;

pub use addr::TargetAddr;
pub use config::{ListenMode, ListenSpec, ServerConfig};
pub use controller::{ControlOutcome, ServiceController};
pub use ech::{EchConfigCache, EchConfiguration};
pub use error::{ErrorKind, Result, TunnelError};
pub use stats::StatsSnapshot;
