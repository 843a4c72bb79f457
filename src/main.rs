//! ECH tunnel - standalone executable

use clap::Parser;
use ech_tunnel::{ServerConfig, ServiceController};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command line flags; anything given here overrides the config file.
#[derive(Parser, Debug)]
#[command(version, about = "Local proxy that tunnels through Encrypted Client Hello")]
struct Cli {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen URL: tcp://addr/target, socks5://addr, http://addr, proxy://addr, ws://addr/path, wss://addr/path
    #[arg(short, long)]
    listen: Option<String>,

    /// Remote relay (host:port) every tunnel terminates at
    #[arg(short, long)]
    forward: Option<String>,

    /// Connect to this IP instead of resolving the forward host
    #[arg(long)]
    ip: Option<String>,

    /// PEM certificate for wss:// listeners
    #[arg(long)]
    cert: Option<PathBuf>,

    /// PEM private key for wss:// listeners
    #[arg(long)]
    key: Option<PathBuf>,

    /// Token local clients must present
    #[arg(short, long)]
    token: Option<String>,

    /// Comma-separated destination allow-list
    #[arg(long)]
    cidrs: Option<String>,

    /// DNS server for ECH and address lookups (DoH URL, preset name or ip:port)
    #[arg(long)]
    dns: Option<String>,

    /// Cover domain whose ECH configuration is used
    #[arg(long)]
    ech: Option<String>,

    /// Pre-warmed tunnels to the forward address
    #[arg(short = 'n', long)]
    connection_num: Option<usize>,

    /// Skip certificate verification on the tunnel
    #[arg(long)]
    insecure: bool,

    /// Use plain TLS when the ECH configuration cannot be used
    #[arg(long)]
    fallback: bool,
}

impl Cli {
    fn into_config(self) -> ech_tunnel::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_toml_file(path)?,
            None => ServerConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if self.forward.is_some() {
            config.forward = self.forward;
        }
        if self.ip.is_some() {
            config.ip = self.ip;
        }
        if self.cert.is_some() {
            config.cert_path = self.cert;
        }
        if self.key.is_some() {
            config.key_path = self.key;
        }
        if self.token.is_some() {
            config.token = self.token;
        }
        if let Some(cidrs) = self.cidrs {
            config.cidrs = cidrs;
        }
        if let Some(dns) = self.dns {
            config.dns_server = dns;
        }
        if let Some(ech) = self.ech {
            config.ech_domain = ech;
        }
        if let Some(n) = self.connection_num {
            config.connection_num = n;
        }
        config.insecure |= self.insecure;
        config.fallback |= self.fallback;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("ech_tunnel=info".parse()?))
        .init();

    let config = Cli::parse().into_config()?;
    info!(
        "Starting ECH tunnel: listen={} forward={:?} ech={} dns={}",
        config.listen, config.forward, config.ech_domain, config.dns_server
    );

    let controller = ServiceController::new();
    let outcome = controller.start(config).await;
    if !outcome.success {
        error!("Failed to start: {}", outcome.message);
        return Err(outcome.message.into());
    }

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    controller.release().await;

    Ok(())
}
