//! Doubles shared by the integration tests: a scripted DNS and a connector
//! whose tunnels end at in-memory peers.

#![allow(dead_code)]

use async_trait::async_trait;
use ech_tunnel::dns::{DnsLookup, FetchError};
use ech_tunnel::tunnel::{TunnelConnection, TunnelConnector};
use ech_tunnel::{EchConfiguration, Result, ServerConfig, TargetAddr};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Single-entry ECHConfigList with the given public name.
pub fn config_list(public_name: &str) -> Vec<u8> {
    let mut contents = vec![1, 0x00, 0x20];
    contents.extend_from_slice(&32u16.to_be_bytes());
    contents.extend_from_slice(&[0x42; 32]);
    contents.extend_from_slice(&4u16.to_be_bytes());
    contents.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
    contents.push(0);
    contents.push(public_name.len() as u8);
    contents.extend_from_slice(public_name.as_bytes());
    contents.extend_from_slice(&0u16.to_be_bytes());

    let mut entry = 0xfe0du16.to_be_bytes().to_vec();
    entry.extend_from_slice(&(contents.len() as u16).to_be_bytes());
    entry.extend_from_slice(&contents);

    let mut list = (entry.len() as u16).to_be_bytes().to_vec();
    list.extend_from_slice(&entry);
    list
}

/// Answers every ECH query with a valid list and resolves hosts from a
/// fixed table (unknown hosts get 93.184.216.34).
#[derive(Default)]
pub struct MockDns {
    pub ech_queries: AtomicUsize,
    hosts: Mutex<HashMap<String, Vec<IpAddr>>>,
}

impl MockDns {
    pub fn with_host(self, host: &str, ips: &[IpAddr]) -> Self {
        self.hosts.lock().insert(host.to_string(), ips.to_vec());
        self
    }

    pub fn ech_queries(&self) -> usize {
        self.ech_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DnsLookup for MockDns {
    async fn fetch_ech_config_list(
        &self,
        _dns_server: &str,
        domain: &str,
    ) -> std::result::Result<Vec<u8>, FetchError> {
        self.ech_queries.fetch_add(1, Ordering::SeqCst);
        Ok(config_list(domain))
    }

    async fn lookup_ip(&self, _dns_server: &str, host: &str) -> Result<Vec<IpAddr>> {
        Ok(self
            .hosts
            .lock()
            .get(host)
            .cloned()
            .unwrap_or_else(|| vec![IpAddr::from([93, 184, 216, 34])]))
    }
}

/// What the far end of every tunnel does
#[derive(Clone, Copy, Debug)]
pub enum Remote {
    /// Echo everything back
    Echo,
    /// Read exactly `expect` bytes, answer with `reply` bytes of 0xAB, close
    Reply { expect: usize, reply: usize },
    /// Act as an HTTP CONNECT relay requiring `token` (if any), then echo
    Relay { token: Option<&'static str> },
}

/// Connector whose tunnels are duplex pipes to a scripted remote
pub struct LoopbackConnector {
    remote: Remote,
    calls: AtomicUsize,
    targets: Mutex<Vec<TargetAddr>>,
}

impl LoopbackConnector {
    pub fn new(remote: Remote) -> Self {
        Self {
            remote,
            calls: AtomicUsize::new(0),
            targets: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn targets(&self) -> Vec<TargetAddr> {
        self.targets.lock().clone()
    }
}

async fn echo(peer: &mut DuplexStream) {
    let mut buf = [0u8; 8192];
    loop {
        match peer.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if peer.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn run_remote(remote: Remote, mut peer: DuplexStream) {
    match remote {
        Remote::Echo => echo(&mut peer).await,
        Remote::Relay { token } => {
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                match peer.read(&mut byte).await {
                    Ok(1) => head.push(byte[0]),
                    _ => return,
                }
            }
            let head = String::from_utf8_lossy(&head).to_string();
            let authorized = match token {
                Some(token) => head.contains(&format!("Proxy-Authorization: Bearer {}\r\n", token)),
                None => true,
            };
            if !head.starts_with("CONNECT ") || !authorized {
                let _ = peer
                    .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                    .await;
                return;
            }
            if peer.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").await.is_ok() {
                echo(&mut peer).await;
            }
        }
        Remote::Reply { expect, reply } => {
            let mut received = vec![0u8; expect];
            if peer.read_exact(&mut received).await.is_ok() {
                let _ = peer.write_all(&vec![0xAB; reply]).await;
            }
            let _ = peer.shutdown().await;
        }
    }
}

#[async_trait]
impl TunnelConnector for LoopbackConnector {
    async fn connect(
        &self,
        target: &TargetAddr,
        ech: &EchConfiguration,
        _timeout: Duration,
    ) -> Result<TunnelConnection> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().push(target.clone());
        let (local, peer) = tokio::io::duplex(256 * 1024);
        tokio::spawn(run_remote(self.remote, peer));
        Ok(TunnelConnection::new(
            Box::new(local),
            target.clone(),
            ech.clone(),
            true,
        ))
    }
}

pub fn config(listen: &str) -> ServerConfig {
    ServerConfig {
        listen: listen.to_string(),
        dns_server: "mock".to_string(),
        drain_timeout_secs: 1,
        ..ServerConfig::default()
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Run a SOCKS5 no-auth CONNECT to `host:port`, returning the reply code.
pub async fn socks5_connect(
    stream: &mut tokio::net::TcpStream,
    host: &str,
    port: u16,
) -> std::io::Result<u8> {
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    assert_eq!(method, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await?;
    Ok(reply[1])
}

pub fn backends(remote: Remote) -> (Arc<MockDns>, Arc<LoopbackConnector>) {
    (
        Arc::new(MockDns::default()),
        Arc::new(LoopbackConnector::new(remote)),
    )
}
