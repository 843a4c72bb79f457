//! DNS client with DoH and HTTPS record support for ECH config retrieval

use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use hickory_resolver::{
    config::{NameServerConfig, NameServerConfigGroup, Protocol, ResolverConfig, ResolverOpts},
    error::{ResolveError, ResolveErrorKind},
    proto::rr::{rdata::HTTPS, RData, RecordType},
    TokioAsyncResolver,
};
use http::Uri;
use parking_lot::RwLock;
use reqwest::Client;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::lookup_host;
use tracing::{debug, info, warn};

const IP_CACHE_TTL: Duration = Duration::from_secs(600);

/// Failure of a single DNS fetch; cloneable so one result can be shared
/// between every caller waiting on the same query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Timeout, missing record or malformed answer
    Resolution(String),
    /// The resolver itself could not be reached
    Network(String),
}

impl FetchError {
    pub fn into_tunnel_error(self, domain: &str) -> TunnelError {
        match self {
            FetchError::Resolution(reason) => TunnelError::Resolution {
                domain: domain.to_string(),
                reason,
            },
            FetchError::Network(reason) => TunnelError::Network(reason),
        }
    }
}

/// DNS operations the tunnel needs
#[async_trait]
pub trait DnsLookup: Send + Sync {
    /// Raw ECHConfigList from the `ech` SvcParam of the domain's HTTPS record
    async fn fetch_ech_config_list(
        &self,
        dns_server: &str,
        domain: &str,
    ) -> std::result::Result<Vec<u8>, FetchError>;

    async fn lookup_ip(&self, dns_server: &str, host: &str) -> Result<Vec<IpAddr>>;
}

/// One resolver per DNS server string, created on first use
pub struct ResolverPool {
    resolvers: DashMap<String, Arc<DnsResolver>>,
    timeout: Duration,
}

impl ResolverPool {
    pub fn new(timeout: Duration) -> Self {
        Self {
            resolvers: DashMap::new(),
            timeout,
        }
    }

    async fn resolver(&self, dns_server: &str) -> std::result::Result<Arc<DnsResolver>, FetchError> {
        if let Some(existing) = self.resolvers.get(dns_server) {
            return Ok(existing.clone());
        }

        let resolver = Arc::new(DnsResolver::new(dns_server, self.timeout).await?);
        // Another task may have raced us here; keep whichever landed first.
        let entry = self
            .resolvers
            .entry(dns_server.to_string())
            .or_insert(resolver);
        Ok(entry.value().clone())
    }
}

#[async_trait]
impl DnsLookup for ResolverPool {
    async fn fetch_ech_config_list(
        &self,
        dns_server: &str,
        domain: &str,
    ) -> std::result::Result<Vec<u8>, FetchError> {
        self.resolver(dns_server)
            .await?
            .lookup_ech_config_list(domain)
            .await
    }

    async fn lookup_ip(&self, dns_server: &str, host: &str) -> Result<Vec<IpAddr>> {
        let resolver = self
            .resolver(dns_server)
            .await
            .map_err(|e| e.into_tunnel_error(host))?;
        resolver.lookup_ip(host).await
    }
}

/// DNS resolver bound to a single upstream server
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    doh_uri: Option<Uri>,
    doh_client: Option<Client>,
    ip_cache: RwLock<HashMap<String, CachedIpAddrs>>,
    resolve_timeout: Duration,
}

struct CachedIpAddrs {
    addrs: Vec<IpAddr>,
    expires_at: Instant,
}

impl DnsResolver {
    /// Create a resolver for one DNS server.
    ///
    /// Supported forms:
    /// - `https://dns.example.com/dns-query` - DoH server
    /// - `cloudflare`, `google`, `quad9` - well-known DoH servers
    /// - `udp://1.1.1.1`, `tcp://1.1.1.1:53`, `1.1.1.1`, `1.1.1.1:53` - plain DNS
    pub async fn new(dns_server: &str, resolve_timeout: Duration) -> std::result::Result<Self, FetchError> {
        let (config, doh_uri) = Self::parse_dns_server(dns_server).await?;

        let mut opts = ResolverOpts::default();
        opts.use_hosts_file = false;
        opts.timeout = resolve_timeout;
        opts.attempts = 2;

        let doh_client = match doh_uri {
            Some(_) => Some(Self::build_doh_client(resolve_timeout)?),
            None => None,
        };

        Ok(Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
            doh_uri,
            doh_client,
            ip_cache: RwLock::new(HashMap::new()),
            resolve_timeout,
        })
    }

    /// Parse a DNS server string into a resolver config and, for DoH, its URL
    async fn parse_dns_server(
        dns_server: &str,
    ) -> std::result::Result<(ResolverConfig, Option<Uri>), FetchError> {
        let server = dns_server.trim();
        let lower = server.to_ascii_lowercase();

        if lower == "cloudflare" || lower.contains("cloudflare-dns.com") {
            info!("Using Cloudflare DOH");
            return Ok((
                ResolverConfig::cloudflare_https(),
                Some(Uri::from_static("https://cloudflare-dns.com/dns-query")),
            ));
        }
        if lower == "google" || lower.contains("dns.google") {
            info!("Using Google DOH");
            return Ok((
                ResolverConfig::google_https(),
                Some(Uri::from_static("https://dns.google/dns-query")),
            ));
        }
        if lower == "quad9" || lower.contains("dns.quad9.net") {
            info!("Using Quad9 DOH");
            return Ok((
                ResolverConfig::quad9_https(),
                Some(Uri::from_static("https://dns.quad9.net/dns-query")),
            ));
        }
        // Well-known DoH hosts that are also reachable by fixed IPs
        for (needle, tls_name, ips) in [
            ("doh.pub", "doh.pub", ["1.12.12.12", "120.53.53.53"]),
            ("alidns.com", "dns.alidns.com", ["223.5.5.5", "223.6.6.6"]),
        ] {
            if lower.contains(needle) {
                info!("Using {} DOH", tls_name);
                let ips: Vec<IpAddr> = ips.iter().filter_map(|ip| ip.parse().ok()).collect();
                let group = NameServerConfigGroup::from_ips_https(&ips, 443, tls_name.to_string(), true);
                let uri: Uri = format!("https://{}/dns-query", tls_name)
                    .parse()
                    .map_err(|e| FetchError::Resolution(format!("bad DOH url: {}", e)))?;
                return Ok((ResolverConfig::from_parts(None, vec![], group), Some(uri)));
            }
        }

        if let Some(rest) = lower.strip_prefix("udp://") {
            let addr = Self::parse_plain_server(rest)?;
            let group = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
            return Ok((ResolverConfig::from_parts(None, vec![], group), None));
        }
        if let Some(rest) = lower.strip_prefix("tcp://") {
            let addr = Self::parse_plain_server(rest)?;
            let mut group = NameServerConfigGroup::new();
            group.push(NameServerConfig {
                socket_addr: addr,
                protocol: Protocol::Tcp,
                tls_dns_name: None,
                trust_negative_responses: true,
                tls_config: None,
                bind_addr: None,
            });
            return Ok((ResolverConfig::from_parts(None, vec![], group), None));
        }
        if !lower.starts_with("https://") {
            let addr = Self::parse_plain_server(server)?;
            let group = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
            return Ok((ResolverConfig::from_parts(None, vec![], group), None));
        }

        let uri: Uri = server
            .parse()
            .map_err(|e| FetchError::Resolution(format!("Invalid DOH URL '{}': {}", server, e)))?;
        let host = uri
            .host()
            .ok_or_else(|| FetchError::Resolution(format!("Missing host in DOH URL: {}", server)))?
            .to_string();
        let port = uri.port_u16().unwrap_or(443);
        if !matches!(uri.path(), "" | "/" | "/dns-query") {
            warn!(
                "Custom DOH path '{}' is only honoured by the GET fallback",
                uri.path()
            );
        }

        let mut ips = Vec::new();
        if let Ok(ip) = host.parse::<IpAddr>() {
            ips.push(ip);
        } else {
            // Bootstrap the DoH host with the system resolver.
            let addrs = lookup_host((host.as_str(), port)).await.map_err(|e| {
                FetchError::Network(format!("Failed to resolve DOH host {}: {}", host, e))
            })?;
            ips.extend(addrs.map(|addr| addr.ip()));
        }
        if ips.is_empty() {
            return Err(FetchError::Network(format!(
                "No IP addresses resolved for DOH host: {}",
                host
            )));
        }
        ips.sort_by_key(|a| if a.is_ipv4() { 0 } else { 1 });

        let group = NameServerConfigGroup::from_ips_https(&ips, port, host, true);
        Ok((ResolverConfig::from_parts(None, vec![], group), Some(uri)))
    }

    fn parse_plain_server(s: &str) -> std::result::Result<SocketAddr, FetchError> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr);
        }
        s.trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map(|ip| SocketAddr::new(ip, 53))
            .map_err(|_| FetchError::Resolution(format!("Invalid DNS server: {}", s)))
    }

    /// Lookup the ECHConfigList for a domain via its HTTPS DNS record
    pub async fn lookup_ech_config_list(&self, domain: &str) -> std::result::Result<Vec<u8>, FetchError> {
        info!("Looking up HTTPS record for ECH config: {}", domain);
        let start = Instant::now();

        let lookup = match tokio::time::timeout(
            self.resolve_timeout,
            self.resolver.lookup(domain, RecordType::HTTPS),
        )
        .await
        {
            Ok(Ok(lookup)) => lookup,
            Ok(Err(e)) => {
                let err = classify_resolve_error(&e);
                if self.doh_client.is_some() && !matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
                    warn!(
                        "ECH HTTPS lookup failed for {}, falling back to DoH GET: {}",
                        domain, e
                    );
                    return self.lookup_ech_config_via_doh_get(domain).await;
                }
                return Err(err);
            }
            Err(_) => {
                if self.doh_client.is_some() {
                    warn!("ECH HTTPS lookup timed out for {}, falling back to DoH GET", domain);
                    return self.lookup_ech_config_via_doh_get(domain).await;
                }
                return Err(FetchError::Resolution(format!(
                    "HTTPS query timed out after {:?}",
                    self.resolve_timeout
                )));
            }
        };

        for rdata in lookup.iter() {
            if let Some(https) = rdata.as_https() {
                if let Some(ech_config) = extract_ech_from_https(https) {
                    debug!(
                        "ECH HTTPS lookup succeeded for {} in {} ms ({} bytes)",
                        domain,
                        start.elapsed().as_millis(),
                        ech_config.len()
                    );
                    return Ok(ech_config);
                }
            }
        }

        warn!("No ECH config found in HTTPS record for {}", domain);
        Err(FetchError::Resolution(format!(
            "HTTPS record for {} carries no ech parameter",
            domain
        )))
    }

    /// Lookup IP addresses for a host (cached for ten minutes)
    pub async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        {
            let cache = self.ip_cache.read();
            if let Some(cached) = cache.get(host) {
                if cached.expires_at > Instant::now() {
                    debug!("IP cache hit for {}", host);
                    return Ok(cached.addrs.clone());
                }
            }
        }

        debug!("Looking up IP for {}", host);
        let start = Instant::now();
        let result = tokio::time::timeout(self.resolve_timeout, self.resolver.lookup_ip(host)).await;

        let mut addrs: Vec<IpAddr> = match result {
            Ok(Ok(lookup)) => lookup.iter().collect(),
            Ok(Err(e)) if self.doh_client.is_some() => {
                warn!("IP lookup failed for {}, falling back to DoH GET: {}", host, e);
                self.lookup_ip_via_doh_get(host).await?
            }
            Ok(Err(e)) => return Err(classify_resolve_error(&e).into_tunnel_error(host)),
            Err(_) if self.doh_client.is_some() => {
                warn!("IP lookup timed out for {}, falling back to DoH GET", host);
                self.lookup_ip_via_doh_get(host).await?
            }
            Err(_) => {
                return Err(TunnelError::Resolution {
                    domain: host.to_string(),
                    reason: "lookup timed out".to_string(),
                })
            }
        };

        if addrs.is_empty() {
            return Err(TunnelError::Resolution {
                domain: host.to_string(),
                reason: "no addresses".to_string(),
            });
        }
        addrs.sort_by_key(|a| if a.is_ipv4() { 0 } else { 1 });

        self.ip_cache.write().insert(
            host.to_string(),
            CachedIpAddrs {
                addrs: addrs.clone(),
                expires_at: Instant::now() + IP_CACHE_TTL,
            },
        );
        debug!(
            "IP lookup succeeded for {} in {} ms",
            host,
            start.elapsed().as_millis()
        );
        Ok(addrs)
    }

    fn build_doh_client(timeout: Duration) -> std::result::Result<Client, FetchError> {
        Client::builder()
            .timeout(timeout)
            // Keep connections alive to reuse TLS/HTTP2 sessions.
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .tcp_keepalive(Duration::from_secs(60))
            .http2_keep_alive_interval(Duration::from_secs(30))
            .http2_keep_alive_timeout(Duration::from_secs(10))
            .http2_keep_alive_while_idle(true)
            .build()
            .map_err(|e| FetchError::Network(format!("Failed to build DoH client: {}", e)))
    }

    async fn lookup_ech_config_via_doh_get(&self, domain: &str) -> std::result::Result<Vec<u8>, FetchError> {
        let start = Instant::now();
        let message = self.doh_get_message(domain, RecordType::HTTPS).await?;

        for record in message.answers() {
            if let Some(RData::HTTPS(https)) = record.data() {
                if let Some(ech_config) = extract_ech_from_https(https) {
                    debug!(
                        "ECH DoH GET lookup succeeded for {} in {} ms",
                        domain,
                        start.elapsed().as_millis()
                    );
                    return Ok(ech_config);
                }
            }
        }

        Err(FetchError::Resolution(format!(
            "no ech parameter in DoH answer for {}",
            domain
        )))
    }

    async fn lookup_ip_via_doh_get(&self, host: &str) -> Result<Vec<IpAddr>> {
        let (a_result, aaaa_result) = tokio::join!(
            self.doh_get_message(host, RecordType::A),
            self.doh_get_message(host, RecordType::AAAA),
        );

        let mut addrs = Vec::new();
        let mut last_error = None;
        for result in [a_result, aaaa_result] {
            match result {
                Ok(message) => {
                    for record in message.answers() {
                        match record.data() {
                            Some(RData::A(a)) => addrs.push(IpAddr::V4(a.0)),
                            Some(RData::AAAA(aaaa)) => addrs.push(IpAddr::V6(aaaa.0)),
                            _ => {}
                        }
                    }
                }
                Err(e) => last_error = Some(e),
            }
        }

        if addrs.is_empty() {
            return Err(last_error
                .unwrap_or_else(|| FetchError::Resolution("no addresses".to_string()))
                .into_tunnel_error(host));
        }
        Ok(addrs)
    }

    /// RFC 8484 GET query
    async fn doh_get_message(
        &self,
        domain: &str,
        record_type: RecordType,
    ) -> std::result::Result<hickory_resolver::proto::op::Message, FetchError> {
        use hickory_resolver::proto::op::{Edns, Message, Query, ResponseCode};
        use hickory_resolver::proto::rr::Name;
        use std::str::FromStr;

        let (Some(client), Some(uri)) = (self.doh_client.as_ref(), self.doh_uri.as_ref()) else {
            return Err(FetchError::Resolution("DoH GET not available".to_string()));
        };
        let start = Instant::now();

        let fqdn = if domain.ends_with('.') {
            domain.to_string()
        } else {
            format!("{}.", domain)
        };
        let name = Name::from_str(&fqdn)
            .map_err(|e| FetchError::Resolution(format!("Invalid domain {}: {}", domain, e)))?;

        let mut request = Message::new();
        request.add_query(Query::query(name, record_type));
        request.set_recursion_desired(true);
        let mut edns = Edns::new();
        edns.set_version(0);
        edns.set_max_payload(1232);
        *request.extensions_mut() = Some(edns);

        let bytes = request
            .to_vec()
            .map_err(|e| FetchError::Resolution(format!("Failed to encode DNS query: {}", e)))?;
        let encoded = URL_SAFE_NO_PAD.encode(bytes);

        let scheme = uri.scheme_str().unwrap_or("https");
        let authority = uri
            .authority()
            .ok_or_else(|| FetchError::Resolution("Missing DOH authority".to_string()))?;
        let path = match uri.path() {
            "" | "/" => "/dns-query",
            p => p,
        };
        let url = format!("{}://{}{}?dns={}", scheme, authority, path, encoded);

        let response = client
            .get(url)
            .header("accept", "application/dns-message")
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        if !response.status().is_success() {
            return Err(FetchError::Resolution(format!(
                "DoH GET http error: {}",
                response.status()
            )));
        }

        if let Some(content_type) = response.headers().get(reqwest::header::CONTENT_TYPE) {
            let content_type = content_type
                .to_str()
                .map_err(|e| FetchError::Resolution(format!("Bad Content-Type: {}", e)))?;
            if !content_type.starts_with("application/dns-message") {
                return Err(FetchError::Resolution(format!(
                    "Unsupported Content-Type: {}",
                    content_type
                )));
            }
        }

        let body = response.bytes().await.map_err(classify_reqwest_error)?;
        let message = Message::from_vec(&body)
            .map_err(|e| FetchError::Resolution(format!("Invalid DNS response: {}", e)))?;
        if message.response_code() != ResponseCode::NoError {
            return Err(FetchError::Resolution(format!(
                "DNS response code {}",
                message.response_code()
            )));
        }

        debug!(
            "DoH GET {} {} completed in {} ms",
            domain,
            record_type,
            start.elapsed().as_millis()
        );
        Ok(message)
    }
}

/// Extract the ECHConfigList from an HTTPS/SVCB record
fn extract_ech_from_https(https: &HTTPS) -> Option<Vec<u8>> {
    use hickory_resolver::proto::rr::rdata::svcb::{SvcParamKey, SvcParamValue};

    // ECH config is in the "ech" parameter (key = 5)
    for (key, value) in https.svc_params().iter() {
        if let (SvcParamKey::EchConfig, SvcParamValue::EchConfig(ech_config)) = (key, value) {
            return Some(ech_config.0.clone());
        }
    }
    None
}

fn classify_resolve_error(e: &ResolveError) -> FetchError {
    match e.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => {
            FetchError::Resolution("no matching record".to_string())
        }
        ResolveErrorKind::Timeout => FetchError::Resolution("query timed out".to_string()),
        ResolveErrorKind::Io(io) => FetchError::Network(io.to_string()),
        ResolveErrorKind::NoConnections => {
            FetchError::Network("no connections available to the resolver".to_string())
        }
        _ => FetchError::Resolution(e.to_string()),
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> FetchError {
    if e.is_connect() {
        FetchError::Network(format!("DoH server unreachable: {}", e))
    } else if e.is_timeout() {
        FetchError::Resolution(format!("DoH query timed out: {}", e))
    } else {
        FetchError::Resolution(format!("DoH GET failed: {}", e))
    }
}
