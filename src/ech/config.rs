//! ECH configuration values as retrieved from DNS

use crate::dns::FetchError;
use bytes::Bytes;
use rustls::pki_types::EchConfigListBytes;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

/// ECH version published by current servers (draft-ietf-tls-esni-18)
const ECH_VERSION_V18: u16 = 0xfe0d;

/// Immutable ECHConfigList for one cover domain.
///
/// Equality and hashing only look at the bytes and the domain; two values
/// fetched at different times compare equal when the server published the
/// same list.
#[derive(Clone)]
pub struct EchConfiguration {
    bytes: Bytes,
    domain: String,
    created_at: Instant,
}

impl EchConfiguration {
    /// Validate and wrap an ECHConfigList.
    ///
    /// Some resolvers hand out the list without its outer 2-byte length; such
    /// input is re-prefixed. Anything that does not frame as a list of
    /// `version/length/body` entries is rejected as malformed.
    pub fn new(config_list: impl Into<Vec<u8>>, domain: impl Into<String>) -> Result<Self, FetchError> {
        let raw = config_list.into();
        let bytes = normalize_config_list(raw)?;
        Ok(Self {
            bytes: Bytes::from(bytes),
            domain: domain.into(),
            created_at: Instant::now(),
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.age() > ttl
    }

    /// The list in the form rustls expects
    pub fn config_list(&self) -> EchConfigListBytes<'static> {
        EchConfigListBytes::from(self.bytes.to_vec())
    }

    /// Public (outer SNI) names of every draft-18 entry in the list
    pub fn public_names(&self) -> Vec<String> {
        entries(&self.bytes[2..])
            .filter(|(version, _)| *version == ECH_VERSION_V18)
            .filter_map(|(_, contents)| public_name(contents))
            .collect()
    }
}

impl PartialEq for EchConfiguration {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes && self.domain == other.domain
    }
}

impl Eq for EchConfiguration {}

impl Hash for EchConfiguration {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
        self.domain.hash(state);
    }
}

impl fmt::Debug for EchConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EchConfiguration")
            .field("domain", &self.domain)
            .field("len", &self.bytes.len())
            .field("age", &self.age())
            .finish()
    }
}

fn normalize_config_list(bytes: Vec<u8>) -> Result<Vec<u8>, FetchError> {
    if bytes.len() >= 2 {
        let declared = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        if declared == bytes.len() - 2 && frames_cleanly(&bytes[2..]) {
            return Ok(bytes);
        }
    }

    if frames_cleanly(&bytes) && bytes.len() <= u16::MAX as usize {
        let mut prefixed = Vec::with_capacity(bytes.len() + 2);
        prefixed.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        prefixed.extend_from_slice(&bytes);
        return Ok(prefixed);
    }

    Err(FetchError::Resolution(format!(
        "malformed ECHConfigList ({} bytes)",
        bytes.len()
    )))
}

/// True when `body` is one or more complete `version/length/contents` entries.
fn frames_cleanly(body: &[u8]) -> bool {
    let mut rest = body;
    let mut count = 0;
    while !rest.is_empty() {
        if rest.len() < 4 {
            return false;
        }
        let len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        if rest.len() < 4 + len {
            return false;
        }
        rest = &rest[4 + len..];
        count += 1;
    }
    count > 0
}

fn entries(body: &[u8]) -> impl Iterator<Item = (u16, &[u8])> {
    let mut rest = body;
    std::iter::from_fn(move || {
        if rest.len() < 4 {
            return None;
        }
        let version = u16::from_be_bytes([rest[0], rest[1]]);
        let len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        let contents = rest.get(4..4 + len)?;
        rest = &rest[4 + len..];
        Some((version, contents))
    })
}

fn public_name(contents: &[u8]) -> Option<String> {
    // config_id(1) kem_id(2) public_key<2> cipher_suites<2> max_name_len(1) public_name<1>
    let mut pos = 3;
    let pk_len = u16::from_be_bytes([*contents.get(pos)?, *contents.get(pos + 1)?]) as usize;
    pos += 2 + pk_len;
    let cs_len = u16::from_be_bytes([*contents.get(pos)?, *contents.get(pos + 1)?]) as usize;
    pos += 2 + cs_len + 1;
    let name_len = *contents.get(pos)? as usize;
    let name = contents.get(pos + 1..pos + 1 + name_len)?;
    String::from_utf8(name.to_vec()).ok()
}

/// Build a syntactically valid single-entry ECHConfigList for tests.
#[cfg(test)]
pub(crate) fn sample_config_list(public_name: &str, config_id: u8) -> Vec<u8> {
    let mut contents = vec![config_id, 0x00, 0x20];
    contents.extend_from_slice(&32u16.to_be_bytes());
    contents.extend_from_slice(&[0x42; 32]);
    contents.extend_from_slice(&4u16.to_be_bytes());
    contents.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
    contents.push(0);
    contents.push(public_name.len() as u8);
    contents.extend_from_slice(public_name.as_bytes());
    contents.extend_from_slice(&0u16.to_be_bytes());

    let mut entry = ECH_VERSION_V18.to_be_bytes().to_vec();
    entry.extend_from_slice(&(contents.len() as u16).to_be_bytes());
    entry.extend_from_slice(&contents);

    let mut list = (entry.len() as u16).to_be_bytes().to_vec();
    list.extend_from_slice(&entry);
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn equality_ignores_creation_time() {
        let bytes = sample_config_list("cloudflare-ech.com", 1);
        let a = EchConfiguration::new(bytes.clone(), "cloudflare-ech.com").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let b = EchConfiguration::new(bytes.clone(), "cloudflare-ech.com").unwrap();
        assert_ne!(a.created_at(), b.created_at());
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a.clone());
        assert!(set.contains(&b));

        let other_domain = EchConfiguration::new(bytes, "other.example").unwrap();
        assert_ne!(a, other_domain);
        let other_bytes =
            EchConfiguration::new(sample_config_list("cloudflare-ech.com", 2), "cloudflare-ech.com")
                .unwrap();
        assert_ne!(a, other_bytes);
    }

    #[test]
    fn reprefixes_bare_entries() {
        let full = sample_config_list("cover.example", 7);
        let bare = full[2..].to_vec();
        let config = EchConfiguration::new(bare, "cover.example").unwrap();
        assert_eq!(config.bytes(), &full[..]);
        assert_eq!(config.public_names(), vec!["cover.example".to_string()]);
    }

    #[test]
    fn rejects_malformed_lists() {
        assert!(EchConfiguration::new(Vec::new(), "x").is_err());
        assert!(EchConfiguration::new(vec![0x00, 0x05, 0xfe, 0x0d], "x").is_err());
        let mut truncated = sample_config_list("cover.example", 1);
        truncated.truncate(truncated.len() - 3);
        assert!(matches!(
            EchConfiguration::new(truncated, "x"),
            Err(FetchError::Resolution(_))
        ));
    }

    #[test]
    fn expiry_follows_ttl() {
        let config = EchConfiguration::new(sample_config_list("c.example", 1), "c.example").unwrap();
        assert!(!config.is_expired(Duration::from_secs(3600)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(config.is_expired(Duration::from_millis(1)));
    }
}
