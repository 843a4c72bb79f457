//! Listener certificates for the `wss://` acceptor
//!
//! Either loaded from PEM files or generated as a self-signed certificate.

use crate::error::{Result, TunnelError};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};
use rustls::ServerConfig;
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

/// A freshly generated self-signed certificate and its key
pub struct GeneratedCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: CertificateDer<'static>,
    key_der: Vec<u8>,
}

impl GeneratedCert {
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()));
        build_server_config(vec![self.cert_der.clone()], key)
    }
}

/// Generate a self-signed server certificate valid for `names`.
pub fn generate_self_signed(names: &[String]) -> Result<GeneratedCert> {
    let mut params = CertificateParams::new(names.to_vec())
        .map_err(|e| TunnelError::Certificate(format!("Invalid hostname: {}", e)))?;

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        names.first().map(String::as_str).unwrap_or("ech-tunnel"),
    );
    dn.push(DnType::OrganizationName, "ech-tunnel");
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(825);

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.is_ca = IsCa::NoCa;

    let key_pair = KeyPair::generate()
        .map_err(|e| TunnelError::Certificate(format!("Failed to generate key: {}", e)))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TunnelError::Certificate(format!("Failed to sign cert: {}", e)))?;

    debug!("Generated self-signed certificate for {:?}", names);
    Ok(GeneratedCert {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        cert_der: cert.der().clone(),
        key_der: key_pair.serialize_der(),
    })
}

/// Build a server config from a PEM certificate chain and private key.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        TunnelError::Certificate(format!("Failed to read {}: {}", cert_path.display(), e))
    })?;
    let key_pem = std::fs::read(key_path).map_err(|e| {
        TunnelError::Certificate(format!("Failed to read {}: {}", key_path.display(), e))
    })?;

    let chain = parse_cert_chain(&cert_pem)?;
    let key = parse_private_key(&key_pem)?;
    info!(
        "Loaded listener certificate from {} ({} certs)",
        cert_path.display(),
        chain.len()
    );
    build_server_config(chain, key)
}

fn parse_cert_chain(data: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let blocks = pem::parse_many(data)
        .map_err(|e| TunnelError::Certificate(format!("Failed to parse cert PEM: {}", e)))?;
    let chain: Vec<_> = blocks
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| CertificateDer::from(block.into_contents()))
        .collect();
    if chain.is_empty() {
        return Err(TunnelError::Certificate(
            "no CERTIFICATE block found".to_string(),
        ));
    }
    Ok(chain)
}

fn parse_private_key(data: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let blocks = pem::parse_many(data)
        .map_err(|e| TunnelError::Certificate(format!("Failed to parse key PEM: {}", e)))?;
    for block in blocks {
        let key = match block.tag() {
            "PRIVATE KEY" => PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(block.into_contents())),
            "RSA PRIVATE KEY" => {
                PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(block.into_contents()))
            }
            "EC PRIVATE KEY" => PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(block.into_contents())),
            _ => continue,
        };
        return Ok(key);
    }
    Err(TunnelError::Certificate("no private key block found".to_string()))
}

fn build_server_config(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder_with_provider(crate::tls_crypto::build_provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| TunnelError::Certificate(format!("Failed to build config: {}", e)))?;
    Ok(Arc::new(config))
}
