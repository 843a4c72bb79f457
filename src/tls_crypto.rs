use rustls::crypto::CryptoProvider;
use rustls::NamedGroup;
use std::sync::Arc;

/// aws-lc-rs provider with the post-quantum hybrid groups removed.
///
/// The hybrid key shares push the ClientHello past a single segment, which
/// some ECH front-ends answer with a reset.
pub fn build_provider() -> Arc<CryptoProvider> {
    let mut provider = rustls::crypto::aws_lc_rs::default_provider();
    provider.kx_groups.retain(|group| {
        !matches!(
            group.name(),
            NamedGroup::X25519MLKEM768 | NamedGroup::secp256r1MLKEM768 | NamedGroup::MLKEM768
        )
    });
    Arc::new(provider)
}
