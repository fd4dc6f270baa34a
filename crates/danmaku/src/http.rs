//! Shared HTTP client construction.

use std::sync::OnceLock;

use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::Result;

/// Install the aws-lc-rs crypto provider for rustls once per process.
///
/// Both the HTTP client and the WebSocket TLS stream pick it up.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate got there first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build a `reqwest::Client` from the session configuration.
pub fn build_client(config: &ClientConfig) -> Result<reqwest::Client> {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(config.http_timeout());

    if let Some(url) = config.http_proxy.as_deref() {
        match reqwest::Proxy::all(url) {
            Ok(proxy) => builder = builder.proxy(proxy),
            Err(error) => {
                warn!(proxy_url = %url, error = %error, "Invalid proxy URL; disabling proxy");
                builder = builder.no_proxy();
            }
        }
    }

    Ok(builder.build()?)
}
