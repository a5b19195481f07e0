// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Outbound HTTP clients for the log relay: the streaming sinks toward the
//! remote backend and the local owner, and the control-plane client that
//! mints ingestion credentials.
//!
//! With the `fips` feature every client is restricted to a FIPS-validated
//! rustls provider. [`install_crypto_provider`] must run once at startup,
//! before the first client is built.

use std::error::Error;
use std::time::Duration;

use reqwest::ClientBuilder;
#[cfg(feature = "fips")]
use tracing::debug;

pub type TlsError = Box<dyn Error + Send + Sync>;

/// TCP keepalive interval on streaming connections.
pub const STREAMING_KEEPALIVE: Duration = Duration::from_secs(30);

/// Connection behavior of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSettings {
    /// Bound on a whole request, response body included.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Idle connections kept open per host.
    pub max_idle_per_host: usize,
    pub tcp_keepalive: Option<Duration>,
}

impl ClientSettings {
    /// A sink: one long-lived keep-alive connection per destination.
    #[must_use]
    pub fn streaming(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            connect_timeout: request_timeout,
            max_idle_per_host: 1,
            tcp_keepalive: Some(STREAMING_KEEPALIVE),
        }
    }

    /// Occasional request/response exchanges, e.g. minting a credential.
    #[must_use]
    pub fn request(timeout: Duration) -> Self {
        Self {
            request_timeout: timeout,
            connect_timeout: timeout,
            max_idle_per_host: 0,
            tcp_keepalive: None,
        }
    }
}

/// Builds a client with `settings` on top of [`create_reqwest_client_builder`].
///
/// # Errors
///
/// The TLS setup failed, or reqwest rejected the builder.
pub fn build_client(settings: &ClientSettings) -> Result<reqwest::Client, TlsError> {
    let client = create_reqwest_client_builder()?
        .pool_max_idle_per_host(settings.max_idle_per_host)
        .tcp_keepalive(settings.tcp_keepalive)
        .connect_timeout(settings.connect_timeout)
        .timeout(settings.request_timeout)
        .build()?;
    Ok(client)
}

/// Nothing to install: reqwest brings its own rustls provider.
///
/// # Errors
///
/// Never.
#[cfg(not(feature = "fips"))]
pub fn install_crypto_provider() -> Result<(), TlsError> {
    Ok(())
}

/// Installs the AWS-LC FIPS provider as the process-wide rustls default.
///
/// # Errors
///
/// Another, non-FIPS provider is already installed.
#[cfg(feature = "fips")]
pub fn install_crypto_provider() -> Result<(), TlsError> {
    if rustls::crypto::CryptoProvider::get_default().is_some_and(|provider| provider.fips()) {
        return Ok(());
    }
    rustls::crypto::default_fips_provider()
        .install_default()
        .map_err(|installed| format!("Failed to set up fips provider: {installed:?}"))?;
    debug!("TLS | FIPS crypto provider installed");
    Ok(())
}

/// Creates a reqwest client builder backed by reqwest's bundled rustls setup.
///
/// # Errors
///
/// Never.
#[cfg(not(feature = "fips"))]
pub fn create_reqwest_client_builder() -> Result<ClientBuilder, TlsError> {
    Ok(reqwest::Client::builder().use_rustls_tls())
}

/// Creates a reqwest client builder restricted to the installed FIPS
/// provider, trusting only the host's native root certificates.
///
/// # Errors
///
/// No FIPS provider is installed, or no usable root certificate was found.
#[cfg(feature = "fips")]
pub fn create_reqwest_client_builder() -> Result<ClientBuilder, TlsError> {
    let provider = rustls::crypto::CryptoProvider::get_default()
        .ok_or("No crypto provider configured, call install_crypto_provider first")?;

    if !provider.fips() {
        return Err("Crypto provider is not FIPS-compliant".into());
    }

    let mut root_cert_store = rustls::RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    let mut valid_count = 0;
    for cert in native_certs.certs {
        match root_cert_store.add(cert) {
            Ok(()) => valid_count += 1,
            Err(err) => debug!("TLS | Skipping unparsable root certificate: {:?}", err),
        }
    }
    if valid_count == 0 {
        return Err("No valid certificates found in native root store".into());
    }

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .map_err(|_| "Failed to set protocol versions")?
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();

    if !config.fips() {
        return Err("The final TLS configuration is not FIPS-compliant".into());
    }
    debug!("TLS | Client builder configured with {valid_count} FIPS root certificates");

    Ok(reqwest::Client::builder().use_preconfigured_tls(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_settings_keep_one_connection() {
        let settings = ClientSettings::streaming(Duration::from_secs(5));
        assert_eq!(settings.max_idle_per_host, 1);
        assert_eq!(settings.tcp_keepalive, Some(STREAMING_KEEPALIVE));
        assert_eq!(settings.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_request_settings_pool_nothing() {
        let settings = ClientSettings::request(Duration::from_secs(2));
        assert_eq!(settings.max_idle_per_host, 0);
        assert_eq!(settings.tcp_keepalive, None);
    }

    #[cfg(not(feature = "fips"))]
    #[test]
    fn test_builds_clients_without_a_provider_install() {
        install_crypto_provider().expect("no-op install");
        assert!(build_client(&ClientSettings::streaming(Duration::from_secs(1))).is_ok());
        assert!(build_client(&ClientSettings::request(Duration::from_secs(1))).is_ok());
    }

    #[cfg(feature = "fips")]
    #[test]
    fn test_install_is_idempotent() {
        install_crypto_provider().expect("first install");
        install_crypto_provider().expect("second install");
        assert!(rustls::crypto::CryptoProvider::get_default().is_some_and(|p| p.fips()));
    }
}
