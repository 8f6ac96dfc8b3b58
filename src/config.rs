//! Channel and TLS configuration.
//!
//! Certificate material is supplied out-of-band: callers hand the channel
//! a pre-built rustls config and retain full control over roots, client
//! auth, ALPN and resumption. The helpers below cover the common case of
//! building a config from DER material with the protocol floor pinned.

use std::sync::{Arc, Once};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{RootCertStore, SupportedProtocolVersion};

use crate::buffer::DEFAULT_SOFT_CAP;

/// Protocol versions the channel will negotiate. TLS 1.0/1.1 are rejected.
pub static PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Install the process-wide default crypto provider.
///
/// The TLS library mandates one-time global initialization; every config
/// constructor and session funnels through here, so callers never need to
/// call it themselves. Safe to call from any thread, any number of times.
pub fn install_provider() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// Tuning knobs for a single channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Soft capacity of the ingress and egress ciphertext buffers.
    /// Advisory: a single record batch may overshoot it.
    pub ciphertext_soft_cap: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ciphertext_soft_cap: DEFAULT_SOFT_CAP,
        }
    }
}

/// TLS configuration for the accepting side. Pass a pre-built rustls
/// ServerConfig; the caller loads certs/keys and configures ALPN etc.
#[derive(Clone)]
pub struct TlsConfig {
    pub server_config: Arc<rustls::ServerConfig>,
}

impl TlsConfig {
    pub fn new(server_config: Arc<rustls::ServerConfig>) -> Self {
        Self { server_config }
    }

    /// Build a config from a DER certificate chain and private key, with
    /// the protocol floor pinned.
    pub fn from_der(
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, rustls::Error> {
        install_provider();
        let config = rustls::ServerConfig::builder_with_protocol_versions(PROTOCOL_VERSIONS)
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)?;
        Ok(Self {
            server_config: Arc::new(config),
        })
    }
}

/// TLS configuration for the connecting side. Pass a pre-built rustls
/// ClientConfig; the caller configures root certs, ALPN, etc.
#[derive(Clone)]
pub struct TlsClientConfig {
    pub client_config: Arc<rustls::ClientConfig>,
}

impl TlsClientConfig {
    pub fn new(client_config: Arc<rustls::ClientConfig>) -> Self {
        Self { client_config }
    }

    /// Build a config trusting the given roots, with the protocol floor
    /// pinned.
    pub fn from_roots(roots: RootCertStore) -> Self {
        install_provider();
        let config = rustls::ClientConfig::builder_with_protocol_versions(PROTOCOL_VERSIONS)
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            client_config: Arc::new(config),
        }
    }
}

/// Which end of the handshake this channel plays.
pub enum Side {
    Client {
        config: TlsClientConfig,
        server_name: ServerName<'static>,
    },
    Server {
        config: TlsConfig,
    },
}
