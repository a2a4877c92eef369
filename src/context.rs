//! TLS context descriptors and per-connection metadata.
//!
//! A descriptor is an immutable, comparable value naming one TLS
//! configuration: either static certificate material or a reference to
//! secret-discovery-managed material. Descriptor equality is the cache
//! key in [`crate::SecretProviderCache`]: two connections whose contexts
//! resolve to the same configuration share one live provider.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::Result;
use crate::material;

/// Where the certificate/key/trust material for a context comes from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CertSource {
    /// Inline PEM material supplied directly in configuration.
    ///
    /// Each field is independently optional: a client-side context may
    /// carry only trust roots, a server-side context may carry only a
    /// certificate chain and key.
    StaticPem {
        /// PEM-encoded certificate chain, leaf first.
        cert_chain_pem: Option<String>,
        /// PEM-encoded private key for the leaf certificate.
        private_key_pem: Option<String>,
        /// PEM-encoded trust root certificates.
        trust_roots_pem: Option<String>,
    },

    /// PEM material loaded from the filesystem at acquisition time.
    StaticFiles {
        /// Path to the PEM certificate chain, leaf first.
        cert_chain: Option<PathBuf>,
        /// Path to the PEM private key.
        private_key: Option<PathBuf>,
        /// Path to the PEM trust roots.
        trust_roots: Option<PathBuf>,
    },

    /// Material managed by the secret-discovery control plane,
    /// referenced by secret name.
    Discovery {
        /// Name of the secret as known to the discovery source.
        secret_name: String,
        /// Which discovery source serves the secret.
        source: DiscoverySource,
    },
}

/// Configuration of a secret-discovery source.
///
/// The discovery-protocol client itself is external to this engine; the
/// source configuration only participates in descriptor equality and is
/// handed to the injected [`crate::SecretFetcher`] verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DiscoverySource {
    /// URI of the discovery server, e.g. `unix:///run/sds.sock`.
    pub server_uri: String,
}

/// Identifies one concrete TLS configuration. Cache key for
/// [`crate::SecretProviderCache`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TlsContextDescriptor {
    /// Source of the certificate/key/trust material.
    pub cert_source: CertSource,
}

impl TlsContextDescriptor {
    /// Creates a descriptor from a certificate source.
    pub fn new(cert_source: CertSource) -> Self {
        Self { cert_source }
    }

    /// Validates the parts of the descriptor that can be checked without
    /// I/O. Inline PEM that does not parse makes provider construction
    /// fail synchronously rather than at delivery time; control planes
    /// can run the same check when accepting configuration.
    ///
    /// ## Errors
    ///
    /// Returns [`crate::Error::InvalidMaterial`] for inline PEM that
    /// does not parse.
    pub fn validate(&self) -> Result<()> {
        match &self.cert_source {
            CertSource::StaticPem {
                cert_chain_pem,
                private_key_pem,
                trust_roots_pem,
            } => material::from_pem(
                cert_chain_pem.as_deref(),
                private_key_pem.as_deref(),
                trust_roots_pem.as_deref(),
            )
            .map(|_| ()),
            CertSource::StaticFiles { .. } | CertSource::Discovery { .. } => Ok(()),
        }
    }
}

/// Client-side TLS context, read from connection metadata.
///
/// `None` and a descriptor-less inner value both mean "no TLS for this
/// connection"; see [`UpstreamTlsContext::into_descriptor`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct UpstreamTlsContext {
    inner: Option<TlsContextDescriptor>,
}

impl UpstreamTlsContext {
    /// Creates a context that negotiates TLS using `descriptor`.
    pub fn new(descriptor: TlsContextDescriptor) -> Self {
        Self {
            inner: Some(descriptor),
        }
    }

    /// Creates an empty context, meaning "use plaintext".
    pub fn empty() -> Self {
        Self { inner: None }
    }

    /// Returns `true` if this context carries no TLS configuration.
    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    /// Consumes the context, yielding its descriptor if one is present.
    ///
    /// An empty context is deliberately indistinguishable from an absent
    /// one here: both negotiate plaintext.
    pub fn into_descriptor(self) -> Option<TlsContextDescriptor> {
        self.inner
    }
}

/// Server-side TLS context, produced by listener resolution.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct DownstreamTlsContext {
    inner: Option<TlsContextDescriptor>,
}

impl DownstreamTlsContext {
    /// Creates a context that negotiates TLS using `descriptor`.
    pub fn new(descriptor: TlsContextDescriptor) -> Self {
        Self {
            inner: Some(descriptor),
        }
    }

    /// Creates an empty context, meaning "no TLS for this connection".
    pub fn empty() -> Self {
        Self { inner: None }
    }

    /// Returns `true` if this context carries no TLS configuration.
    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    /// Consumes the context, yielding its descriptor if one is present.
    pub fn into_descriptor(self) -> Option<TlsContextDescriptor> {
        self.inner
    }
}

/// Per-connection association populated by the caller before
/// negotiation begins.
#[derive(Clone, Debug, Default)]
pub struct ConnectionMetadata {
    /// Client-side TLS context; absent means plaintext.
    pub upstream_context: Option<UpstreamTlsContext>,

    /// Authority (host) the client is connecting to, used for SNI.
    pub authority: Option<String>,

    /// Local address of the connection, if known.
    pub local_addr: Option<SocketAddr>,

    /// Remote address of the connection, if known.
    pub peer_addr: Option<SocketAddr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pem_descriptor(roots: &str) -> TlsContextDescriptor {
        TlsContextDescriptor::new(CertSource::StaticPem {
            cert_chain_pem: None,
            private_key_pem: None,
            trust_roots_pem: Some(roots.to_string()),
        })
    }

    #[test]
    fn empty_and_absent_upstream_contexts_both_mean_plaintext() {
        assert!(UpstreamTlsContext::empty().is_empty());
        assert_eq!(UpstreamTlsContext::empty().into_descriptor(), None);
        assert_eq!(UpstreamTlsContext::default(), UpstreamTlsContext::empty());
    }

    #[test]
    fn descriptor_equality_is_configuration_equality() {
        let a = pem_descriptor("-----BEGIN CERTIFICATE-----");
        let b = pem_descriptor("-----BEGIN CERTIFICATE-----");
        let c = pem_descriptor("-----BEGIN CERTIFICATE----- other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn malformed_inline_pem_fails_validation() {
        let descriptor = TlsContextDescriptor::new(CertSource::StaticPem {
            cert_chain_pem: Some("not pem at all".to_string()),
            private_key_pem: Some("garbage".to_string()),
            trust_roots_pem: None,
        });
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn discovery_descriptors_validate_without_io() {
        let descriptor = TlsContextDescriptor::new(CertSource::Discovery {
            secret_name: "server-cert".to_string(),
            source: DiscoverySource {
                server_uri: "unix:///run/sds.sock".to_string(),
            },
        });
        assert!(descriptor.validate().is_ok());
    }
}
