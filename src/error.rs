/// Result type used by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the negotiation engine.
///
/// All variants carry owned, cloneable payloads so a single terminal
/// delivery can be fanned out to every callback registered on a shared
/// secret provider.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No TLS context applies to this connection and no fallback
    /// negotiator is configured.
    #[error("no certificate source found")]
    NoCertificateSource,

    /// A secret provider could not be constructed from the descriptor.
    ///
    /// This is a synchronous failure: the descriptor was never valid
    /// input. On the server side it is eligible for fallback.
    #[error("failed creating secret provider: {0}")]
    ProviderCreationFailed(String),

    /// Asynchronous acquisition failed after a valid descriptor was
    /// accepted. Never eligible for fallback.
    #[error("secret delivery failed: {0}")]
    SecretDeliveryFailed(String),

    /// The TLS stage reported a protocol failure after material was
    /// obtained.
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    /// Static TLS material could not be parsed.
    #[error("invalid TLS material: {0}")]
    InvalidMaterial(String),

    /// The secret provider cache has been shut down.
    #[error("secret provider cache is closed")]
    Closed,
}
