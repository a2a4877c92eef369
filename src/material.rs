//! Delivered TLS material and rustls configuration construction.

use std::sync::Arc;

use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::prelude::debug;

/// DER encoding of a private key, tagged with its format.
#[derive(Clone)]
pub struct TlsKey {
    format: PrivateKeyFormat,
    der: Zeroizing<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PrivateKeyFormat {
    Pkcs8,
    Pkcs1,
    Sec1,
}

impl std::fmt::Debug for TlsKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsKey")
            .field("format", &self.format)
            .field("der", &"<redacted>")
            .finish()
    }
}

impl TlsKey {
    /// Converts a parsed rustls key into the owned, format-tagged form.
    pub fn from_der(key: PrivateKeyDer<'_>) -> Result<Self> {
        let (format, der) = match &key {
            PrivateKeyDer::Pkcs8(k) => (PrivateKeyFormat::Pkcs8, k.secret_pkcs8_der().to_vec()),
            PrivateKeyDer::Pkcs1(k) => (PrivateKeyFormat::Pkcs1, k.secret_pkcs1_der().to_vec()),
            PrivateKeyDer::Sec1(k) => (PrivateKeyFormat::Sec1, k.secret_sec1_der().to_vec()),
            _ => {
                return Err(Error::InvalidMaterial(
                    "unsupported private key encoding".to_string(),
                ))
            }
        };
        Ok(Self {
            format,
            der: Zeroizing::new(der),
        })
    }

    /// Rebuilds the rustls key type for config construction.
    pub fn to_der(&self) -> PrivateKeyDer<'static> {
        let bytes = self.der.to_vec();
        match self.format {
            PrivateKeyFormat::Pkcs8 => PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(bytes)),
            PrivateKeyFormat::Pkcs1 => PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(bytes)),
            PrivateKeyFormat::Sec1 => PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(bytes)),
        }
    }
}

/// One delivered TLS configuration: certificate chain, private key and
/// trust roots derived from a context descriptor.
///
/// Any of the parts may be empty; whether that is acceptable depends on
/// the role the material is used for (see [`client_config`] and
/// [`server_config`]).
#[derive(Clone, Debug)]
pub struct TlsMaterial {
    /// Certificate chain, leaf first. May be empty for a client that
    /// does not authenticate itself.
    pub cert_chain: Vec<CertificateDer<'static>>,

    /// Private key for the leaf certificate, if any.
    pub key: Option<TlsKey>,

    /// Trust root certificates. May be empty for a server that does not
    /// verify clients.
    pub trust_roots: Vec<CertificateDer<'static>>,
}

/// Parses static PEM material into a [`TlsMaterial`].
///
/// Each part is independently optional, but a part that is present must
/// parse to at least one usable item.
///
/// ## Errors
///
/// Returns [`Error::InvalidMaterial`] if all parts are absent, or any
/// present part fails to parse.
pub fn from_pem(
    cert_chain_pem: Option<&str>,
    private_key_pem: Option<&str>,
    trust_roots_pem: Option<&str>,
) -> Result<TlsMaterial> {
    if cert_chain_pem.is_none() && private_key_pem.is_none() && trust_roots_pem.is_none() {
        return Err(Error::InvalidMaterial(
            "static material is empty".to_string(),
        ));
    }

    let cert_chain = match cert_chain_pem {
        Some(pem) => parse_certs(pem, "certificate chain")?,
        None => Vec::new(),
    };

    let key = match private_key_pem {
        Some(pem) => {
            let parsed = rustls_pemfile::private_key(&mut pem.as_bytes())
                .map_err(|e| Error::InvalidMaterial(format!("parsing private key: {e}")))?
                .ok_or_else(|| {
                    Error::InvalidMaterial("no private key found in PEM input".to_string())
                })?;
            Some(TlsKey::from_der(parsed)?)
        }
        None => None,
    };

    let trust_roots = match trust_roots_pem {
        Some(pem) => parse_certs(pem, "trust roots")?,
        None => Vec::new(),
    };

    Ok(TlsMaterial {
        cert_chain,
        key,
        trust_roots,
    })
}

fn parse_certs(pem: &str, what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::InvalidMaterial(format!("parsing {what}: {e}")))?;
    if certs.is_empty() {
        return Err(Error::InvalidMaterial(format!(
            "{what} contained no certificates"
        )));
    }
    Ok(certs)
}

/// Builds a `RootCertStore` from the material's trust roots.
fn roots_from_material(material: &TlsMaterial) -> Result<Arc<RootCertStore>> {
    let mut store = RootCertStore::empty();
    let added = store.add_parsable_certificates(material.trust_roots.iter().cloned());
    debug!("loaded root cert(s): {added:?}");

    if store.is_empty() {
        return Err(Error::InvalidMaterial(
            "no root certificates were accepted into RootCertStore".to_string(),
        ));
    }
    Ok(Arc::new(store))
}

/// Builds a `rustls::ClientConfig` from delivered material.
///
/// The material must carry trust roots. When it also carries a
/// certificate chain and key the client authenticates itself with them
/// (mTLS); otherwise no client certificate is presented.
///
/// ## Errors
///
/// Returns [`Error::InvalidMaterial`] if the trust roots are missing or
/// unusable, or the client certificate chain and key do not match.
pub fn client_config(material: &TlsMaterial) -> Result<ClientConfig> {
    crate::crypto::ensure_crypto_provider_installed();

    let roots = roots_from_material(material)?;
    let builder = ClientConfig::builder().with_root_certificates(roots);

    let config = match &material.key {
        Some(key) if !material.cert_chain.is_empty() => builder
            .with_client_auth_cert(material.cert_chain.clone(), key.to_der())
            .map_err(|e| Error::InvalidMaterial(format!("client certificate: {e}")))?,
        _ => builder.with_no_client_auth(),
    };
    Ok(config)
}

/// Builds a `rustls::ServerConfig` from delivered material.
///
/// The material must carry a certificate chain and private key. Client
/// certificates are not requested; verification policy is outside this
/// engine.
///
/// ## Errors
///
/// Returns [`Error::InvalidMaterial`] if chain or key are missing or do
/// not match.
pub fn server_config(material: &TlsMaterial) -> Result<ServerConfig> {
    crate::crypto::ensure_crypto_provider_installed();

    if material.cert_chain.is_empty() {
        return Err(Error::InvalidMaterial(
            "server material carries no certificate chain".to_string(),
        ));
    }
    let key = material.key.as_ref().ok_or_else(|| {
        Error::InvalidMaterial("server material carries no private key".to_string())
    })?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(material.cert_chain.clone(), key.to_der())
        .map_err(|e| Error::InvalidMaterial(format!("server certificate: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed() -> (String, String) {
        let key = rcgen::KeyPair::generate().expect("generate key");
        let mut params = rcgen::CertificateParams::default();
        params.subject_alt_names = vec![rcgen::SanType::DnsName(
            "localhost".try_into().expect("valid dns name"),
        )];
        let cert = params.self_signed(&key).expect("self-sign");
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn parses_generated_pem_material() {
        let (cert_pem, key_pem) = self_signed();
        let material = from_pem(Some(&cert_pem), Some(&key_pem), Some(&cert_pem))
            .expect("material should parse");
        assert_eq!(material.cert_chain.len(), 1);
        assert_eq!(material.trust_roots.len(), 1);
        assert!(material.key.is_some());
    }

    #[test]
    fn builds_both_config_roles_from_the_same_material() {
        let (cert_pem, key_pem) = self_signed();
        let material =
            from_pem(Some(&cert_pem), Some(&key_pem), Some(&cert_pem)).expect("material");
        server_config(&material).expect("server config");
        client_config(&material).expect("client config");
    }

    #[test]
    fn rejects_empty_material() {
        assert!(matches!(
            from_pem(None, None, None),
            Err(Error::InvalidMaterial(_))
        ));
    }

    #[test]
    fn rejects_garbage_key() {
        let err = from_pem(None, Some("garbage"), None).expect_err("should fail");
        assert!(matches!(err, Error::InvalidMaterial(_)));
    }

    #[test]
    fn server_config_requires_chain_and_key() {
        let (cert_pem, _) = self_signed();
        let material = from_pem(None, None, Some(&cert_pem)).expect("roots-only material");
        assert!(server_config(&material).is_err());
    }

    #[test]
    fn key_debug_output_is_redacted() {
        let (_, key_pem) = self_signed();
        let material = from_pem(None, Some(&key_pem), None).expect("key-only material");
        let rendered = format!("{:?}", material.key);
        assert!(rendered.contains("redacted"));
    }
}
