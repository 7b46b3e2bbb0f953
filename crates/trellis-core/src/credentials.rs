//! Transport-security strategy for listening endpoints.
//!
//! [`ServerCredentials`] is an immutable value chosen per bound endpoint.
//! The lifecycle controller only asks it whether it is secure and, if so,
//! for a rustls [`ServerConfig`] to wrap accepted sockets with. Dispatch
//! logic never looks at credentials.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, ServerConfig};

/// A PEM private key and the PEM certificate chain it signs for.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyCertPair {
    pub private_key: Bytes,
    pub cert_chain: Bytes,
}

impl KeyCertPair {
    pub fn new(private_key: impl Into<Bytes>, cert_chain: impl Into<Bytes>) -> Self {
        KeyCertPair {
            private_key: private_key.into(),
            cert_chain: cert_chain.into(),
        }
    }
}

impl fmt::Debug for KeyCertPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCertPair")
            .field("private_key", &"<redacted>")
            .field("cert_chain_len", &self.cert_chain.len())
            .finish()
    }
}

/// Snapshot of the TLS settings of secure credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    root_certs: Option<Bytes>,
    key_cert_pairs: Vec<KeyCertPair>,
    require_client_cert: bool,
}

impl TlsSettings {
    /// PEM bundle used to verify client certificates.
    pub fn root_certs(&self) -> Option<&Bytes> {
        self.root_certs.as_ref()
    }

    pub fn key_cert_pairs(&self) -> &[KeyCertPair] {
        &self.key_cert_pairs
    }

    pub fn require_client_cert(&self) -> bool {
        self.require_client_cert
    }
}

/// Credentials for a listening endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCredentials {
    /// Plaintext listener.
    Insecure,
    /// TLS listener.
    Ssl(TlsSettings),
}

impl ServerCredentials {
    pub fn insecure() -> Self {
        ServerCredentials::Insecure
    }

    /// Build TLS credentials.
    ///
    /// Certificates and keys are only parsed when a listener is built from
    /// them (see [`ServerCredentials::tls_config`]); this constructor checks
    /// structure only.
    pub fn ssl(
        root_certs: Option<Bytes>,
        key_cert_pairs: Vec<KeyCertPair>,
        require_client_cert: bool,
    ) -> Result<Self, CredentialsError> {
        if key_cert_pairs.is_empty() {
            return Err(CredentialsError::NoKeyCertPairs);
        }
        for (index, pair) in key_cert_pairs.iter().enumerate() {
            if pair.private_key.is_empty() || pair.cert_chain.is_empty() {
                return Err(CredentialsError::EmptyKeyCertPair { index });
            }
        }
        if require_client_cert && root_certs.is_none() {
            return Err(CredentialsError::ClientCertWithoutRoots);
        }
        Ok(ServerCredentials::Ssl(TlsSettings {
            root_certs,
            key_cert_pairs,
            require_client_cert,
        }))
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, ServerCredentials::Ssl(_))
    }

    /// TLS settings, or `None` for insecure credentials.
    pub fn settings(&self) -> Option<&TlsSettings> {
        match self {
            ServerCredentials::Insecure => None,
            ServerCredentials::Ssl(settings) => Some(settings),
        }
    }

    /// Build the rustls configuration for a secure listener.
    ///
    /// Returns `Ok(None)` for insecure credentials.
    pub fn tls_config(&self) -> Result<Option<Arc<ServerConfig>>, CredentialsError> {
        match self {
            ServerCredentials::Insecure => Ok(None),
            ServerCredentials::Ssl(settings) => build_server_config(settings).map(Some),
        }
    }
}

/// Error building credentials or the TLS configuration derived from them.
#[derive(Debug)]
pub enum CredentialsError {
    /// Secure credentials need at least one key/certificate pair.
    NoKeyCertPairs,
    /// The pair at `index` has an empty key or certificate chain.
    EmptyKeyCertPair { index: usize },
    /// Client certificates were required but no root certificates given.
    ClientCertWithoutRoots,
    /// A PEM input could not be parsed.
    InvalidPem { what: String, reason: String },
    /// rustls rejected the key or configuration.
    Tls(rustls::Error),
    /// The client certificate verifier could not be built.
    Verifier(String),
}

impl fmt::Display for CredentialsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoKeyCertPairs => write!(f, "at least one key/certificate pair is required"),
            Self::EmptyKeyCertPair { index } => {
                write!(f, "key/certificate pair {} has an empty key or certificate chain", index)
            }
            Self::ClientCertWithoutRoots => {
                write!(f, "requiring client certificates needs root certificates")
            }
            Self::InvalidPem { what, reason } => write!(f, "invalid {}: {}", what, reason),
            Self::Tls(e) => write!(f, "TLS error: {}", e),
            Self::Verifier(e) => write!(f, "client certificate verifier: {}", e),
        }
    }
}

impl std::error::Error for CredentialsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tls(e) => Some(e),
            _ => None,
        }
    }
}

fn parse_certs(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>, CredentialsError> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CredentialsError::InvalidPem {
            what: what.to_string(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(CredentialsError::InvalidPem {
            what: what.to_string(),
            reason: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}

fn root_store(pem: &[u8]) -> Result<RootCertStore, CredentialsError> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(pem, "root certificates")? {
        roots.add(cert).map_err(CredentialsError::Tls)?;
    }
    Ok(roots)
}

fn build_server_config(settings: &TlsSettings) -> Result<Arc<ServerConfig>, CredentialsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut keys = Vec::with_capacity(settings.key_cert_pairs.len());
    for (index, pair) in settings.key_cert_pairs.iter().enumerate() {
        let chain = parse_certs(&pair.cert_chain, &format!("certificate chain {}", index))?;
        let key = PrivateKeyDer::from_pem_slice(&pair.private_key).map_err(|e| {
            CredentialsError::InvalidPem {
                what: format!("private key {}", index),
                reason: e.to_string(),
            }
        })?;
        let signing_key = provider
            .key_provider
            .load_private_key(key)
            .map_err(CredentialsError::Tls)?;
        keys.push(Arc::new(CertifiedKey::new(chain, signing_key)));
    }

    let roots = match &settings.root_certs {
        Some(pem) => Some(root_store(pem)?),
        None => None,
    };

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(CredentialsError::Tls)?;

    let builder = match roots {
        Some(roots) if settings.require_client_cert => {
            let verifier = client_verifier(roots, provider)?;
            builder.with_client_cert_verifier(verifier)
        }
        _ => builder.with_no_client_auth(),
    };

    let config = builder.with_cert_resolver(Arc::new(KeyCertResolver { keys }));
    Ok(Arc::new(config))
}

fn client_verifier(
    roots: RootCertStore,
    provider: Arc<CryptoProvider>,
) -> Result<Arc<dyn rustls::server::danger::ClientCertVerifier>, CredentialsError> {
    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
        .build()
        .map_err(|e| CredentialsError::Verifier(e.to_string()))
}

/// Serves the first pair whose key can sign with a scheme the client
/// offered, else the first pair.
#[derive(Debug)]
struct KeyCertResolver {
    keys: Vec<Arc<CertifiedKey>>,
}

impl ResolvesServerCert for KeyCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let schemes = client_hello.signature_schemes();
        self.keys
            .iter()
            .find(|k| k.key.choose_scheme(schemes).is_some())
            .or_else(|| self.keys.first())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed() -> KeyCertPair {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        KeyCertPair::new(cert.key_pair.serialize_pem(), cert.cert.pem())
    }

    #[test]
    fn insecure_has_no_settings() {
        let creds = ServerCredentials::insecure();
        assert!(!creds.is_secure());
        assert!(creds.settings().is_none());
        assert!(creds.tls_config().unwrap().is_none());
    }

    #[test]
    fn ssl_exposes_settings_snapshot() {
        let pair = self_signed();
        let roots = pair.cert_chain.clone();
        let creds = ServerCredentials::ssl(Some(roots.clone()), vec![pair.clone()], true).unwrap();

        assert!(creds.is_secure());
        let settings = creds.settings().unwrap();
        assert_eq!(settings.root_certs(), Some(&roots));
        assert_eq!(settings.key_cert_pairs(), &[pair]);
        assert!(settings.require_client_cert());
    }

    #[test]
    fn ssl_structural_validation() {
        assert!(matches!(
            ServerCredentials::ssl(None, vec![], false),
            Err(CredentialsError::NoKeyCertPairs)
        ));
        assert!(matches!(
            ServerCredentials::ssl(None, vec![self_signed(), KeyCertPair::new("", "x")], false),
            Err(CredentialsError::EmptyKeyCertPair { index: 1 })
        ));
        assert!(matches!(
            ServerCredentials::ssl(None, vec![self_signed()], true),
            Err(CredentialsError::ClientCertWithoutRoots)
        ));
    }

    #[test]
    fn builds_tls_config() {
        let creds = ServerCredentials::ssl(None, vec![self_signed(), self_signed()], false).unwrap();
        assert!(creds.tls_config().unwrap().is_some());
    }

    #[test]
    fn builds_tls_config_with_client_auth() {
        let pair = self_signed();
        let roots = pair.cert_chain.clone();
        let creds = ServerCredentials::ssl(Some(roots), vec![pair], true).unwrap();
        assert!(creds.tls_config().unwrap().is_some());
    }

    #[test]
    fn invalid_pem_fails_at_build_time() {
        let creds =
            ServerCredentials::ssl(None, vec![KeyCertPair::new("not a key", "not a cert")], false)
                .unwrap();
        let err = creds.tls_config().unwrap_err();
        assert!(matches!(err, CredentialsError::InvalidPem { .. }), "{err}");
    }

    #[test]
    fn debug_redacts_private_key() {
        let pair = KeyCertPair::new("secret-key-material", "cert");
        assert!(!format!("{pair:?}").contains("secret"));
    }
}
