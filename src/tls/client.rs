//! Client-side TLS for the upstream leg: the PKCS#12 identity and the trust
//! store the upstream server certificate is checked against.

use p12_keystore::KeyStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore};
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::identity::Credential;

/// Install the aws-lc-rs provider as the process default. Idempotent.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Why a PKCS#12 bundle could not become a rustls client identity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("passphrase does not open the certificate bundle ({code})")]
    BadPassphrase { code: String },

    #[error("certificate bundle is invalid: {reason}")]
    Invalid { code: String, reason: String },
}

impl IdentityError {
    /// Raw identifier of the underlying failure.
    pub fn code(&self) -> &str {
        match self {
            IdentityError::BadPassphrase { code } | IdentityError::Invalid { code, .. } => code,
        }
    }

    fn invalid(code: impl Into<String>, reason: impl Into<String>) -> Self {
        IdentityError::Invalid {
            code: code.into(),
            reason: reason.into(),
        }
    }
}

/// The bundle's MAC is keyed by the passphrase, so a MAC mismatch means the
/// passphrase is wrong. Anything else is a damaged or unsupported container.
fn classify_pkcs12_error(error: p12_keystore::error::Error) -> IdentityError {
    let code = format!("{:?}", error);
    match error {
        p12_keystore::error::Error::MacError(_) => IdentityError::BadPassphrase { code },
        other => IdentityError::invalid(code, other.to_string()),
    }
}

/// Open the bundle and build a client config that presents it.
///
/// Only TLS 1.3 and 1.2 are offered, the server is verified against `roots`,
/// and ALPN is pinned to HTTP/1.1.
pub fn client_config(
    credential: Credential<'_>,
    roots: RootCertStore,
) -> std::result::Result<Arc<ClientConfig>, IdentityError> {
    install_crypto_provider();

    let keystore = KeyStore::from_pkcs12(credential.bundle, credential.passphrase)
        .map_err(classify_pkcs12_error)?;

    let (alias, entry) = keystore
        .private_key_chain()
        .ok_or_else(|| IdentityError::invalid("NoPrivateKey", "bundle holds no private key"))?;

    let chain: Vec<CertificateDer<'static>> = entry
        .chain()
        .iter()
        .map(|cert| CertificateDer::from(cert.as_der().to_vec()))
        .collect();
    if chain.is_empty() {
        return Err(IdentityError::invalid(
            "NoCertificate",
            "bundle holds no certificate for its private key",
        ));
    }
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(entry.key().to_vec()));

    tracing::debug!(alias = %alias, chain = chain.len(), "Opened client certificate bundle");

    let mut config = ClientConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS13,
        &rustls::version::TLS12,
    ])
    .with_root_certificates(roots)
    .with_client_auth_cert(chain, key)
    .map_err(|e| IdentityError::invalid(format!("{:?}", e), e.to_string()))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Public web PKI roots, plus the anchors in `extra_ca` when given.
pub fn upstream_roots(extra_ca: Option<&Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = extra_ca {
        let pem = std::fs::read(path).map_err(|e| {
            Error::certificate(format!(
                "Failed to read upstream CA file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let added = add_pem_anchors(&mut roots, &pem)?;
        tracing::info!(path = %path.display(), anchors = added, "Loaded extra upstream trust anchors");
    }

    Ok(roots)
}

/// Add every certificate in a PEM document as a trust anchor.
pub fn add_pem_anchors(roots: &mut RootCertStore, pem: &[u8]) -> Result<usize> {
    let mut added = 0;
    for cert in rustls_pemfile::certs(&mut &pem[..]) {
        let cert = cert.map_err(|e| Error::certificate(format!("Invalid PEM: {}", e)))?;
        roots
            .add(cert)
            .map_err(|e| Error::certificate(format!("Unusable trust anchor: {}", e)))?;
        added += 1;
    }
    if added == 0 {
        return Err(Error::certificate("No certificates found in PEM"));
    }
    Ok(added)
}
