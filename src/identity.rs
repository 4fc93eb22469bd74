//! Client identity loading
//!
//! The PKCS#12 bundle and its passphrase arrive base64-encoded through the
//! environment. Loading never fails the process: whatever went wrong is kept
//! as a [`LoadError`] so the diagnostics routes can explain it.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use std::fmt;

use crate::config::Config;

/// Standard alphabet, padding optional. Bundles pasted into a dashboard often
/// lose their trailing `=`.
const BUNDLE_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Why the client identity is not usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// `CERT_BASE64` is not set.
    BundleUnset,
    /// `CERT_BASE64` is set but is not valid base64.
    BundleMalformed(String),
    /// `CERT_PASSWORD` is not set.
    PassphraseUnset,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::BundleUnset => write!(f, "CERT_BASE64 environment variable not set"),
            LoadError::BundleMalformed(reason) => {
                write!(f, "Failed to decode CERT_BASE64: {}", reason)
            }
            LoadError::PassphraseUnset => write!(f, "CERT_PASSWORD environment variable not set"),
        }
    }
}

/// A usable client identity: the raw PKCS#12 bytes and their passphrase.
#[derive(Clone, Copy)]
pub struct Credential<'a> {
    pub bundle: &'a [u8],
    pub passphrase: &'a str,
}

impl fmt::Debug for Credential<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("bundle_len", &self.bundle.len())
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

/// Result of reading the identity configuration at startup. Immutable once
/// built and shared read-only between all requests.
#[derive(Clone, Default)]
pub struct IdentityState {
    bundle: Option<Vec<u8>>,
    passphrase: Option<String>,
    load_error: Option<LoadError>,
}

impl IdentityState {
    /// Decode the bundle and record the first problem found.
    ///
    /// A bundle problem takes precedence over a missing passphrase.
    pub fn load(bundle_base64: Option<&str>, passphrase: Option<&str>) -> Self {
        let mut state = Self::default();

        match bundle_base64.filter(|v| !v.is_empty()) {
            None => state.load_error = Some(LoadError::BundleUnset),
            Some(encoded) => match decode_bundle(encoded) {
                Ok(bytes) => state.bundle = Some(bytes),
                Err(reason) => state.load_error = Some(LoadError::BundleMalformed(reason)),
            },
        }

        match passphrase.filter(|v| !v.is_empty()) {
            Some(p) => state.passphrase = Some(p.to_string()),
            None => {
                if state.load_error.is_none() {
                    state.load_error = Some(LoadError::PassphraseUnset);
                }
            }
        }

        match &state.load_error {
            Some(error) => tracing::warn!(error = %error, "Client certificate not loaded"),
            None => tracing::info!(
                bytes = state.certificate_size(),
                "Client certificate loaded"
            ),
        }

        state
    }

    pub fn from_config(config: &Config) -> Self {
        Self::load(config.cert_base64.as_deref(), config.cert_password.as_deref())
    }

    /// The credential, when both the bundle and the passphrase are present.
    pub fn credential(&self) -> Option<Credential<'_>> {
        match (&self.bundle, &self.passphrase) {
            (Some(bundle), Some(passphrase)) => Some(Credential {
                bundle,
                passphrase,
            }),
            _ => None,
        }
    }

    pub fn has_certificate(&self) -> bool {
        self.bundle.is_some()
    }

    /// Decoded bundle length in bytes, 0 when absent.
    pub fn certificate_size(&self) -> usize {
        self.bundle.as_ref().map_or(0, Vec::len)
    }

    pub fn has_passphrase(&self) -> bool {
        self.passphrase.is_some()
    }

    pub fn load_error(&self) -> Option<&LoadError> {
        self.load_error.as_ref()
    }
}

impl fmt::Debug for IdentityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityState")
            .field("certificate_size", &self.certificate_size())
            .field("has_passphrase", &self.has_passphrase())
            .field("load_error", &self.load_error)
            .finish()
    }
}

fn decode_bundle(encoded: &str) -> std::result::Result<Vec<u8>, String> {
    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = BUNDLE_ENGINE
        .decode(compact.as_bytes())
        .map_err(|e| e.to_string())?;
    if bytes.is_empty() {
        return Err("decoded bundle is empty".to_string());
    }
    Ok(bytes)
}
