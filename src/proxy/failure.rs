//! Classification of failures on the upstream leg
//!
//! Every failure becomes an [`UpstreamFailure`]: one [`FailureKind`] that maps
//! to an operator-facing message, plus the raw code of the underlying error.

use rustls::AlertDescription;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::time::Duration;

use crate::tls::IdentityError;

/// Recognised categories of upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No bundle or passphrase is configured.
    MissingCertificate,
    /// The passphrase does not open the PKCS#12 bundle.
    BadPassphrase,
    /// The bundle is not a usable PKCS#12 container.
    CorruptCertificate,
    /// The upstream server certificate failed trust-store validation.
    UntrustedUpstream,
    /// The upstream refused our client certificate during the handshake.
    ClientCertificateRejected,
    ConnectionRefused,
    TimedOut,
    /// Anything else; the raw code carries the detail.
    Other,
}

impl FailureKind {
    pub fn message(self) -> &'static str {
        match self {
            FailureKind::MissingCertificate => {
                "Client certificate is not configured. Set CERT_BASE64 and CERT_PASSWORD."
            }
            FailureKind::BadPassphrase => {
                "Certificate password is incorrect. Verify that CERT_PASSWORD matches the certificate bundle."
            }
            FailureKind::CorruptCertificate => {
                "Certificate data is corrupted or invalid. Re-export the PKCS#12 bundle and update CERT_BASE64."
            }
            FailureKind::UntrustedUpstream => {
                "Upstream server certificate could not be validated against the trust store."
            }
            FailureKind::ClientCertificateRejected => {
                "Upstream gateway rejected the client certificate. Check that it is registered and not expired."
            }
            FailureKind::ConnectionRefused => {
                "Connection refused by the upstream gateway. The service may be down or blocking this host."
            }
            FailureKind::TimedOut => {
                "Connection to the upstream gateway timed out. Check network connectivity and firewall rules."
            }
            FailureKind::Other => "Network error while contacting the upstream gateway",
        }
    }
}

/// A classified failure of one outbound attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamFailure {
    pub kind: FailureKind,
    /// Raw identifier of the underlying error, e.g. `ConnectionRefused`.
    pub code: String,
    /// Underlying error text, kept for logs and for `Other`.
    pub detail: String,
}

impl UpstreamFailure {
    pub fn new(kind: FailureKind, code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            detail: detail.into(),
        }
    }

    /// Human-actionable text returned to the caller as `details`.
    pub fn message(&self) -> String {
        match self.kind {
            FailureKind::Other => format!("{}: {}", self.kind.message(), self.detail),
            kind => kind.message().to_string(),
        }
    }

    pub fn timed_out(after: Duration) -> Self {
        Self::new(
            FailureKind::TimedOut,
            format!("{:?}", io::ErrorKind::TimedOut),
            format!("no response within {}s", after.as_secs_f64()),
        )
    }

    /// Classify a transport error from connect, handshake or I/O.
    pub fn from_io(err: &io::Error) -> Self {
        if let Some(tls) = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            return Self::from_tls(tls);
        }

        let kind = match err.kind() {
            io::ErrorKind::ConnectionRefused => FailureKind::ConnectionRefused,
            io::ErrorKind::TimedOut => FailureKind::TimedOut,
            _ => FailureKind::Other,
        };
        Self::new(kind, format!("{:?}", err.kind()), err.to_string())
    }

    /// Classify a rustls handshake or record-layer error.
    pub fn from_tls(err: &rustls::Error) -> Self {
        let kind = match err {
            rustls::Error::InvalidCertificate(_) => FailureKind::UntrustedUpstream,
            rustls::Error::AlertReceived(alert) if is_client_certificate_alert(*alert) => {
                FailureKind::ClientCertificateRejected
            }
            _ => FailureKind::Other,
        };
        Self::new(kind, format!("{:?}", err), err.to_string())
    }

    /// Classify a hyper client error by the transport error underneath it.
    pub fn from_http(err: &hyper::Error) -> Self {
        if let Some(failure) = err.source().and_then(classify_chain) {
            return failure;
        }
        if err.is_timeout() {
            return Self::new(FailureKind::TimedOut, "TimedOut", err.to_string());
        }
        Self::new(FailureKind::Other, "HttpProtocol", err.to_string())
    }
}

impl From<IdentityError> for UpstreamFailure {
    fn from(err: IdentityError) -> Self {
        let kind = match err {
            IdentityError::BadPassphrase { .. } => FailureKind::BadPassphrase,
            IdentityError::Invalid { .. } => FailureKind::CorruptCertificate,
        };
        Self::new(kind, err.code(), err.to_string())
    }
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({}): {}", self.kind, self.code, self.detail)
    }
}

/// Alerts a server sends when it does not accept the client certificate.
fn is_client_certificate_alert(alert: AlertDescription) -> bool {
    matches!(
        alert,
        AlertDescription::BadCertificate
            | AlertDescription::UnsupportedCertificate
            | AlertDescription::CertificateRevoked
            | AlertDescription::CertificateExpired
            | AlertDescription::CertificateUnknown
            | AlertDescription::UnknownCA
            | AlertDescription::AccessDenied
            | AlertDescription::CertificateRequired
    )
}

/// Walk an error chain for the first transport or TLS error.
///
/// `io::Error::source` skips the wrapped error itself, so io errors are
/// unpacked through `from_io` instead of followed.
fn classify_chain(err: &(dyn StdError + 'static)) -> Option<UpstreamFailure> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(tls) = e.downcast_ref::<rustls::Error>() {
            return Some(UpstreamFailure::from_tls(tls));
        }
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(UpstreamFailure::from_io(io_err));
        }
        current = e.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_report;
    use rustls::CertificateError;

    #[test]
    fn test_connection_refused() {
        let t = test_report!("Connection refused maps to its own message and code");
        let err = io::Error::from(io::ErrorKind::ConnectionRefused);
        let failure = UpstreamFailure::from_io(&err);
        t.assert_eq("kind", &failure.kind, &FailureKind::ConnectionRefused);
        t.assert_eq("code", &failure.code.as_str(), &"ConnectionRefused");
        t.assert_contains("message", &failure.message(), "Connection refused");
    }

    #[test]
    fn test_timeouts() {
        let t = test_report!("Socket and deadline timeouts both map to TimedOut");
        let err = io::Error::from(io::ErrorKind::TimedOut);
        let failure = UpstreamFailure::from_io(&err);
        t.assert_eq("io kind", &failure.kind, &FailureKind::TimedOut);
        t.assert_eq("io code", &failure.code.as_str(), &"TimedOut");

        let failure = UpstreamFailure::timed_out(Duration::from_secs(5));
        t.assert_eq("deadline kind", &failure.kind, &FailureKind::TimedOut);
        t.assert_eq("deadline code", &failure.code.as_str(), &"TimedOut");
        t.assert_contains("message", &failure.message(), "timed out");
    }

    #[test]
    fn test_untrusted_upstream_certificate() {
        let t = test_report!("Server certificate validation failure maps to UntrustedUpstream");
        let tls = rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer);
        let err = io::Error::new(io::ErrorKind::InvalidData, tls);
        let failure = UpstreamFailure::from_io(&err);
        t.assert_eq("kind", &failure.kind, &FailureKind::UntrustedUpstream);
        t.assert_eq(
            "code",
            &failure.code.as_str(),
            &"InvalidCertificate(UnknownIssuer)",
        );
    }

    #[test]
    fn test_client_certificate_rejected() {
        let t = test_report!("Certificate alerts from the server map to ClientCertificateRejected");
        let tls = rustls::Error::AlertReceived(AlertDescription::BadCertificate);
        let failure = UpstreamFailure::from_tls(&tls);
        t.assert_eq("kind", &failure.kind, &FailureKind::ClientCertificateRejected);

        let tls = rustls::Error::AlertReceived(AlertDescription::HandshakeFailure);
        let failure = UpstreamFailure::from_tls(&tls);
        t.assert_eq("other alert", &failure.kind, &FailureKind::Other);
    }

    #[test]
    fn test_unrecognised_errors_keep_detail() {
        let t = test_report!("Unrecognised errors fall into Other with their detail");
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "peer went away");
        let failure = UpstreamFailure::from_io(&err);
        t.assert_eq("kind", &failure.kind, &FailureKind::Other);
        t.assert_eq("code", &failure.code.as_str(), &"ConnectionReset");
        t.assert_contains("message keeps detail", &failure.message(), "peer went away");
    }

    #[test]
    fn test_identity_errors() {
        let t = test_report!("Bundle errors map to passphrase and corruption categories");
        let failure = UpstreamFailure::from(IdentityError::BadPassphrase {
            code: "MacError(MacError)".to_string(),
        });
        t.assert_eq("passphrase", &failure.kind, &FailureKind::BadPassphrase);
        t.assert_eq("code", &failure.code.as_str(), &"MacError(MacError)");
        t.assert_contains("message", &failure.message(), "CERT_PASSWORD");

        let failure = UpstreamFailure::from(IdentityError::Invalid {
            code: "NoPrivateKey".to_string(),
            reason: "bundle holds no private key".to_string(),
        });
        t.assert_eq("corrupt", &failure.kind, &FailureKind::CorruptCertificate);
        t.assert_contains("message", &failure.message(), "CERT_BASE64");
    }

    #[test]
    fn test_classify_chain_finds_wrapped_tls_error() {
        let t = test_report!("Error chains are searched for the TLS error");
        let tls = rustls::Error::AlertReceived(AlertDescription::CertificateRequired);
        let err = io::Error::new(io::ErrorKind::InvalidData, tls);
        let failure = classify_chain(&err).unwrap();
        t.assert_eq("kind", &failure.kind, &FailureKind::ClientCertificateRejected);
    }
}
