//! Health and debug snapshots served on `/health` and `/debug`.

use serde::Serialize;
use std::sync::Arc;

use crate::identity::IdentityState;

/// Overall state reported by `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

/// Payload of `GET /health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: String,
    pub has_certificate: bool,
    pub has_password: bool,
    pub cert_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of `GET /debug`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugReport {
    pub has_certificate: bool,
    pub cert_size: usize,
    pub has_password: bool,
    pub api_key_required: bool,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub runtime: String,
    pub client_identity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Builds diagnostics reports from state fixed at startup.
pub struct Diagnostics {
    identity: Arc<IdentityState>,
    api_key_required: bool,
    upstream_host: String,
    upstream_port: u16,
    client_identity: String,
}

impl Diagnostics {
    pub fn new(
        identity: Arc<IdentityState>,
        api_key_required: bool,
        upstream_host: impl Into<String>,
        upstream_port: u16,
        client_identity: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            api_key_required,
            upstream_host: upstream_host.into(),
            upstream_port,
            client_identity: client_identity.into(),
        }
    }

    fn error(&self) -> Option<String> {
        self.identity.load_error().map(|e| e.to_string())
    }

    pub fn health(&self) -> HealthReport {
        let error = self.error();
        HealthReport {
            status: if error.is_some() {
                HealthStatus::Degraded
            } else {
                HealthStatus::Ok
            },
            timestamp: now_iso8601(),
            has_certificate: self.identity.has_certificate(),
            has_password: self.identity.has_passphrase(),
            cert_size: self.identity.certificate_size(),
            error,
        }
    }

    pub fn debug(&self) -> DebugReport {
        DebugReport {
            has_certificate: self.identity.has_certificate(),
            cert_size: self.identity.certificate_size(),
            has_password: self.identity.has_passphrase(),
            api_key_required: self.api_key_required,
            upstream_host: self.upstream_host.clone(),
            upstream_port: self.upstream_port,
            runtime: runtime_version(),
            client_identity: self.client_identity.clone(),
            error: self.error(),
        }
    }
}

pub fn runtime_version() -> String {
    format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Current UTC time as RFC 3339.
pub fn now_iso8601() -> String {
    let now = time::OffsetDateTime::now_utc();
    now.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
