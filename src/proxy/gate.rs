//! Admission checks run on every inbound request before any forwarding work

use hyper::{HeaderMap, Method, Request};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::identity::{IdentityState, LoadError};

/// Path prefix of the forwarding route.
pub const FORWARD_PREFIX: &str = "/proxy";

/// Header carrying the caller's shared secret.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Where an admitted request goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Preflight,
    Health,
    Debug,
    Forward,
}

/// Why a request was turned away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Unauthorized,
    MethodNotAllowed { method: String, url: String },
    NotConfigured { details: String },
}

/// Applies, in order: pre-flight, diagnostics, API key, routing, credential.
pub struct RequestGate {
    api_key: Option<String>,
    identity: Arc<IdentityState>,
}

impl RequestGate {
    pub fn new(api_key: Option<String>, identity: Arc<IdentityState>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.is_empty()),
            identity,
        }
    }

    pub fn api_key_required(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn check<B>(&self, req: &Request<B>) -> Result<Route, Rejection> {
        let method = req.method();
        let path = req.uri().path();

        if method == Method::OPTIONS {
            return Ok(Route::Preflight);
        }

        if method == Method::GET {
            match path {
                "/health" => return Ok(Route::Health),
                "/debug" => return Ok(Route::Debug),
                _ => {}
            }
        }

        if !self.api_key_matches(req.headers()) {
            return Err(Rejection::Unauthorized);
        }

        if method != Method::POST || !path.starts_with(FORWARD_PREFIX) {
            return Err(Rejection::MethodNotAllowed {
                method: method.to_string(),
                url: req.uri().to_string(),
            });
        }

        if self.identity.credential().is_none() {
            return Err(Rejection::NotConfigured {
                details: self.missing_credential_details(),
            });
        }

        Ok(Route::Forward)
    }

    /// Exact, case-sensitive byte comparison in constant time.
    fn api_key_matches(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.api_key else {
            return true;
        };
        match headers.get(API_KEY_HEADER) {
            Some(supplied) => supplied.as_bytes().ct_eq(expected.as_bytes()).into(),
            None => false,
        }
    }

    fn missing_credential_details(&self) -> String {
        if let Some(error) = self.identity.load_error() {
            return error.to_string();
        }
        if !self.identity.has_certificate() {
            LoadError::BundleUnset.to_string()
        } else {
            LoadError::PassphraseUnset.to_string()
        }
    }
}
