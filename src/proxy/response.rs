//! Response builders: JSON errors, diagnostics, relayed upstream responses

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use serde_json::json;

use super::failure::UpstreamFailure;
use super::forward::OutboundResponse;
use super::gate::Rejection;
use crate::config::DEFAULT_CONTENT_TYPE;

/// Body type of every response the relay produces. Bodies are fully buffered.
pub type RelayBody = Full<Bytes>;

const CORS_HEADERS: [(&str, &str); 3] = [
    ("access-control-allow-origin", "*"),
    ("access-control-allow-methods", "POST, GET, OPTIONS"),
    (
        "access-control-allow-headers",
        "Content-Type, Authorization, X-API-Key, SOAPAction",
    ),
];

fn with_cors(status: StatusCode, body: Bytes) -> Response<RelayBody> {
    let mut resp = Response::new(Full::new(body));
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    for (name, value) in CORS_HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    resp
}

/// A JSON response with CORS headers.
pub fn json_response<T: Serialize>(status: StatusCode, payload: &T) -> Response<RelayBody> {
    let body = match serde_json::to_vec(payload) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize response body");
            return internal_error_response("Failed to serialize response");
        }
    };
    let mut resp = with_cors(status, Bytes::from(body));
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

/// 200 with an empty body for CORS pre-flight requests.
pub fn preflight_response() -> Response<RelayBody> {
    with_cors(StatusCode::OK, Bytes::new())
}

/// Response for a request the gate turned away.
pub fn rejection_response(rejection: &Rejection) -> Response<RelayBody> {
    match rejection {
        Rejection::Unauthorized => json_response(
            StatusCode::UNAUTHORIZED,
            &json!({ "error": "Unauthorized: invalid or missing API key" }),
        ),
        Rejection::MethodNotAllowed { method, url } => json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            &json!({ "error": "Method not allowed", "method": method, "url": url }),
        ),
        Rejection::NotConfigured { details } => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &json!({ "error": "Certificate not configured", "details": details }),
        ),
    }
}

/// 502 carrying the classified message and the raw error code.
pub fn upstream_failure_response(failure: &UpstreamFailure) -> Response<RelayBody> {
    json_response(
        StatusCode::BAD_GATEWAY,
        &json!({
            "error": "Proxy request failed",
            "details": failure.message(),
            "code": failure.code,
        }),
    )
}

/// 500 for anything unexpected while handling a request.
pub fn internal_error_response(details: &str) -> Response<RelayBody> {
    let body = json!({ "error": "Internal server error", "details": details }).to_string();
    let mut resp = with_cors(StatusCode::INTERNAL_SERVER_ERROR, Bytes::from(body));
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

/// Relay the upstream status and body byte for byte.
pub fn relay_response(upstream: OutboundResponse) -> Response<RelayBody> {
    let mut resp = with_cors(upstream.status, upstream.body);
    let content_type = upstream
        .content_type
        .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    resp.headers_mut().insert(CONTENT_TYPE, content_type);
    resp
}
