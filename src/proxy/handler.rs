//! HTTP request handler for the relay

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;

use super::forward::{Forwarder, OutboundRequest};
use super::gate::{Rejection, RequestGate, Route};
use super::response::{
    internal_error_response, json_response, preflight_response, rejection_response,
    relay_response, upstream_failure_response, RelayBody,
};
use crate::diagnostics::Diagnostics;

/// Dispatches inbound requests: gate first, then diagnostics or forwarding.
///
/// Cheap to clone; every connection gets its own copy.
#[derive(Clone)]
pub struct RelayHandler {
    gate: Arc<RequestGate>,
    forwarder: Arc<Forwarder>,
    diagnostics: Arc<Diagnostics>,
}

impl RelayHandler {
    pub fn new(
        gate: Arc<RequestGate>,
        forwarder: Arc<Forwarder>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            gate,
            forwarder,
            diagnostics,
        }
    }

    /// Handle one inbound request. Every outcome is a response.
    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<RelayBody>, Infallible>
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        let route = match self.gate.check(&req) {
            Ok(route) => route,
            Err(rejection) => {
                log_rejection(&req, &rejection);
                return Ok(rejection_response(&rejection));
            }
        };

        let resp = match route {
            Route::Preflight => preflight_response(),
            Route::Health => json_response(StatusCode::OK, &self.diagnostics.health()),
            Route::Debug => json_response(StatusCode::OK, &self.diagnostics.debug()),
            Route::Forward => self.forward(req).await,
        };
        Ok(resp)
    }

    async fn forward<B>(&self, req: Request<B>) -> Response<RelayBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        let started = Instant::now();
        let method = req.method().clone();
        let (parts, body) = req.into_parts();

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read request body");
                return internal_error_response(&format!("Failed to read request body: {}", e));
            }
        };

        let outbound = match OutboundRequest::resolve(&parts, body) {
            Ok(outbound) => outbound,
            Err(e) => {
                tracing::warn!(error = %e, "Rejected outbound request");
                return internal_error_response(&e.to_string());
            }
        };
        let path = outbound.path.clone();
        let bytes = outbound.body.len();

        match self.forwarder.forward(outbound).await {
            Ok(upstream) => {
                tracing::info!(
                    method = %method,
                    path = %path,
                    bytes,
                    status = upstream.status.as_u16(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Forwarded"
                );
                relay_response(upstream)
            }
            Err(failure) => {
                tracing::error!(
                    method = %method,
                    path = %path,
                    kind = ?failure.kind,
                    code = %failure.code,
                    detail = %failure.detail,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Upstream request failed"
                );
                upstream_failure_response(&failure)
            }
        }
    }
}

fn log_rejection<B>(req: &Request<B>, rejection: &Rejection) {
    match rejection {
        Rejection::Unauthorized => {
            tracing::warn!(method = %req.method(), path = %req.uri().path(), "Invalid or missing API key")
        }
        Rejection::MethodNotAllowed { .. } => {
            tracing::debug!(method = %req.method(), url = %req.uri(), "No route")
        }
        Rejection::NotConfigured { details } => {
            tracing::error!(details = %details, "Forwarding refused: certificate not configured")
        }
    }
}
