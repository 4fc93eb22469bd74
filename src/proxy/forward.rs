//! The outbound leg: one mutual-TLS request to the fixed upstream per call

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::http::request::Parts;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

use super::failure::{FailureKind, UpstreamFailure};
use crate::config::{DEFAULT_CONTENT_TYPE, DEFAULT_UPSTREAM_PATH, UPSTREAM_HOST, UPSTREAM_PORT};
use crate::error::{Error, Result};
use crate::identity::IdentityState;
use crate::tls;

/// Header naming the SOAP operation; passed through unchanged.
pub const SOAP_ACTION: HeaderName = HeaderName::from_static("soapaction");

/// Where outbound requests go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    /// Host name for SNI, certificate validation and the `Host` header.
    pub host: String,
    pub port: u16,
    /// Dial this host instead of `host` (tests with local upstreams).
    pub connect_host: Option<String>,
}

impl Default for UpstreamTarget {
    fn default() -> Self {
        Self {
            host: UPSTREAM_HOST.to_string(),
            port: UPSTREAM_PORT,
            connect_host: None,
        }
    }
}

impl UpstreamTarget {
    fn connect_address(&self) -> String {
        let host = self.connect_host.as_deref().unwrap_or(&self.host);
        format!("{}:{}", host, self.port)
    }

    fn host_header(&self) -> String {
        if self.port == 443 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// The outbound request derived from an admitted inbound one.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub path: String,
    pub soap_action: HeaderValue,
    pub content_type: HeaderValue,
    pub body: Bytes,
}

impl OutboundRequest {
    /// Resolve path, SOAP action and content type from the inbound request.
    pub fn resolve(parts: &Parts, body: Bytes) -> Result<Self> {
        let path = path_override(parts.uri.query())
            .map(|p| if p.starts_with('/') { p } else { format!("/{}", p) })
            .unwrap_or_else(|| DEFAULT_UPSTREAM_PATH.to_string());
        path.parse::<Uri>()
            .map_err(|e| Error::proxy(format!("Invalid upstream path '{}': {}", path, e)))?;

        let soap_action = parts
            .headers
            .get(SOAP_ACTION)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(""));
        let content_type = parts
            .headers
            .get(CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));

        Ok(Self {
            path,
            soap_action,
            content_type,
            body,
        })
    }

    fn into_http(self, target: &UpstreamTarget) -> Result<Request<Full<Bytes>>> {
        Request::builder()
            .method(Method::POST)
            .uri(self.path.as_str())
            .header(HOST, target.host_header())
            .header(CONTENT_TYPE, self.content_type)
            .header(CONTENT_LENGTH, self.body.len())
            .header(SOAP_ACTION, self.soap_action)
            .body(Full::new(self.body))
            .map_err(|e| Error::proxy(format!("Failed to build upstream request: {}", e)))
    }
}

/// The decoded value of the `path` query parameter, if present and non-empty.
pub fn path_override(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key) == "path").then(|| decode_component(value))
        })
        .next()
        .filter(|p| !p.is_empty())
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| spaced.clone())
}

/// Status, content type and body of the upstream reply.
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

/// Aborts the HTTP/1 connection task when the exchange ends or is dropped,
/// so an abandoned inbound request does not leave its upstream socket open.
struct ConnectionDriver(JoinHandle<()>);

impl Drop for ConnectionDriver {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Sends outbound requests with the client identity.
pub struct Forwarder {
    target: UpstreamTarget,
    server_name: ServerName<'static>,
    connector: std::result::Result<TlsConnector, UpstreamFailure>,
    timeout: Option<Duration>,
}

impl Forwarder {
    /// Build the forwarder, opening the client certificate bundle once.
    ///
    /// A bundle that cannot be opened is not an error here: the classified
    /// failure is kept and returned by every forward attempt.
    pub fn new(
        target: UpstreamTarget,
        identity: &IdentityState,
        roots: RootCertStore,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let server_name = ServerName::try_from(target.host.clone())
            .map_err(|e| Error::tls(format!("Invalid server name '{}': {}", target.host, e)))?;

        let connector = match identity.credential() {
            Some(credential) => tls::client_config(credential, roots)
                .map(TlsConnector::from)
                .map_err(UpstreamFailure::from),
            None => Err(UpstreamFailure::new(
                FailureKind::MissingCertificate,
                "NoCredential",
                "client certificate bundle or passphrase not configured",
            )),
        };

        match &connector {
            Ok(_) => tracing::info!(
                host = %target.host,
                port = target.port,
                "Client identity ready for upstream"
            ),
            Err(failure) if identity.credential().is_some() => tracing::error!(
                kind = ?failure.kind,
                code = %failure.code,
                "Client certificate bundle cannot be used"
            ),
            Err(_) => {}
        }

        Ok(Self {
            target,
            server_name,
            connector,
            timeout,
        })
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    /// Whether the client identity could be built, and if not, why.
    pub fn identity_status(&self) -> std::result::Result<(), &UpstreamFailure> {
        self.connector.as_ref().map(|_| ())
    }

    /// Make exactly one outbound attempt. No retries, no caching.
    pub async fn forward(
        &self,
        request: OutboundRequest,
    ) -> std::result::Result<OutboundResponse, UpstreamFailure> {
        let connector = self.connector.as_ref().map_err(Clone::clone)?;
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.exchange(connector, request))
                .await
                .map_err(|_| UpstreamFailure::timed_out(limit))?,
            None => self.exchange(connector, request).await,
        }
    }

    async fn exchange(
        &self,
        connector: &TlsConnector,
        request: OutboundRequest,
    ) -> std::result::Result<OutboundResponse, UpstreamFailure> {
        let addr = self.target.connect_address();
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| UpstreamFailure::from_io(&e))?;

        let tls_stream = connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| UpstreamFailure::from_io(&e))?;
        tracing::debug!(addr = %addr, "Upstream TLS handshake complete");

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls_stream))
            .await
            .map_err(|e| UpstreamFailure::from_http(&e))?;
        let _driver = ConnectionDriver(tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "Upstream connection error");
            }
        }));

        let req = request
            .into_http(&self.target)
            .map_err(|e| UpstreamFailure::new(FailureKind::Other, "InvalidRequest", e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| UpstreamFailure::from_http(&e))?;

        let (parts, body) = resp.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| UpstreamFailure::from_http(&e))?
            .to_bytes();

        Ok(OutboundResponse {
            status: parts.status,
            content_type: parts.headers.get(CONTENT_TYPE).cloned(),
            body,
        })
    }
}
