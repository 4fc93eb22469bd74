//! Test infrastructure for end-to-end relay tests.
#![allow(dead_code)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use mtls_relay::{Config, RelayServer};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// Passphrase of `tests/fixtures/client.p12`.
pub const FIXTURE_PASSPHRASE: &str = "relay-test";

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn fixture(name: &str) -> Vec<u8> {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    std::fs::read(&path).unwrap_or_else(|e| panic!("read {}: {}", path.display(), e))
}

/// The fixture client bundle, base64-encoded as it would be in `CERT_BASE64`.
pub fn bundle_base64() -> String {
    STANDARD.encode(fixture("client.p12"))
}

/// A trust store holding only the fixture CA.
pub fn fixture_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    mtls_relay::tls::add_pem_anchors(&mut roots, &fixture("ca.pem")).unwrap();
    roots
}

fn certs(name: &str) -> Vec<CertificateDer<'static>> {
    rustls_pemfile::certs(&mut &fixture(name)[..])
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

fn key(name: &str) -> PrivateKeyDer<'static> {
    rustls_pemfile::private_key(&mut &fixture(name)[..])
        .unwrap()
        .unwrap()
}

/// A port on 127.0.0.1 with nothing listening.
pub async fn refused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ---------------------------------------------------------------------------
// TestUpstream: a tiny mutual-TLS HTTPS server
// ---------------------------------------------------------------------------

pub type UpstreamResponse = std::pin::Pin<
    Box<dyn std::future::Future<Output = Result<Response<Full<Bytes>>, hyper::Error>> + Send>,
>;

/// A handler function for the test upstream.
pub type UpstreamHandler = Arc<dyn Fn(Request<Incoming>) -> UpstreamResponse + Send + Sync>;

/// Which certificate the upstream presents and which clients it accepts.
#[derive(Clone, Copy)]
pub enum UpstreamIdentity {
    /// `localhost` certificate from the fixture CA; requires a fixture-CA client.
    Trusted,
    /// `localhost` certificate from an issuer the relay does not trust.
    Rogue,
    /// Trusted server certificate, but only accepts clients from another issuer.
    RejectsClient,
}

pub struct TestUpstream {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestUpstream {
    pub async fn start(handler: UpstreamHandler) -> Self {
        Self::start_with(UpstreamIdentity::Trusted, handler).await
    }

    pub async fn start_with(identity: UpstreamIdentity, handler: UpstreamHandler) -> Self {
        mtls_relay::tls::install_crypto_provider();

        let (cert, key_file, client_ca) = match identity {
            UpstreamIdentity::Trusted => ("server.pem", "server.key", "ca.pem"),
            UpstreamIdentity::Rogue => ("rogue-server.pem", "rogue-server.key", "ca.pem"),
            UpstreamIdentity::RejectsClient => ("server.pem", "server.key", "rogue-server.pem"),
        };

        let mut client_roots = RootCertStore::empty();
        for c in certs(client_ca) {
            client_roots.add(c).unwrap();
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(client_roots))
            .build()
            .unwrap();

        let mut config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs(cert), key(key_file))
            .unwrap();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    result = listener.accept() => {
                        let (stream, _) = match result {
                            Ok(conn) => conn,
                            Err(_) => continue,
                        };

                        let acceptor = acceptor.clone();
                        let handler = handler.clone();
                        let counter = counter.clone();

                        tokio::spawn(async move {
                            let tls_stream = match acceptor.accept(stream).await {
                                Ok(s) => s,
                                Err(_) => return,
                            };
                            let io = TokioIo::new(tls_stream);

                            let service = service_fn(move |req: Request<Incoming>| {
                                counter.fetch_add(1, Ordering::SeqCst);
                                handler(req)
                            });

                            let _ = http1::Builder::new().serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            hits,
            shutdown_tx,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Requests that reached the handler.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn full(body: impl Into<Bytes>) -> Full<Bytes> {
    Full::new(body.into())
}

/// Responds with a fixed status, content type and body.
pub fn fixed_handler(
    status: StatusCode,
    content_type: Option<&'static str>,
    body: &'static [u8],
) -> UpstreamHandler {
    Arc::new(move |_req| {
        Box::pin(async move {
            let mut builder = Response::builder().status(status);
            if let Some(ct) = content_type {
                builder = builder.header("Content-Type", ct);
            }
            Ok(builder.body(full(Bytes::from_static(body))).unwrap())
        })
    })
}

/// Describes the request it received as JSON: method, path, headers, base64 body.
pub fn echo_handler() -> UpstreamHandler {
    Arc::new(|req: Request<Incoming>| {
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => return Err(e),
            };
            let header = |name: &str| {
                parts
                    .headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            let description = serde_json::json!({
                "method": parts.method.as_str(),
                "path": parts.uri.path(),
                "host": header("host"),
                "contentType": header("content-type"),
                "contentLength": header("content-length"),
                "soapAction": header("soapaction"),
                "body": STANDARD.encode(&body),
            });
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "application/json")
                .body(full(description.to_string()))
                .unwrap())
        })
    })
}

/// Never answers within any reasonable test deadline.
pub fn hanging_handler() -> UpstreamHandler {
    Arc::new(|_req| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(300)).await;
            Ok(Response::new(full("too late")))
        })
    })
}

// ---------------------------------------------------------------------------
// TestRelay: wraps RelayServer with bind + spawn
// ---------------------------------------------------------------------------

/// Relay config on an ephemeral port with the fixture identity loaded.
pub fn relay_config(api_key: Option<&str>) -> Config {
    let mut config = Config::minimal("127.0.0.1", 0);
    config.cert_base64 = Some(bundle_base64());
    config.cert_password = Some(FIXTURE_PASSPHRASE.to_string());
    config.api_key = api_key.map(str::to_string);
    config
}

pub struct TestRelay {
    pub addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestRelay {
    /// Start a relay that forwards to `localhost:<upstream_port>` and trusts the fixture CA.
    pub async fn start(config: Config, upstream_port: u16) -> Self {
        let mut server = RelayServer::new(config)
            .unwrap()
            .with_upstream_server_name("localhost")
            .with_upstream_host_override("127.0.0.1")
            .with_upstream_port_override(upstream_port)
            .with_upstream_roots(fixture_roots());

        let addr = server.bind().await.unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let _ = server.serve(shutdown_rx).await;
        });

        Self { addr, shutdown_tx }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap()
}
