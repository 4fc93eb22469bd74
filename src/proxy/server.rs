//! Main relay server

use futures_util::FutureExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::RootCertStore;
use std::any::Any;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

use super::forward::{Forwarder, UpstreamTarget};
use super::gate::RequestGate;
use super::handler::RelayHandler;
use super::response::{internal_error_response, RelayBody};
use crate::config::Config;
use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::identity::IdentityState;
use crate::tls;

/// The relay server
pub struct RelayServer {
    config: Config,
    identity: Arc<IdentityState>,
    upstream: UpstreamTarget,
    upstream_roots: RootCertStore,
    listener: Option<TcpListener>,
}

impl RelayServer {
    /// Create a relay server from configuration.
    ///
    /// The client identity is read here. A missing or malformed identity is
    /// not an error; an unreadable `UPSTREAM_CA_FILE` is.
    pub fn new(config: Config) -> Result<Self> {
        let identity = Arc::new(IdentityState::from_config(&config));
        let upstream_roots = tls::upstream_roots(config.upstream_ca_file.as_deref())?;

        tracing::info!(
            api_key = config.api_key_required(),
            timeout_secs = config.upstream_timeout_secs,
            "Relay configured"
        );

        Ok(Self {
            config,
            identity,
            upstream: UpstreamTarget::default(),
            upstream_roots,
            listener: None,
        })
    }

    /// Override the upstream host for TCP connections (for testing with local upstreams).
    /// The server name is still used for TLS SNI and the `Host` header.
    pub fn with_upstream_host_override(mut self, host: impl Into<String>) -> Self {
        self.upstream.connect_host = Some(host.into());
        self
    }

    /// Override the upstream port (for testing).
    pub fn with_upstream_port_override(mut self, port: u16) -> Self {
        self.upstream.port = port;
        self
    }

    /// Override the name the upstream certificate is checked against.
    pub fn with_upstream_server_name(mut self, name: impl Into<String>) -> Self {
        self.upstream.host = name.into();
        self
    }

    /// Replace the upstream trust store (for testing with private CAs).
    pub fn with_upstream_roots(mut self, roots: RootCertStore) -> Self {
        self.upstream_roots = roots;
        self
    }

    /// Run the relay with graceful shutdown
    pub async fn run_until_shutdown(
        mut self,
        shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        let local_addr = self.bind().await?;
        tracing::info!(address = %local_addr, "Relay listening");
        self.serve(shutdown).await
    }

    /// Bind to the configured address and return the actual local address.
    ///
    /// Useful when binding to port 0. Call `serve()` afterwards.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let addr = self.config.bind_address()?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::proxy(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener.local_addr()?;

        self.listener = Some(listener);
        Ok(local_addr)
    }

    /// Serve connections on the bound listener until `shutdown` fires.
    pub async fn serve(mut self, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| Error::proxy("bind() must be called before serve()"))?;

        let handler = self.make_handler()?;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    return Ok(());
                }
                result = listener.accept() => {
                    let (stream, client_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    tracing::debug!(client = %client_addr, "New connection");
                    spawn_connection(stream, client_addr, handler.clone());
                }
            }
        }
    }

    fn make_handler(&self) -> Result<RelayHandler> {
        let forwarder = Forwarder::new(
            self.upstream.clone(),
            &self.identity,
            self.upstream_roots.clone(),
            self.config.upstream_timeout(),
        )?;

        let client_identity = match (forwarder.identity_status(), self.identity.load_error()) {
            (Ok(()), _) => "ready".to_string(),
            (Err(_), Some(load_error)) => load_error.to_string(),
            (Err(failure), None) => failure.message(),
        };

        let gate = RequestGate::new(self.config.api_key.clone(), self.identity.clone());
        let diagnostics = Diagnostics::new(
            self.identity.clone(),
            gate.api_key_required(),
            self.upstream.host.clone(),
            self.upstream.port,
            client_identity,
        );

        Ok(RelayHandler::new(
            Arc::new(gate),
            Arc::new(forwarder),
            Arc::new(diagnostics),
        ))
    }

    pub fn identity(&self) -> &Arc<IdentityState> {
        &self.identity
    }
}

/// Spawn a task to handle a single connection.
fn spawn_connection(stream: TcpStream, client_addr: SocketAddr, handler: RelayHandler) {
    tokio::spawn(async move {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req| supervised(handler.clone(), req));

        if let Err(e) = http1::Builder::new()
            .serve_connection(io, service)
            .await
        {
            if !e.to_string().contains("connection closed") {
                tracing::debug!(client = %client_addr, error = %e, "Connection error");
            }
        }
    });
}

/// Run one request; a panic while handling it becomes a 500.
async fn supervised(
    handler: RelayHandler,
    req: Request<Incoming>,
) -> std::result::Result<Response<RelayBody>, Infallible> {
    match AssertUnwindSafe(handler.handle(req)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let details = panic_message(panic.as_ref());
            tracing::error!(details = %details, "Request handler panicked");
            Ok(internal_error_response(&details))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "request handler panicked".to_string()
    }
}
