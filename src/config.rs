//! Configuration read once from the environment at startup

use clap::Parser;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Hostname of the upstream gateway. Also used as the TLS server name.
pub const UPSTREAM_HOST: &str = "services.extranet.skat.dk";

/// Port of the upstream gateway.
pub const UPSTREAM_PORT: u16 = 443;

/// Outbound path used when the caller does not supply `?path=`.
pub const DEFAULT_UPSTREAM_PATH: &str = "/B2B/EIndkomst/EIndkomstServiceFunctionBinding";

/// Content type sent upstream (and relayed back) when none is given.
pub const DEFAULT_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

/// Relay configuration.
///
/// Every field can be given as a flag or through the environment variable
/// named in its `env` attribute. Empty values count as unset.
#[derive(Parser, Clone, Default)]
#[command(name = "mtls-relay")]
#[command(about = "Forwards plain HTTP requests to a fixed upstream over mutual TLS")]
#[command(version)]
pub struct Config {
    /// Base64-encoded PKCS#12 client certificate bundle
    #[arg(long, env = "CERT_BASE64", hide_env_values = true)]
    pub cert_base64: Option<String>,

    /// Passphrase protecting the PKCS#12 bundle
    #[arg(long, env = "CERT_PASSWORD", hide_env_values = true)]
    pub cert_password: Option<String>,

    /// Shared secret callers must send in the X-API-Key header
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Interface to listen on
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// PEM file with extra trust anchors for the upstream server certificate
    #[arg(long, env = "UPSTREAM_CA_FILE")]
    pub upstream_ca_file: Option<PathBuf>,

    /// Deadline in seconds for the whole outbound exchange
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS")]
    pub upstream_timeout_secs: Option<u64>,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Read configuration from process arguments and environment.
    pub fn from_env() -> Self {
        Self::parse().normalized()
    }

    /// Empty strings from the environment mean "not configured".
    pub fn normalized(mut self) -> Self {
        self.cert_base64 = non_empty(self.cert_base64.take());
        self.cert_password = non_empty(self.cert_password.take());
        self.api_key = non_empty(self.api_key.take());
        self.upstream_timeout_secs = self.upstream_timeout_secs.filter(|secs| *secs > 0);
        self
    }

    /// Minimal configuration for a listener on the given address.
    pub fn minimal(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            log_level: "info".to_string(),
            ..Self::default()
        }
    }

    /// The socket address to bind.
    pub fn bind_address(&self) -> Result<SocketAddr> {
        let address = if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        };
        address
            .parse()
            .map_err(|e| Error::config(format!("Invalid bind address '{}': {}", address, e)))
    }

    /// Whether inbound callers must present the API key.
    pub fn api_key_required(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    pub fn upstream_timeout(&self) -> Option<Duration> {
        self.upstream_timeout_secs.map(Duration::from_secs)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn redact(value: &Option<String>) -> &'static str {
    if value.is_some() {
        "<redacted>"
    } else {
        "<unset>"
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("cert_base64", &redact(&self.cert_base64))
            .field("cert_password", &redact(&self.cert_password))
            .field("api_key", &redact(&self.api_key))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("upstream_ca_file", &self.upstream_ca_file)
            .field("upstream_timeout_secs", &self.upstream_timeout_secs)
            .field("log_level", &self.log_level)
            .finish()
    }
}
