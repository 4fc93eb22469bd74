//! mtls-relay - Forwards plain HTTP requests to a fixed upstream over mutual TLS
//!
//! Callers without their own client certificate POST SOAP envelopes to
//! `/proxy`; the relay re-sends each one to the upstream gateway presenting
//! a PKCS#12 client identity and relays the response back verbatim.
//!
//! # Example
//!
//! ```no_run
//! use mtls_relay::{Config, RelayServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     mtls_relay::tls::install_crypto_provider();
//!     let server = RelayServer::new(Config::from_env())?;
//!     let (_tx, rx) = tokio::sync::oneshot::channel();
//!     server.run_until_shutdown(rx).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod identity;
pub mod proxy;
pub mod tls;

#[cfg(any(test, feature = "test-support"))]
#[doc(hidden)]
pub mod test_support;

pub use config::Config;
pub use diagnostics::{DebugReport, Diagnostics, HealthReport, HealthStatus};
pub use error::{Error, Result};
pub use identity::{Credential, IdentityState, LoadError};
pub use proxy::{FailureKind, RelayServer, UpstreamFailure};
