//! Inbound HTTP surface and the outbound mutual-TLS leg

mod failure;
mod forward;
mod gate;
mod handler;
mod response;
mod server;

pub use failure::{FailureKind, UpstreamFailure};
pub use forward::{path_override, Forwarder, OutboundRequest, OutboundResponse, UpstreamTarget};
pub use gate::{Rejection, RequestGate, Route, API_KEY_HEADER, FORWARD_PREFIX};
pub use handler::RelayHandler;
pub use response::RelayBody;
pub use server::RelayServer;
