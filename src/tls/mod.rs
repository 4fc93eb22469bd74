//! TLS for the upstream leg

mod client;

pub use client::{
    add_pem_anchors, client_config, install_crypto_provider, upstream_roots, IdentityError,
};
