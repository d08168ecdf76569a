//! Startup error surface
//!
//! Everything that can go wrong before the gateway is serving traffic:
//! reading and parsing the config file, validating the provider fleet it
//! describes, and binding the listener. Request-path errors never use these
//! types — they render as the client-facing error envelope instead.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading configuration and bringing the gateway up.
#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file is not valid TOML: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("provider '{provider_id}' is misconfigured: {reason}")]
    Provider { provider_id: String, reason: String },

    #[error("credential '{credential_id}' of provider '{provider_id}' is misconfigured: {reason}")]
    Credential {
        provider_id: String,
        credential_id: String,
        reason: String,
    },

    #[error("failed to bind listener on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Result alias for startup operations.
pub type Result<T> = std::result::Result<T, Error>;
