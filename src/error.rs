//! Error types for the dnsgate gateway.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Main error type for dnsgate operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("DNS protocol error: {0}")]
    Protocol(#[from] hickory_proto::ProtoError),

    #[error("malformed DNS query")]
    MalformedQuery,

    #[error("upstream {upstream} did not answer in time")]
    UpstreamTimeout { upstream: SocketAddr },

    #[error("all upstream resolvers failed")]
    UpstreamsExhausted,

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("authorization denied")]
    AuthorizationDenied,

    #[error("stop completed with errors: {0}")]
    StopIncomplete(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("metrics error: {0}")]
    Metrics(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("validation failed: {0}")]
    Validation(String),
}

/// Network-related errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("no active network interface")]
    NoActiveInterface,

    #[error("could not bind any listen address")]
    NoListener,

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("DNS configuration is not supported on this platform")]
    Unsupported,
}

/// Errors while persisting state files.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {path:?} is corrupt")]
    Corrupt { path: PathBuf },

    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;
