//! Client error types

use thiserror::Error;

/// Errors surfaced by the client library.
#[derive(Error, Debug)]
pub enum Error {
    /// The configuration file is missing or invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// The persistent store failed; fatal at startup
    #[error("store error: {0}")]
    Store(String),

    /// A protocol-level failure from the session layer
    #[error(transparent)]
    Protocol(#[from] axolotl::Error),

    /// The push envelope MAC did not verify
    #[error("invalid envelope MAC")]
    EnvelopeMac,

    /// The push envelope was malformed
    #[error("invalid envelope: {0}")]
    Envelope(String),

    /// Socket-level failure
    #[error("network error: {0}")]
    Network(String),

    /// The server answered outside the 2xx range
    #[error("server status {0}")]
    ServerStatus(u16),

    /// No certificate in the peer chain matched the configured pin; fatal
    #[error("TLS key pin mismatch")]
    PinMismatch,

    /// The websocket was closed
    #[error("connection closed")]
    Closed,

    /// A JSON or MessagePack body could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(String),

    /// The named group is not known locally
    #[error("unknown group {0}")]
    UnknownGroup(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Network(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, Error>;
