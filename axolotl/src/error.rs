//! Error types for the session protocol

use thiserror::Error;

/// Errors produced by key handling, the session cipher and the stores.
///
/// Everything except [`Error::UntrustedIdentity`] is recoverable at the
/// caller level: drop the offending message and continue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A key did not have the expected length or encoding
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Signature verification over a signed pre-key failed
    #[error("invalid signature")]
    InvalidSignature,

    /// A wire message carried an unsupported version byte
    #[error("unsupported message version {0}")]
    InvalidVersion(u8),

    /// A wire message could not be decoded
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The truncated MAC on a message did not verify
    #[error("invalid message MAC")]
    InvalidMac,

    /// A message key was already consumed for this counter
    #[error("duplicate message (counter {0})")]
    DuplicateMessage(u32),

    /// The counter gap exceeded the skipped-key window; the key is gone
    #[error("message key expired (counter {0})")]
    MessageKeyExpired(u32),

    /// No session record exists for the remote address
    #[error("no session for {0}")]
    NoSession(String),

    /// The remote presented an identity key that differs from the one on
    /// record; requires operator intervention to clear
    #[error("untrusted identity for {id}")]
    UntrustedIdentity {
        /// Peer whose recorded identity no longer matches
        id: String,
    },

    /// The referenced one-time pre-key is not in the store
    #[error("no such pre-key {0}")]
    NoSuchPreKey(u32),

    /// A symmetric primitive rejected its input
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// The backing store failed
    #[error("store failure: {0}")]
    Store(String),
}

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;
