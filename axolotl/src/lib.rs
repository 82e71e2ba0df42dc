//! Axolotl session protocol.
//!
//! Implements the double-ratchet session cipher used by the TextSecure
//! client: X3DH pre-key handshake, per-message symmetric ratchet, DH
//! ratchet on every direction change, and the `WhisperMessage` /
//! `PreKeyWhisperMessage` wire forms. Storage is abstracted behind the
//! traits in [`store`] so the client can keep sessions on disk while
//! tests run fully in memory.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod crypto;
pub mod error;
pub mod keys;
pub mod messages;
pub mod ratchet;
pub mod session;
pub mod store;
pub mod x3dh;

pub use error::{Error, Result};
pub use keys::{IdentityKeyPair, KeyPair, PreKeyRecord, SignedPreKeyRecord};
pub use messages::{PreKeyWhisperMessage, WhisperMessage, CIPHERTEXT_VERSION};
pub use session::{CiphertextMessage, SessionBuilder, SessionCipher, SessionState, MAX_MESSAGE_KEYS};
pub use store::{Address, InMemoryStore, ProtocolStore};
pub use x3dh::PreKeyBundle;
