//! Storage traits the session cipher runs against.
//!
//! The client supplies a persistent implementation; tests use
//! [`InMemoryStore`]. Implementations must consume one-time pre-keys
//! atomically so a key is never handed out twice.

use std::collections::HashMap;

use x25519_dalek::PublicKey;

use crate::error::Result;
use crate::keys::{IdentityKeyPair, PreKeyRecord, SignedPreKeyRecord};
use crate::session::SessionState;

/// A remote (recipient, device) pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    /// Peer id (phone number without the leading `+` on the wire)
    pub recipient: String,
    /// Device within the peer's account
    pub device_id: u32,
}

impl Address {
    /// Convenience constructor.
    pub fn new(recipient: impl Into<String>, device_id: u32) -> Self {
        Address {
            recipient: recipient.into(),
            device_id,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.recipient, self.device_id)
    }
}

/// Local identity and the trust-on-first-use table of peer identities.
pub trait IdentityStore {
    /// The device's identity key pair.
    fn identity_key_pair(&self) -> Result<IdentityKeyPair>;

    /// The device's 14-bit registration id.
    fn local_registration_id(&self) -> Result<u32>;

    /// Whether `identity` matches the recorded key for `recipient`.
    /// A peer with no recorded key is trusted (first use).
    fn is_trusted_identity(&self, recipient: &str, identity: &PublicKey) -> Result<bool>;

    /// Record `identity` as the trusted key for `recipient`.
    fn save_identity(&mut self, recipient: &str, identity: &PublicKey) -> Result<()>;

    /// The recorded key for `recipient`, if any.
    fn remote_identity(&self, recipient: &str) -> Result<Option<PublicKey>>;
}

/// One-time pre-key storage.
pub trait PreKeyStore {
    /// Load a pre-key by id.
    fn load_pre_key(&self, id: u32) -> Result<Option<PreKeyRecord>>;

    /// Persist a pre-key.
    fn store_pre_key(&mut self, record: &PreKeyRecord) -> Result<()>;

    /// Remove a consumed pre-key. Id 0 is reserved for "no pre-key" and
    /// must be left alone.
    fn remove_pre_key(&mut self, id: u32) -> Result<()>;

    /// Ids currently available, for replenishment decisions.
    fn pre_key_ids(&self) -> Result<Vec<u32>>;
}

/// Signed pre-key storage.
pub trait SignedPreKeyStore {
    /// Load a signed pre-key by id.
    fn load_signed_pre_key(&self, id: u32) -> Result<Option<SignedPreKeyRecord>>;

    /// Persist a signed pre-key.
    fn store_signed_pre_key(&mut self, record: &SignedPreKeyRecord) -> Result<()>;
}

/// Session-record storage.
pub trait SessionStore {
    /// Load the session for an address.
    fn load_session(&self, address: &Address) -> Result<Option<SessionState>>;

    /// Persist the session for an address.
    fn store_session(&mut self, address: &Address, state: &SessionState) -> Result<()>;

    /// Whether a session exists for an address.
    fn contains_session(&self, address: &Address) -> Result<bool>;

    /// Remove the session for an address.
    fn delete_session(&mut self, address: &Address) -> Result<()>;
}

/// Everything the session cipher needs, in one bound.
pub trait ProtocolStore:
    IdentityStore + PreKeyStore + SignedPreKeyStore + SessionStore
{
}

impl<T: IdentityStore + PreKeyStore + SignedPreKeyStore + SessionStore> ProtocolStore for T {}

/// Volatile store for tests and short-lived tooling.
pub struct InMemoryStore {
    identity: IdentityKeyPair,
    registration_id: u32,
    trusted: HashMap<String, [u8; 32]>,
    pre_keys: HashMap<u32, Vec<u8>>,
    signed_pre_keys: HashMap<u32, Vec<u8>>,
    sessions: HashMap<Address, Vec<u8>>,
}

impl InMemoryStore {
    /// Create a store around a fresh or existing identity.
    pub fn new(identity: IdentityKeyPair, registration_id: u32) -> Self {
        InMemoryStore {
            identity,
            registration_id,
            trusted: HashMap::new(),
            pre_keys: HashMap::new(),
            signed_pre_keys: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    /// Forget a recorded peer identity (the operator's override path).
    pub fn forget_identity(&mut self, recipient: &str) {
        self.trusted.remove(recipient);
    }
}

impl IdentityStore for InMemoryStore {
    fn identity_key_pair(&self) -> Result<IdentityKeyPair> {
        Ok(self.identity.clone())
    }

    fn local_registration_id(&self) -> Result<u32> {
        Ok(self.registration_id)
    }

    fn is_trusted_identity(&self, recipient: &str, identity: &PublicKey) -> Result<bool> {
        Ok(match self.trusted.get(recipient) {
            Some(known) => crate::crypto::constant_time_eq(known, identity.as_bytes()),
            None => true,
        })
    }

    fn save_identity(&mut self, recipient: &str, identity: &PublicKey) -> Result<()> {
        self.trusted
            .insert(recipient.to_string(), *identity.as_bytes());
        Ok(())
    }

    fn remote_identity(&self, recipient: &str) -> Result<Option<PublicKey>> {
        Ok(self.trusted.get(recipient).map(|b| PublicKey::from(*b)))
    }
}

impl PreKeyStore for InMemoryStore {
    fn load_pre_key(&self, id: u32) -> Result<Option<PreKeyRecord>> {
        self.pre_keys
            .get(&id)
            .map(|b| PreKeyRecord::from_bytes(b))
            .transpose()
    }

    fn store_pre_key(&mut self, record: &PreKeyRecord) -> Result<()> {
        self.pre_keys.insert(record.id, record.to_bytes()?);
        Ok(())
    }

    fn remove_pre_key(&mut self, id: u32) -> Result<()> {
        if id == 0 {
            return Ok(());
        }
        self.pre_keys.remove(&id);
        Ok(())
    }

    fn pre_key_ids(&self) -> Result<Vec<u32>> {
        let mut ids: Vec<u32> = self.pre_keys.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

impl SignedPreKeyStore for InMemoryStore {
    fn load_signed_pre_key(&self, id: u32) -> Result<Option<SignedPreKeyRecord>> {
        self.signed_pre_keys
            .get(&id)
            .map(|b| SignedPreKeyRecord::from_bytes(b))
            .transpose()
    }

    fn store_signed_pre_key(&mut self, record: &SignedPreKeyRecord) -> Result<()> {
        self.signed_pre_keys.insert(record.id, record.to_bytes()?);
        Ok(())
    }
}

impl SessionStore for InMemoryStore {
    fn load_session(&self, address: &Address) -> Result<Option<SessionState>> {
        self.sessions
            .get(address)
            .map(|b| SessionState::from_bytes(b))
            .transpose()
    }

    fn store_session(&mut self, address: &Address, state: &SessionState) -> Result<()> {
        self.sessions.insert(address.clone(), state.to_bytes()?);
        Ok(())
    }

    fn contains_session(&self, address: &Address) -> Result<bool> {
        Ok(self.sessions.contains_key(address))
    }

    fn delete_session(&mut self, address: &Address) -> Result<()> {
        self.sessions.remove(address);
        Ok(())
    }
}
