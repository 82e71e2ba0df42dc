//! Double-ratchet session state and the session cipher.
//!
//! One [`SessionState`] exists per (peer, device). The cipher never
//! persists a partially-advanced state: decrypt works on a copy and the
//! store is only written after the MAC has verified and the plaintext is
//! recovered, so a bad message can never corrupt the session.

use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey;
use zeroize::Zeroize;

use crate::crypto::{aes_cbc_decrypt, aes_cbc_encrypt};
use crate::error::{Error, Result};
use crate::keys::{decode_point, encode_point, IdentityKeyPair, KeyPair};
use crate::messages::{PreKeyWhisperMessage, WhisperMessage};
use crate::ratchet::{ChainKey, MessageKeys, RootKey};
use crate::store::{Address, ProtocolStore};
use crate::x3dh::{alice_initial_keys, bob_initial_keys, AliceParams, BobParams, PreKeyBundle};

/// Total message keys cached per session for out-of-order delivery.
pub const MAX_MESSAGE_KEYS: usize = 2000;

/// Receiving chains kept alive; older chains are forgotten.
const MAX_RECEIVER_CHAINS: usize = 5;

#[derive(Clone, Serialize, Deserialize)]
struct SenderChain {
    ratchet_private: [u8; 32],
    ratchet_public: [u8; 32],
    chain: ChainKey,
}

impl SenderChain {
    fn new(key_pair: &KeyPair, chain: ChainKey) -> Self {
        SenderChain {
            ratchet_private: key_pair.private.to_bytes(),
            ratchet_public: *key_pair.public.as_bytes(),
            chain,
        }
    }

    fn key_pair(&self) -> KeyPair {
        KeyPair::from_private_bytes(self.ratchet_private)
    }
}

impl Drop for SenderChain {
    fn drop(&mut self) {
        self.ratchet_private.zeroize();
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct ReceiverChain {
    ratchet_key: [u8; 32],
    chain: ChainKey,
    cached_keys: Vec<MessageKeys>,
}

#[derive(Clone, Serialize, Deserialize)]
struct PendingPreKey {
    pre_key_id: Option<u32>,
    signed_pre_key_id: u32,
    base_key: Vec<u8>,
}

/// Ratchet state for one (peer, device) pair.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionState {
    local_identity: Vec<u8>,
    remote_identity: Vec<u8>,
    local_registration_id: u32,
    remote_registration_id: u32,
    root_key: RootKey,
    sender_chain: SenderChain,
    receiver_chains: Vec<ReceiverChain>,
    previous_counter: u32,
    pending_pre_key: Option<PendingPreKey>,
    alice_base_key: Option<Vec<u8>>,
}

impl SessionState {
    /// Build the initiator's session from a verified pre-key bundle.
    fn new_alice(
        our_identity: &IdentityKeyPair,
        local_registration_id: u32,
        bundle: &PreKeyBundle,
    ) -> Result<Self> {
        let base_key = KeyPair::generate();
        let (root_key, recv_chain) = alice_initial_keys(&AliceParams {
            our_identity,
            our_base_key: &base_key,
            their_identity: &bundle.identity_key,
            their_signed_pre_key: &bundle.signed_pre_key,
            their_one_time_pre_key: bundle.pre_key.as_ref(),
        })?;

        // The peer's first reply ratchets from their signed pre-key, so
        // that chain is registered as a receiving chain up front.
        let receiver_chains = vec![ReceiverChain {
            ratchet_key: *bundle.signed_pre_key.as_bytes(),
            chain: recv_chain,
            cached_keys: Vec::new(),
        }];

        let sending_ratchet = KeyPair::generate();
        let dh = sending_ratchet.agree(&bundle.signed_pre_key);
        let (root_key, send_chain) = root_key.create_chain(dh.as_bytes())?;

        Ok(SessionState {
            local_identity: our_identity.public_serialized(),
            remote_identity: encode_point(&bundle.identity_key),
            local_registration_id,
            remote_registration_id: bundle.registration_id,
            root_key,
            sender_chain: SenderChain::new(&sending_ratchet, send_chain),
            receiver_chains,
            previous_counter: 0,
            pending_pre_key: Some(PendingPreKey {
                pre_key_id: bundle.pre_key_id,
                signed_pre_key_id: bundle.signed_pre_key_id,
                base_key: base_key.public_serialized(),
            }),
            alice_base_key: None,
        })
    }

    /// Build the responder's session from an incoming first message.
    fn new_bob(
        our_identity: &IdentityKeyPair,
        local_registration_id: u32,
        our_signed_pre_key: &KeyPair,
        our_one_time_pre_key: Option<&KeyPair>,
        message: &PreKeyWhisperMessage,
    ) -> Result<Self> {
        let (root_key, send_chain) = bob_initial_keys(&BobParams {
            our_identity,
            our_signed_pre_key,
            our_one_time_pre_key,
            their_identity: &message.identity_key,
            their_base_key: &message.base_key,
        })?;

        Ok(SessionState {
            local_identity: our_identity.public_serialized(),
            remote_identity: encode_point(&message.identity_key),
            local_registration_id,
            remote_registration_id: message.registration_id,
            root_key,
            // Our signed pre-key doubles as the first sending ratchet;
            // the initiator ratcheted against it.
            sender_chain: SenderChain::new(our_signed_pre_key, send_chain),
            receiver_chains: Vec::new(),
            previous_counter: 0,
            pending_pre_key: None,
            alice_base_key: Some(encode_point(&message.base_key)),
        })
    }

    /// The peer's registration id, learned from the bundle or first message.
    pub fn remote_registration_id(&self) -> u32 {
        self.remote_registration_id
    }

    /// The peer's identity public point.
    pub fn remote_identity(&self) -> Result<PublicKey> {
        decode_point(&self.remote_identity)
    }

    /// Serialize for the store.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| Error::Store(e.to_string()))
    }

    /// Restore from store bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::Store(e.to_string()))
    }

    fn total_cached_keys(&self) -> usize {
        self.receiver_chains.iter().map(|c| c.cached_keys.len()).sum()
    }

    /// Drop the oldest cached keys once the session cap is exceeded.
    fn trim_cached_keys(&mut self) {
        let mut excess = self.total_cached_keys().saturating_sub(MAX_MESSAGE_KEYS);
        while excess > 0 {
            if let Some(chain) = self
                .receiver_chains
                .iter_mut()
                .rev()
                .find(|c| !c.cached_keys.is_empty())
            {
                let drop = excess.min(chain.cached_keys.len());
                chain.cached_keys.drain(..drop);
                excess -= drop;
            } else {
                break;
            }
        }
    }

    fn chain_index_of(&self, ratchet_key: &PublicKey) -> Option<usize> {
        self.receiver_chains
            .iter()
            .position(|c| c.ratchet_key == *ratchet_key.as_bytes())
    }

    /// Advance the DH ratchet for a newly seen peer ratchet key.
    fn ratchet_forward(&mut self, their_new: &PublicKey, previous_counter: u32) -> Result<()> {
        // Cache the tail of the current head chain first, so messages
        // from the old chain that are still in flight remain readable.
        if let Some(head) = self.receiver_chains.first_mut() {
            let mut chain = head.chain.clone();
            if previous_counter > chain.index()
                && (previous_counter - chain.index()) as usize <= MAX_MESSAGE_KEYS
            {
                while chain.index() < previous_counter {
                    head.cached_keys.push(chain.message_keys()?);
                    chain = chain.next()?;
                }
                head.chain = chain;
            }
        }

        let our_ratchet = self.sender_chain.key_pair();
        let dh = our_ratchet.agree(their_new);
        let (root_key, recv_chain) = self.root_key.create_chain(dh.as_bytes())?;

        let new_ratchet = KeyPair::generate();
        let dh = new_ratchet.agree(their_new);
        let (root_key, send_chain) = root_key.create_chain(dh.as_bytes())?;

        self.root_key = root_key;
        self.previous_counter = self.sender_chain.chain.index();
        self.sender_chain = SenderChain::new(&new_ratchet, send_chain);
        self.receiver_chains.insert(
            0,
            ReceiverChain {
                ratchet_key: *their_new.as_bytes(),
                chain: recv_chain,
                cached_keys: Vec::new(),
            },
        );
        self.receiver_chains.truncate(MAX_RECEIVER_CHAINS);
        self.trim_cached_keys();
        Ok(())
    }

    /// Produce the message keys for `counter` on the chain for
    /// `ratchet_key`, caching any skipped keys along the way.
    fn take_message_keys(&mut self, ratchet_key: &PublicKey, counter: u32) -> Result<MessageKeys> {
        let idx = self
            .chain_index_of(ratchet_key)
            .ok_or_else(|| Error::InvalidMessage("unknown ratchet key".into()))?;
        let chain = &mut self.receiver_chains[idx];

        if counter < chain.chain.index() {
            // Either a cached out-of-order key or a replay.
            if let Some(pos) = chain.cached_keys.iter().position(|k| k.counter == counter) {
                return Ok(chain.cached_keys.remove(pos));
            }
            return Err(Error::DuplicateMessage(counter));
        }

        let gap = (counter - chain.chain.index()) as usize;
        if gap > MAX_MESSAGE_KEYS {
            return Err(Error::MessageKeyExpired(counter));
        }

        let mut ck = chain.chain.clone();
        while ck.index() < counter {
            chain.cached_keys.push(ck.message_keys()?);
            ck = ck.next()?;
        }
        let keys = ck.message_keys()?;
        chain.chain = ck.next()?;
        self.trim_cached_keys();
        Ok(keys)
    }
}

/// A sealed outgoing message, either mid-session or session-establishing.
pub enum CiphertextMessage {
    /// Regular in-session message
    Whisper(WhisperMessage),
    /// First-contact message carrying handshake material
    PreKey(PreKeyWhisperMessage),
}

impl CiphertextMessage {
    /// Wire bytes to hand to the transport.
    pub fn serialized(&self) -> &[u8] {
        match self {
            CiphertextMessage::Whisper(m) => m.serialized(),
            CiphertextMessage::PreKey(m) => m.serialized(),
        }
    }

    /// Whether this message establishes a session.
    pub fn is_pre_key(&self) -> bool {
        matches!(self, CiphertextMessage::PreKey(_))
    }
}

/// Creates sessions from bundles; the initiator half of session setup.
pub struct SessionBuilder;

impl SessionBuilder {
    /// Verify a fetched bundle, check the identity against the trust
    /// store, and persist a fresh initiator session.
    pub fn process_bundle<S: ProtocolStore>(
        store: &mut S,
        remote: &Address,
        bundle: &PreKeyBundle,
    ) -> Result<()> {
        bundle.verify()?;

        if !store.is_trusted_identity(&remote.recipient, &bundle.identity_key)? {
            return Err(Error::UntrustedIdentity {
                id: remote.recipient.clone(),
            });
        }

        let our_identity = store.identity_key_pair()?;
        let registration_id = store.local_registration_id()?;
        let state = SessionState::new_alice(&our_identity, registration_id, bundle)?;

        store.save_identity(&remote.recipient, &bundle.identity_key)?;
        store.store_session(remote, &state)?;
        Ok(())
    }
}

/// Encrypts and decrypts over the session for one remote address.
pub struct SessionCipher<'a, S: ProtocolStore> {
    store: &'a mut S,
    remote: Address,
}

impl<'a, S: ProtocolStore> SessionCipher<'a, S> {
    /// Bind a cipher to a store and remote address.
    pub fn new(store: &'a mut S, remote: Address) -> Self {
        SessionCipher { store, remote }
    }

    /// Encrypt `plaintext`, advancing and persisting the sending chain.
    ///
    /// Until the peer's first reply arrives the output stays a
    /// [`CiphertextMessage::PreKey`] so a lost first message can always be
    /// retried.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<CiphertextMessage> {
        let mut state = self
            .store
            .load_session(&self.remote)?
            .ok_or_else(|| Error::NoSession(self.remote.to_string()))?;

        let chain = state.sender_chain.chain.clone();
        let keys = chain.message_keys()?;
        let ciphertext = aes_cbc_encrypt(&keys.cipher_key, &keys.iv, plaintext)?;

        let ratchet_public = state.sender_chain.key_pair().public;
        let message = WhisperMessage::new(
            &keys.mac_key,
            &ratchet_public,
            chain.index(),
            state.previous_counter,
            ciphertext,
            &state.local_identity,
            &state.remote_identity,
        )?;
        state.sender_chain.chain = chain.next()?;

        let out = match &state.pending_pre_key {
            Some(pending) => {
                let base_key = decode_point(&pending.base_key)?;
                let identity = decode_point(&state.local_identity)?;
                CiphertextMessage::PreKey(PreKeyWhisperMessage::new(
                    state.local_registration_id,
                    pending.pre_key_id,
                    pending.signed_pre_key_id,
                    &base_key,
                    &identity,
                    message,
                )?)
            }
            None => CiphertextMessage::Whisper(message),
        };

        self.store.store_session(&self.remote, &state)?;
        Ok(out)
    }

    /// Decrypt a mid-session message.
    pub fn decrypt_whisper(&mut self, bytes: &[u8]) -> Result<Vec<u8>> {
        let message = WhisperMessage::deserialize(bytes)?;
        let state = self
            .store
            .load_session(&self.remote)?
            .ok_or_else(|| Error::NoSession(self.remote.to_string()))?;

        let (plaintext, new_state) = Self::decrypt_with_state(state, &message)?;
        self.store.store_session(&self.remote, &new_state)?;
        Ok(plaintext)
    }

    /// Decrypt a session-establishing message, creating the session when
    /// needed and consuming the referenced one-time pre-key.
    pub fn decrypt_pre_key_whisper(&mut self, bytes: &[u8]) -> Result<Vec<u8>> {
        let message = PreKeyWhisperMessage::deserialize(bytes)?;

        if !self
            .store
            .is_trusted_identity(&self.remote.recipient, &message.identity_key)?
        {
            return Err(Error::UntrustedIdentity {
                id: self.remote.recipient.clone(),
            });
        }

        // A retransmitted first message reuses the base key; decrypt it
        // with the session it already created instead of rebuilding.
        let base_key = encode_point(&message.base_key);
        let (state, reuse) = match self.store.load_session(&self.remote)? {
            Some(s) if s.alice_base_key.as_deref() == Some(base_key.as_slice()) => (s, true),
            _ => {
                let signed_pre_key = self
                    .store
                    .load_signed_pre_key(message.signed_pre_key_id)?
                    .ok_or_else(|| {
                        Error::InvalidMessage(format!(
                            "unknown signed pre-key {}",
                            message.signed_pre_key_id
                        ))
                    })?;
                let one_time = match message.pre_key_id {
                    Some(id) => Some(
                        self.store
                            .load_pre_key(id)?
                            .ok_or(Error::NoSuchPreKey(id))?,
                    ),
                    None => None,
                };
                let our_identity = self.store.identity_key_pair()?;
                let registration_id = self.store.local_registration_id()?;
                let state = SessionState::new_bob(
                    &our_identity,
                    registration_id,
                    &signed_pre_key.key_pair,
                    one_time.as_ref().map(|r| &r.key_pair),
                    &message,
                )?;
                (state, false)
            }
        };

        let (plaintext, new_state) = Self::decrypt_with_state(state, &message.message)?;

        self.store
            .save_identity(&self.remote.recipient, &message.identity_key)?;
        self.store.store_session(&self.remote, &new_state)?;

        // A consumed one-time pre-key is gone for good; id 0 marks the
        // absent-key convention and is never removed.
        if let Some(id) = message.pre_key_id {
            if id != 0 && !reuse {
                self.store.remove_pre_key(id)?;
            }
        }

        Ok(plaintext)
    }

    /// Run the receive ratchet on a scratch copy; the caller persists the
    /// returned state only because this succeeded.
    fn decrypt_with_state(
        mut state: SessionState,
        message: &WhisperMessage,
    ) -> Result<(Vec<u8>, SessionState)> {
        if state.chain_index_of(&message.ratchet_key).is_none() {
            state.ratchet_forward(&message.ratchet_key, message.previous_counter)?;
        }
        let keys = state.take_message_keys(&message.ratchet_key, message.counter)?;

        message.verify_mac(&keys.mac_key, &state.remote_identity, &state.local_identity)?;
        let plaintext = aes_cbc_decrypt(&keys.cipher_key, &keys.iv, &message.ciphertext)?;

        // A decrypted reply proves the handshake landed.
        state.pending_pre_key = None;
        Ok((plaintext, state))
    }
}
