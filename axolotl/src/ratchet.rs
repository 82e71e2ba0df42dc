//! Key derivation for the double ratchet.
//!
//! The symmetric chain advances by `HMAC(ck, 0x02)`; each message key seed
//! is `HMAC(ck, 0x01)` expanded to 80 bytes of cipher key, MAC key and IV.
//! The root key ratchets forward by an HKDF step keyed on each new DH
//! agreement.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{hkdf_sha256, hmac_sha256};
use crate::error::Result;

const ROOT_INFO: &[u8] = b"WhisperRatchet";
const MESSAGE_KEYS_INFO: &[u8] = b"WhisperMessageKeys";
const MESSAGE_KEY_SEED: [u8; 1] = [0x01];
const CHAIN_KEY_SEED: [u8; 1] = [0x02];

/// The slow-ratcheting top-level key, advanced once per DH ratchet step.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RootKey {
    key: [u8; 32],
}

impl RootKey {
    /// Wrap raw root key bytes.
    pub fn new(key: [u8; 32]) -> Self {
        RootKey { key }
    }

    /// Derive the next root key and a fresh chain key from a DH output.
    pub fn create_chain(&self, dh_output: &[u8]) -> Result<(RootKey, ChainKey)> {
        let mut okm = [0u8; 64];
        hkdf_sha256(Some(&self.key), dh_output, ROOT_INFO, &mut okm)?;
        let mut root = [0u8; 32];
        let mut chain = [0u8; 32];
        root.copy_from_slice(&okm[..32]);
        chain.copy_from_slice(&okm[32..]);
        okm.zeroize();
        Ok((RootKey::new(root), ChainKey::new(chain, 0)))
    }
}

/// A sending or receiving chain key with its message counter.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ChainKey {
    key: [u8; 32],
    index: u32,
}

impl ChainKey {
    /// Wrap raw chain key bytes at the given counter.
    pub fn new(key: [u8; 32], index: u32) -> Self {
        ChainKey { key, index }
    }

    /// Counter of the next message key this chain will produce.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The advanced chain key, counter incremented.
    pub fn next(&self) -> Result<ChainKey> {
        let key = hmac_sha256(&self.key, &CHAIN_KEY_SEED)?;
        Ok(ChainKey::new(key, self.index + 1))
    }

    /// The message keys for the current counter.
    pub fn message_keys(&self) -> Result<MessageKeys> {
        let mut seed = hmac_sha256(&self.key, &MESSAGE_KEY_SEED)?;
        let mut okm = [0u8; 80];
        hkdf_sha256(None, &seed, MESSAGE_KEYS_INFO, &mut okm)?;
        seed.zeroize();

        let mut cipher_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        let mut iv = [0u8; 16];
        cipher_key.copy_from_slice(&okm[..32]);
        mac_key.copy_from_slice(&okm[32..64]);
        iv.copy_from_slice(&okm[64..]);
        okm.zeroize();

        Ok(MessageKeys {
            cipher_key,
            mac_key,
            iv,
            counter: self.index,
        })
    }
}

/// Per-message key material, used at most once on the receive side.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct MessageKeys {
    /// AES-256-CBC key
    pub cipher_key: [u8; 32],
    /// HMAC-SHA256 key for the truncated message MAC
    pub mac_key: [u8; 32],
    /// CBC IV
    pub iv: [u8; 16],
    /// Chain counter this key was derived at
    #[zeroize(skip)]
    pub counter: u32,
}

/// Derive the initial (root, chain) pair from an X3DH master secret.
pub fn derive_initial_keys(master_secret: &[u8]) -> Result<(RootKey, ChainKey)> {
    let mut okm = [0u8; 64];
    hkdf_sha256(None, master_secret, b"WhisperText", &mut okm)?;
    let mut root = [0u8; 32];
    let mut chain = [0u8; 32];
    root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((RootKey::new(root), ChainKey::new(chain, 0)))
}

impl RootKey {
    /// Raw bytes, for session snapshots.
    pub fn bytes(&self) -> [u8; 32] {
        self.key
    }
}

impl ChainKey {
    /// Raw bytes, for session snapshots.
    pub fn bytes(&self) -> [u8; 32] {
        self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_advances_deterministically() {
        let ck = ChainKey::new([0x42u8; 32], 0);
        let a = ck.next().unwrap();
        let b = ck.next().unwrap();
        assert_eq!(a.bytes(), b.bytes());
        assert_eq!(a.index(), 1);
        assert_ne!(a.bytes(), ck.bytes());
    }

    #[test]
    fn message_keys_differ_per_step() {
        let ck = ChainKey::new([0x42u8; 32], 0);
        let mk0 = ck.message_keys().unwrap();
        let mk1 = ck.next().unwrap().message_keys().unwrap();
        assert_eq!(mk0.counter, 0);
        assert_eq!(mk1.counter, 1);
        assert_ne!(mk0.cipher_key, mk1.cipher_key);
        assert_ne!(mk0.mac_key, mk1.mac_key);
        assert_ne!(mk0.iv, mk1.iv);
    }

    #[test]
    fn root_step_produces_distinct_chains() {
        let rk = RootKey::new([7u8; 32]);
        let (rk1, ck1) = rk.create_chain(&[1u8; 32]).unwrap();
        let (rk2, ck2) = rk.create_chain(&[2u8; 32]).unwrap();
        assert_ne!(rk1.bytes(), rk2.bytes());
        assert_ne!(ck1.bytes(), ck2.bytes());
    }

    #[test]
    fn initial_keys_are_stable() {
        let (r1, c1) = derive_initial_keys(&[9u8; 96]).unwrap();
        let (r2, c2) = derive_initial_keys(&[9u8; 96]).unwrap();
        assert_eq!(r1.bytes(), r2.bytes());
        assert_eq!(c1.bytes(), c2.bytes());
    }
}
