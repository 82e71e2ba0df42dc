//! The authenticated envelope the service wraps around every push.
//!
//! Wire layout, bit-exact:
//!
//! ```text
//! version(1) || ciphertext(N) || truncMac(10)
//! ```
//!
//! `truncMac` is the first ten bytes of HMAC-SHA256 over
//! `version || ciphertext` under the signaling MAC key, compared in
//! constant time. The ciphertext is AES-256-CBC under the signaling AES
//! key with its first 16 bytes serving as IV, and decrypts to a
//! MessagePack [`IncomingPushMessage`].

use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use axolotl::crypto::{aes_cbc_decrypt, aes_cbc_encrypt, hmac_sha256, random_bytes, verify_trunc_mac};

use crate::error::{Error, Result};
use crate::store::SIGNALING_KEY_LEN;

/// Envelope version tag; anything else is rejected.
pub const ENVELOPE_VERSION: u8 = 1;

/// Length of the truncated envelope MAC.
pub const ENVELOPE_MAC_LEN: usize = 10;

/// Push message types, matching the service's envelope type field.
pub mod envelope_type {
    /// Mid-session encrypted message
    pub const CIPHERTEXT: u32 = 1;
    /// Legacy key-exchange; not handled
    pub const KEY_EXCHANGE: u32 = 2;
    /// Session-establishing encrypted message
    pub const PREKEY_BUNDLE: u32 = 3;
    /// Unencrypted content from trusted infrastructure paths
    pub const PLAINTEXT: u32 = 4;
    /// Delivery receipt; no session work
    pub const RECEIPT: u32 = 5;
}

/// The 52-byte signaling key split into its AES and MAC halves.
#[derive(ZeroizeOnDrop)]
pub struct SignalingKey {
    aes: [u8; 32],
    mac: [u8; 20],
}

impl SignalingKey {
    /// Split a 52-byte signaling key. Shorter or longer inputs are
    /// rejected immediately.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SIGNALING_KEY_LEN {
            return Err(Error::Envelope(format!(
                "signaling key length {} (want {SIGNALING_KEY_LEN})",
                bytes.len()
            )));
        }
        let mut aes = [0u8; 32];
        let mut mac = [0u8; 20];
        aes.copy_from_slice(&bytes[..32]);
        mac.copy_from_slice(&bytes[32..]);
        Ok(SignalingKey { aes, mac })
    }

    /// Generate a fresh signaling key for registration.
    pub fn generate() -> [u8; SIGNALING_KEY_LEN] {
        let mut key = [0u8; SIGNALING_KEY_LEN];
        random_bytes(&mut key);
        key
    }
}

/// Envelope metadata and the inner session ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingPushMessage {
    /// One of the [`envelope_type`] constants
    pub message_type: u32,
    /// Sender id, `+`-prefixed phone number
    pub source: String,
    /// Sender device id
    pub source_device: u32,
    /// Sender-side timestamp, milliseconds
    pub timestamp: u64,
    /// The session-layer message bytes
    pub message: Vec<u8>,
}

/// Authenticate and decrypt a pushed envelope.
pub fn open_envelope(key: &SignalingKey, body: &[u8]) -> Result<IncomingPushMessage> {
    // version + IV + one cipher block + MAC is the smallest valid frame
    if body.len() < 1 + 32 + ENVELOPE_MAC_LEN {
        return Err(Error::Envelope(format!("envelope too short: {}", body.len())));
    }
    let macpos = body.len() - ENVELOPE_MAC_LEN;

    if !verify_trunc_mac(&key.mac, &body[..macpos], &body[macpos..])
        .map_err(|e| Error::Envelope(e.to_string()))?
    {
        return Err(Error::EnvelopeMac);
    }

    if body[0] != ENVELOPE_VERSION {
        return Err(Error::Envelope(format!("envelope version {}", body[0])));
    }

    let ciphertext = &body[1..macpos];
    let (iv, ct) = ciphertext.split_at(16);
    let plaintext =
        aes_cbc_decrypt(&key.aes, iv, ct).map_err(|e| Error::Envelope(e.to_string()))?;

    rmp_serde::from_slice(&plaintext).map_err(|e| Error::Envelope(e.to_string()))
}

/// Seal a push message the way the service does. Exercised by the tests
/// and by loopback tooling; the client itself only ever opens envelopes.
pub fn seal_envelope(key: &SignalingKey, message: &IncomingPushMessage) -> Result<Vec<u8>> {
    let plaintext = rmp_serde::to_vec(message)?;
    let mut iv = [0u8; 16];
    random_bytes(&mut iv);
    let ciphertext = aes_cbc_encrypt(&key.aes, &iv, &plaintext)
        .map_err(|e| Error::Envelope(e.to_string()))?;

    let mut out = Vec::with_capacity(1 + 16 + ciphertext.len() + ENVELOPE_MAC_LEN);
    out.push(ENVELOPE_VERSION);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    let mac = hmac_sha256(&key.mac, &out).map_err(|e| Error::Envelope(e.to_string()))?;
    out.extend_from_slice(&mac[..ENVELOPE_MAC_LEN]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key() -> SignalingKey {
        let mut raw = [0u8; SIGNALING_KEY_LEN];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = i as u8;
        }
        SignalingKey::from_bytes(&raw).unwrap()
    }

    fn sample_message() -> IncomingPushMessage {
        IncomingPushMessage {
            message_type: envelope_type::CIPHERTEXT,
            source: "+15557654321".into(),
            source_device: 1,
            timestamp: 1_722_000_000_000,
            message: vec![0xDE, 0xAD, 0xBE, 0xEF],
        }
    }

    #[test]
    fn roundtrip() {
        let key = sample_key();
        let sealed = seal_envelope(&key, &sample_message()).unwrap();
        let opened = open_envelope(&key, &sealed).unwrap();
        assert_eq!(opened.message_type, envelope_type::CIPHERTEXT);
        assert_eq!(opened.source, "+15557654321");
        assert_eq!(opened.source_device, 1);
        assert_eq!(opened.message, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn every_bit_flip_is_rejected() {
        let key = sample_key();
        let sealed = seal_envelope(&key, &sample_message()).unwrap();

        for byte in 0..sealed.len() {
            for bit in 0..8 {
                let mut tampered = sealed.clone();
                tampered[byte] ^= 1 << bit;
                match open_envelope(&key, &tampered) {
                    Err(Error::EnvelopeMac) => {}
                    other => panic!(
                        "byte {byte} bit {bit}: expected EnvelopeMac, got {other:?}"
                    ),
                }
            }
        }
    }

    #[test]
    fn wrong_mac_key_is_rejected() {
        let key = sample_key();
        let sealed = seal_envelope(&key, &sample_message()).unwrap();
        let other = SignalingKey::from_bytes(&[9u8; SIGNALING_KEY_LEN]).unwrap();
        assert!(matches!(open_envelope(&other, &sealed), Err(Error::EnvelopeMac)));
    }

    #[test]
    fn short_signaling_key_is_rejected() {
        assert!(SignalingKey::from_bytes(&[0u8; 51]).is_err());
        assert!(SignalingKey::from_bytes(&[0u8; 53]).is_err());
        assert!(SignalingKey::from_bytes(&[]).is_err());
    }

    #[test]
    fn short_envelope_is_rejected() {
        let key = sample_key();
        assert!(matches!(
            open_envelope(&key, &[1u8; 10]),
            Err(Error::Envelope(_))
        ));
    }

    #[test]
    fn generated_keys_have_the_right_length() {
        let raw = SignalingKey::generate();
        assert_eq!(raw.len(), SIGNALING_KEY_LEN);
        SignalingKey::from_bytes(&raw).unwrap();
    }
}
