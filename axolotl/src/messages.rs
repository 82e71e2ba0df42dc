//! Wire form of the two session message types.
//!
//! A `WhisperMessage` is `version(1) || body || mac(8)` where the body is
//! the MessagePack encoding of the ratchet header and ciphertext, and the
//! MAC is HMAC-SHA256 over both identity keys and the versioned body,
//! truncated to eight bytes. A `PreKeyWhisperMessage` wraps a complete
//! `WhisperMessage` together with the handshake material the responder
//! needs to build the session.

use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey;

use crate::crypto::{hmac_sha256, verify_trunc_mac};
use crate::error::{Error, Result};
use crate::keys::decode_point;

/// Version byte carried by both message types.
pub const CIPHERTEXT_VERSION: u8 = 3;

/// Length of the truncated message MAC.
pub const MAC_LENGTH: usize = 8;

#[derive(Serialize, Deserialize)]
struct WhisperBody {
    ratchet_key: Vec<u8>,
    counter: u32,
    previous_counter: u32,
    ciphertext: Vec<u8>,
}

/// An encrypted message within an established session.
#[derive(Clone, Debug, PartialEq)]
pub struct WhisperMessage {
    /// Sender's current ratchet public point
    pub ratchet_key: PublicKey,
    /// Index in the sender's current chain
    pub counter: u32,
    /// Length of the sender's previous chain
    pub previous_counter: u32,
    /// AES-256-CBC ciphertext of the padded content
    pub ciphertext: Vec<u8>,
    serialized: Vec<u8>,
}

impl WhisperMessage {
    /// Assemble and MAC a message.
    ///
    /// `sender_identity` and `receiver_identity` are the 0x05-prefixed
    /// identity encodings; their order is fixed by the sending side.
    pub fn new(
        mac_key: &[u8],
        ratchet_key: &PublicKey,
        counter: u32,
        previous_counter: u32,
        ciphertext: Vec<u8>,
        sender_identity: &[u8],
        receiver_identity: &[u8],
    ) -> Result<Self> {
        let body = WhisperBody {
            ratchet_key: crate::keys::encode_point(ratchet_key),
            counter,
            previous_counter,
            ciphertext: ciphertext.clone(),
        };
        let encoded = rmp_serde::to_vec(&body).map_err(|e| Error::InvalidMessage(e.to_string()))?;

        let mut serialized = Vec::with_capacity(1 + encoded.len() + MAC_LENGTH);
        serialized.push(CIPHERTEXT_VERSION);
        serialized.extend_from_slice(&encoded);

        let mac = Self::compute_mac(mac_key, sender_identity, receiver_identity, &serialized)?;
        serialized.extend_from_slice(&mac);

        Ok(WhisperMessage {
            ratchet_key: *ratchet_key,
            counter,
            previous_counter,
            ciphertext,
            serialized,
        })
    }

    /// Parse a message from wire bytes. The MAC is *not* checked here;
    /// that needs the message keys, which the session derives from the
    /// header this parse exposes.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() <= 1 + MAC_LENGTH {
            return Err(Error::InvalidMessage("whisper message too short".into()));
        }
        if bytes[0] != CIPHERTEXT_VERSION {
            return Err(Error::InvalidVersion(bytes[0]));
        }
        let body: WhisperBody = rmp_serde::from_slice(&bytes[1..bytes.len() - MAC_LENGTH])
            .map_err(|e| Error::InvalidMessage(e.to_string()))?;
        Ok(WhisperMessage {
            ratchet_key: decode_point(&body.ratchet_key)?,
            counter: body.counter,
            previous_counter: body.previous_counter,
            ciphertext: body.ciphertext,
            serialized: bytes.to_vec(),
        })
    }

    /// Verify the trailing truncated MAC in constant time.
    pub fn verify_mac(
        &self,
        mac_key: &[u8],
        sender_identity: &[u8],
        receiver_identity: &[u8],
    ) -> Result<()> {
        let split = self.serialized.len() - MAC_LENGTH;
        let mut keyed = Vec::with_capacity(sender_identity.len() + receiver_identity.len() + split);
        keyed.extend_from_slice(sender_identity);
        keyed.extend_from_slice(receiver_identity);
        keyed.extend_from_slice(&self.serialized[..split]);
        if verify_trunc_mac(mac_key, &keyed, &self.serialized[split..])? {
            Ok(())
        } else {
            Err(Error::InvalidMac)
        }
    }

    /// The full wire bytes including version and MAC.
    pub fn serialized(&self) -> &[u8] {
        &self.serialized
    }

    fn compute_mac(
        mac_key: &[u8],
        sender_identity: &[u8],
        receiver_identity: &[u8],
        versioned_body: &[u8],
    ) -> Result<[u8; MAC_LENGTH]> {
        let mut keyed =
            Vec::with_capacity(sender_identity.len() + receiver_identity.len() + versioned_body.len());
        keyed.extend_from_slice(sender_identity);
        keyed.extend_from_slice(receiver_identity);
        keyed.extend_from_slice(versioned_body);
        let full = hmac_sha256(mac_key, &keyed)?;
        let mut mac = [0u8; MAC_LENGTH];
        mac.copy_from_slice(&full[..MAC_LENGTH]);
        Ok(mac)
    }
}

#[derive(Serialize, Deserialize)]
struct PreKeyBody {
    registration_id: u32,
    pre_key_id: Option<u32>,
    signed_pre_key_id: u32,
    base_key: Vec<u8>,
    identity_key: Vec<u8>,
    message: Vec<u8>,
}

/// The session-establishing first message: handshake material plus an
/// embedded [`WhisperMessage`].
#[derive(Clone, Debug)]
pub struct PreKeyWhisperMessage {
    /// Sender registration id
    pub registration_id: u32,
    /// One-time pre-key consumed, when one was available
    pub pre_key_id: Option<u32>,
    /// Signed pre-key the sender ratcheted against
    pub signed_pre_key_id: u32,
    /// Sender's X3DH base ephemeral
    pub base_key: PublicKey,
    /// Sender's identity public point
    pub identity_key: PublicKey,
    /// The embedded whisper message
    pub message: WhisperMessage,
    serialized: Vec<u8>,
}

impl PreKeyWhisperMessage {
    /// Wrap a whisper message with handshake material.
    pub fn new(
        registration_id: u32,
        pre_key_id: Option<u32>,
        signed_pre_key_id: u32,
        base_key: &PublicKey,
        identity_key: &PublicKey,
        message: WhisperMessage,
    ) -> Result<Self> {
        let body = PreKeyBody {
            registration_id,
            pre_key_id,
            signed_pre_key_id,
            base_key: crate::keys::encode_point(base_key),
            identity_key: crate::keys::encode_point(identity_key),
            message: message.serialized().to_vec(),
        };
        let encoded = rmp_serde::to_vec(&body).map_err(|e| Error::InvalidMessage(e.to_string()))?;
        let mut serialized = Vec::with_capacity(1 + encoded.len());
        serialized.push(CIPHERTEXT_VERSION);
        serialized.extend_from_slice(&encoded);

        Ok(PreKeyWhisperMessage {
            registration_id,
            pre_key_id,
            signed_pre_key_id,
            base_key: *base_key,
            identity_key: *identity_key,
            message,
            serialized,
        })
    }

    /// Parse from wire bytes.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() <= 1 {
            return Err(Error::InvalidMessage("prekey message too short".into()));
        }
        if bytes[0] != CIPHERTEXT_VERSION {
            return Err(Error::InvalidVersion(bytes[0]));
        }
        let body: PreKeyBody = rmp_serde::from_slice(&bytes[1..])
            .map_err(|e| Error::InvalidMessage(e.to_string()))?;
        Ok(PreKeyWhisperMessage {
            registration_id: body.registration_id,
            pre_key_id: body.pre_key_id,
            signed_pre_key_id: body.signed_pre_key_id,
            base_key: decode_point(&body.base_key)?,
            identity_key: decode_point(&body.identity_key)?,
            message: WhisperMessage::deserialize(&body.message)?,
            serialized: bytes.to_vec(),
        })
    }

    /// The full wire bytes.
    pub fn serialized(&self) -> &[u8] {
        &self.serialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{encode_point, KeyPair};

    fn sample_message(mac_key: &[u8; 32]) -> (WhisperMessage, Vec<u8>, Vec<u8>) {
        let ratchet = KeyPair::generate();
        let sender = encode_point(&KeyPair::generate().public);
        let receiver = encode_point(&KeyPair::generate().public);
        let msg = WhisperMessage::new(
            mac_key,
            &ratchet.public,
            4,
            2,
            vec![0xAA; 48],
            &sender,
            &receiver,
        )
        .unwrap();
        (msg, sender, receiver)
    }

    #[test]
    fn whisper_roundtrip_and_mac() {
        let mac_key = [3u8; 32];
        let (msg, sender, receiver) = sample_message(&mac_key);

        let parsed = WhisperMessage::deserialize(msg.serialized()).unwrap();
        assert_eq!(parsed.counter, 4);
        assert_eq!(parsed.previous_counter, 2);
        assert_eq!(parsed.ciphertext, msg.ciphertext);
        parsed.verify_mac(&mac_key, &sender, &receiver).unwrap();
    }

    #[test]
    fn whisper_mac_rejects_any_bit_flip() {
        let mac_key = [3u8; 32];
        let (msg, sender, receiver) = sample_message(&mac_key);
        let wire = msg.serialized().to_vec();

        for pos in [0usize, 1, wire.len() / 2, wire.len() - 1] {
            let mut tampered = wire.clone();
            tampered[pos] ^= 0x01;
            match WhisperMessage::deserialize(&tampered) {
                Ok(parsed) => {
                    assert_eq!(
                        parsed.verify_mac(&mac_key, &sender, &receiver),
                        Err(Error::InvalidMac)
                    );
                }
                // flipping a byte may break version or body framing instead
                Err(Error::InvalidVersion(_)) | Err(Error::InvalidMessage(_)) => {}
                Err(e) => panic!("unexpected error {e:?}"),
            }
        }
    }

    #[test]
    fn whisper_rejects_wrong_version() {
        let mac_key = [3u8; 32];
        let (msg, _, _) = sample_message(&mac_key);
        let mut wire = msg.serialized().to_vec();
        wire[0] = 2;
        assert_eq!(
            WhisperMessage::deserialize(&wire),
            Err(Error::InvalidVersion(2))
        );
    }

    #[test]
    fn prekey_message_roundtrip() {
        let mac_key = [9u8; 32];
        let (msg, _, _) = sample_message(&mac_key);
        let base = KeyPair::generate();
        let identity = KeyPair::generate();

        let pkwm = PreKeyWhisperMessage::new(
            1234,
            Some(77),
            9,
            &base.public,
            &identity.public,
            msg.clone(),
        )
        .unwrap();
        let parsed = PreKeyWhisperMessage::deserialize(pkwm.serialized()).unwrap();
        assert_eq!(parsed.registration_id, 1234);
        assert_eq!(parsed.pre_key_id, Some(77));
        assert_eq!(parsed.signed_pre_key_id, 9);
        assert_eq!(parsed.base_key.as_bytes(), base.public.as_bytes());
        assert_eq!(parsed.message.serialized(), msg.serialized());
    }

    #[test]
    fn prekey_message_without_one_time_key() {
        let mac_key = [9u8; 32];
        let (msg, _, _) = sample_message(&mac_key);
        let base = KeyPair::generate();
        let identity = KeyPair::generate();
        let pkwm =
            PreKeyWhisperMessage::new(1, None, 2, &base.public, &identity.public, msg).unwrap();
        let parsed = PreKeyWhisperMessage::deserialize(pkwm.serialized()).unwrap();
        assert_eq!(parsed.pre_key_id, None);
    }
}
