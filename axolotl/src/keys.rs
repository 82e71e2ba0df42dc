//! Curve25519 key material: identity keys, pre-keys and point encoding.
//!
//! The identity is a single Curve25519 pair. Signed pre-keys carry an
//! XEdDSA signature made with that same pair, so a peer can verify the
//! signature knowing only the Montgomery-form identity public key.

use curve25519_dalek::{
    constants::ED25519_BASEPOINT_TABLE,
    edwards::{CompressedEdwardsY, EdwardsPoint},
    montgomery::MontgomeryPoint,
    scalar::Scalar,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroize;

use crate::crypto::random_bytes;
use crate::error::{Error, Result};

/// Serialized public points are prefixed with this type byte.
pub const DJB_TYPE: u8 = 0x05;

/// XEdDSA signatures are 64 bytes: R point plus s scalar.
pub const SIGNATURE_LENGTH: usize = 64;

/// A Curve25519 key pair.
#[derive(Clone)]
pub struct KeyPair {
    /// Private scalar
    pub private: StaticSecret,
    /// Public Montgomery point
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let private = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&private);
        KeyPair { private, public }
    }

    /// Rebuild a key pair from stored private scalar bytes.
    pub fn from_private_bytes(bytes: [u8; 32]) -> Self {
        let private = StaticSecret::from(bytes);
        let public = PublicKey::from(&private);
        KeyPair { private, public }
    }

    /// X25519 DH agreement with a peer public point.
    pub fn agree(&self, their: &PublicKey) -> SharedSecret {
        self.private.diffie_hellman(their)
    }

    /// The public point with the 0x05 type prefix, as sent on the wire.
    pub fn public_serialized(&self) -> Vec<u8> {
        encode_point(&self.public)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair({})", hex32(self.public.as_bytes()))
    }
}

fn hex32(b: &[u8; 32]) -> String {
    b.iter().map(|x| format!("{x:02x}")).collect()
}

/// Serialize a public point as `0x05 || montgomery(32)`.
pub fn encode_point(key: &PublicKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(33);
    out.push(DJB_TYPE);
    out.extend_from_slice(key.as_bytes());
    out
}

/// Parse a `0x05 || montgomery(32)` encoded public point.
pub fn decode_point(bytes: &[u8]) -> Result<PublicKey> {
    if bytes.len() != 33 {
        return Err(Error::InvalidKey(format!(
            "public key length {} (want 33)",
            bytes.len()
        )));
    }
    if bytes[0] != DJB_TYPE {
        return Err(Error::InvalidKey(format!("key type {:#04x}", bytes[0])));
    }
    let mut raw = [0u8; 32];
    raw.copy_from_slice(&bytes[1..]);
    Ok(PublicKey::from(raw))
}

/// The device's long-term identity.
///
/// Created exactly once per install; the store enforces that any later
/// write is rejected.
#[derive(Clone, Debug)]
pub struct IdentityKeyPair {
    key_pair: KeyPair,
}

impl IdentityKeyPair {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        IdentityKeyPair {
            key_pair: KeyPair::generate(),
        }
    }

    /// Rebuild from stored private scalar bytes.
    pub fn from_private_bytes(bytes: [u8; 32]) -> Self {
        IdentityKeyPair {
            key_pair: KeyPair::from_private_bytes(bytes),
        }
    }

    /// The underlying key pair.
    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    /// The identity public point.
    pub fn public(&self) -> &PublicKey {
        &self.key_pair.public
    }

    /// The 0x05-prefixed wire encoding of the public point.
    pub fn public_serialized(&self) -> Vec<u8> {
        self.key_pair.public_serialized()
    }

    /// Private scalar bytes, for persistence.
    pub fn private_bytes(&self) -> [u8; 32] {
        self.key_pair.private.to_bytes()
    }

    /// Sign `message` with the identity scalar (XEdDSA).
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        let mut nonce = [0u8; 64];
        random_bytes(&mut nonce);
        xeddsa_sign(&self.key_pair.private.to_bytes(), message, &nonce)
    }
}

/// A one-time pre-key as persisted in the store.
#[derive(Clone, Debug)]
pub struct PreKeyRecord {
    /// Server-visible pre-key id
    pub id: u32,
    /// The key pair
    pub key_pair: KeyPair,
}

#[derive(Serialize, Deserialize)]
struct PreKeySnapshot {
    id: u32,
    private: [u8; 32],
}

impl PreKeyRecord {
    /// Generate a record with the given id.
    pub fn generate(id: u32) -> Self {
        PreKeyRecord {
            id,
            key_pair: KeyPair::generate(),
        }
    }

    /// Serialize for the store.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let snap = PreKeySnapshot {
            id: self.id,
            private: self.key_pair.private.to_bytes(),
        };
        rmp_serde::to_vec(&snap).map_err(|e| Error::Store(e.to_string()))
    }

    /// Restore from store bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut snap: PreKeySnapshot =
            rmp_serde::from_slice(bytes).map_err(|e| Error::Store(e.to_string()))?;
        let record = PreKeyRecord {
            id: snap.id,
            key_pair: KeyPair::from_private_bytes(snap.private),
        };
        snap.private.zeroize();
        Ok(record)
    }
}

/// The signed pre-key: a pre-key whose public half carries an identity
/// signature.
#[derive(Clone, Debug)]
pub struct SignedPreKeyRecord {
    /// Server-visible id
    pub id: u32,
    /// The key pair
    pub key_pair: KeyPair,
    /// XEdDSA signature over the 0x05-prefixed public point
    pub signature: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SignedPreKeySnapshot {
    id: u32,
    private: [u8; 32],
    signature: Vec<u8>,
}

impl SignedPreKeyRecord {
    /// Generate and sign a record with the given id.
    pub fn generate(id: u32, identity: &IdentityKeyPair) -> Self {
        let key_pair = KeyPair::generate();
        let signature = identity.sign(&encode_point(&key_pair.public)).to_vec();
        SignedPreKeyRecord {
            id,
            key_pair,
            signature,
        }
    }

    /// Serialize for the store.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let snap = SignedPreKeySnapshot {
            id: self.id,
            private: self.key_pair.private.to_bytes(),
            signature: self.signature.clone(),
        };
        rmp_serde::to_vec(&snap).map_err(|e| Error::Store(e.to_string()))
    }

    /// Restore from store bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut snap: SignedPreKeySnapshot =
            rmp_serde::from_slice(bytes).map_err(|e| Error::Store(e.to_string()))?;
        let record = SignedPreKeyRecord {
            id: snap.id,
            key_pair: KeyPair::from_private_bytes(snap.private),
            signature: snap.signature.clone(),
        };
        snap.private.zeroize();
        Ok(record)
    }
}

/// Generate a random 14-bit registration id.
pub fn generate_registration_id() -> u32 {
    let mut b = [0u8; 4];
    random_bytes(&mut b);
    u32::from_le_bytes(b) & 0x3fff
}

// ─── XEdDSA over Curve25519 ────────────────────────────────────────────
//
// Sign/verify with a Montgomery-form key via the birational map to
// Ed25519, per "The XEdDSA and VXEdDSA Signature Schemes" (Perrin, 2016).

/// Sign `message` with an X25519 private scalar.
pub fn xeddsa_sign(private: &[u8; 32], message: &[u8], nonce: &[u8; 64]) -> [u8; SIGNATURE_LENGTH] {
    let mut clamped = *private;
    clamped[0] &= 248;
    clamped[31] &= 127;
    clamped[31] |= 64;
    let k = Scalar::from_bytes_mod_order(clamped);
    clamped.zeroize();

    // A = kB with the sign bit forced to zero; negate k when needed
    let e_point = &k * ED25519_BASEPOINT_TABLE;
    let e_compressed = e_point.compress();
    let sign_bit = (e_compressed.as_bytes()[31] >> 7) & 1;
    let a = if sign_bit == 1 { -k } else { k };
    let mut a_bytes = *e_compressed.as_bytes();
    a_bytes[31] &= 0x7F;

    // r = hash1(a || M || Z) mod q, with the 0xFE || 0xFF^31 domain prefix
    let mut hasher = Sha512::new();
    hasher.update([0xFEu8]);
    hasher.update([0xFFu8; 31]);
    hasher.update(a.as_bytes());
    hasher.update(message);
    hasher.update(nonce);
    let r = Scalar::from_bytes_mod_order_wide(&hasher.finalize().into());

    let r_point = (&r * ED25519_BASEPOINT_TABLE).compress();

    // h = hash(R || A || M) mod q
    let mut hasher = Sha512::new();
    hasher.update(r_point.as_bytes());
    hasher.update(a_bytes);
    hasher.update(message);
    let h = Scalar::from_bytes_mod_order_wide(&hasher.finalize().into());

    let s = r + h * a;

    let mut signature = [0u8; SIGNATURE_LENGTH];
    signature[..32].copy_from_slice(r_point.as_bytes());
    signature[32..].copy_from_slice(s.as_bytes());
    signature
}

/// Verify an XEdDSA signature against an X25519 public point.
pub fn xeddsa_verify(public: &PublicKey, message: &[u8], signature: &[u8]) -> Result<()> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(Error::InvalidSignature);
    }
    let mut r_bytes = [0u8; 32];
    let mut s_bytes = [0u8; 32];
    r_bytes.copy_from_slice(&signature[..32]);
    s_bytes.copy_from_slice(&signature[32..]);

    // s must be a canonical scalar
    if (s_bytes[31] & 0xE0) != 0 {
        return Err(Error::InvalidSignature);
    }
    let s = Scalar::from_bytes_mod_order(s_bytes);

    let r_compressed = CompressedEdwardsY(r_bytes);
    r_compressed.decompress().ok_or(Error::InvalidSignature)?;

    // Map the Montgomery public key to Edwards form with sign bit zero
    let mut u = *public.as_bytes();
    u[31] &= 0x7F;
    let a_point = MontgomeryPoint(u)
        .to_edwards(0)
        .ok_or_else(|| Error::InvalidKey("point not on curve".into()))?;
    let mut a_bytes = *a_point.compress().as_bytes();
    a_bytes[31] &= 0x7F;

    let mut hasher = Sha512::new();
    hasher.update(r_bytes);
    hasher.update(a_bytes);
    hasher.update(message);
    let h = Scalar::from_bytes_mod_order_wide(&hasher.finalize().into());

    // Rcheck = sB - hA
    let r_check = EdwardsPoint::vartime_double_scalar_mul_basepoint(&h, &-a_point, &s);

    if r_check.compress().as_bytes().ct_eq(&r_bytes).into() {
        Ok(())
    } else {
        Err(Error::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_encoding_roundtrip() {
        let kp = KeyPair::generate();
        let encoded = encode_point(&kp.public);
        assert_eq!(encoded.len(), 33);
        assert_eq!(encoded[0], DJB_TYPE);
        let decoded = decode_point(&encoded).unwrap();
        assert_eq!(decoded.as_bytes(), kp.public.as_bytes());
    }

    #[test]
    fn point_decoding_rejects_malformed() {
        assert!(decode_point(&[5u8; 32]).is_err());
        let mut bad = vec![6u8];
        bad.extend_from_slice(&[0u8; 32]);
        assert!(decode_point(&bad).is_err());
    }

    #[test]
    fn dh_agreement_matches() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_eq!(
            a.agree(&b.public).as_bytes(),
            b.agree(&a.public).as_bytes()
        );
    }

    #[test]
    fn identity_signs_its_signed_prekey() {
        let identity = IdentityKeyPair::generate();
        let spk = SignedPreKeyRecord::generate(42, &identity);
        xeddsa_verify(
            identity.public(),
            &encode_point(&spk.key_pair.public),
            &spk.signature,
        )
        .unwrap();
    }

    #[test]
    fn signature_rejects_tampering() {
        let identity = IdentityKeyPair::generate();
        let sig = identity.sign(b"message");
        assert!(xeddsa_verify(identity.public(), b"message", &sig).is_ok());
        assert!(xeddsa_verify(identity.public(), b"other", &sig).is_err());

        let mut bad = sig;
        bad[7] ^= 1;
        assert!(xeddsa_verify(identity.public(), b"message", &bad).is_err());

        // non-canonical s
        let mut high = sig;
        high[63] |= 0xE0;
        assert!(xeddsa_verify(identity.public(), b"message", &high).is_err());
    }

    #[test]
    fn prekey_record_roundtrip() {
        let record = PreKeyRecord::generate(7);
        let bytes = record.to_bytes().unwrap();
        let back = PreKeyRecord::from_bytes(&bytes).unwrap();
        assert_eq!(back.id, 7);
        assert_eq!(
            back.key_pair.public.as_bytes(),
            record.key_pair.public.as_bytes()
        );
    }

    #[test]
    fn signed_prekey_record_roundtrip() {
        let identity = IdentityKeyPair::generate();
        let record = SignedPreKeyRecord::generate(1, &identity);
        let bytes = record.to_bytes().unwrap();
        let back = SignedPreKeyRecord::from_bytes(&bytes).unwrap();
        assert_eq!(back.id, 1);
        assert_eq!(back.signature, record.signature);
    }

    #[test]
    fn registration_id_is_14_bits() {
        for _ in 0..64 {
            assert!(generate_registration_id() < 16384);
        }
    }
}
