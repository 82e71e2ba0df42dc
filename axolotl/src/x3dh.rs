//! X3DH key agreement for asynchronous session setup.
//!
//! The initiator fetches the responder's pre-key bundle and derives the
//! master secret from three (or four, with a one-time pre-key) DH
//! agreements. The responder recomputes the same secret from the base key
//! carried in the first `PreKeyWhisperMessage`.

use x25519_dalek::PublicKey;
use zeroize::Zeroize;

use crate::error::Result;
use crate::keys::{encode_point, xeddsa_verify, IdentityKeyPair, KeyPair};
use crate::ratchet::{derive_initial_keys, ChainKey, RootKey};

/// A peer's published pre-key bundle, as fetched from the service.
#[derive(Clone, Debug)]
pub struct PreKeyBundle {
    /// Peer registration id
    pub registration_id: u32,
    /// Device the bundle belongs to
    pub device_id: u32,
    /// Optional one-time pre-key
    pub pre_key_id: Option<u32>,
    /// One-time pre-key public point, when present
    pub pre_key: Option<PublicKey>,
    /// Signed pre-key id
    pub signed_pre_key_id: u32,
    /// Signed pre-key public point
    pub signed_pre_key: PublicKey,
    /// XEdDSA signature over the 0x05-prefixed signed pre-key
    pub signed_pre_key_signature: Vec<u8>,
    /// Peer identity public point
    pub identity_key: PublicKey,
}

impl PreKeyBundle {
    /// Verify the signed pre-key signature with the bundle's identity key.
    pub fn verify(&self) -> Result<()> {
        xeddsa_verify(
            &self.identity_key,
            &encode_point(&self.signed_pre_key),
            &self.signed_pre_key_signature,
        )
    }
}

/// Initiator-side inputs to the master secret.
pub struct AliceParams<'a> {
    /// Our long-term identity
    pub our_identity: &'a IdentityKeyPair,
    /// Our fresh base ephemeral, sent as `baseKey` in the first message
    pub our_base_key: &'a KeyPair,
    /// Their identity public point
    pub their_identity: &'a PublicKey,
    /// Their signed pre-key public point
    pub their_signed_pre_key: &'a PublicKey,
    /// Their one-time pre-key public point, when the bundle carried one
    pub their_one_time_pre_key: Option<&'a PublicKey>,
}

/// Responder-side inputs to the master secret.
pub struct BobParams<'a> {
    /// Our long-term identity
    pub our_identity: &'a IdentityKeyPair,
    /// Our signed pre-key pair
    pub our_signed_pre_key: &'a KeyPair,
    /// Our one-time pre-key pair, when the initiator consumed one
    pub our_one_time_pre_key: Option<&'a KeyPair>,
    /// Their identity public point
    pub their_identity: &'a PublicKey,
    /// Their base ephemeral from the first message
    pub their_base_key: &'a PublicKey,
}

/// Derive the initiator's (root, chain) pair.
///
/// Master secret input order:
/// `DH(IK_A, SPK_B) || DH(EK_A, IK_B) || DH(EK_A, SPK_B) || DH(EK_A, OPK_B)?`
pub fn alice_initial_keys(params: &AliceParams<'_>) -> Result<(RootKey, ChainKey)> {
    let mut secret = Vec::with_capacity(128);
    secret.extend_from_slice(
        params
            .our_identity
            .key_pair()
            .agree(params.their_signed_pre_key)
            .as_bytes(),
    );
    secret.extend_from_slice(params.our_base_key.agree(params.their_identity).as_bytes());
    secret.extend_from_slice(
        params
            .our_base_key
            .agree(params.their_signed_pre_key)
            .as_bytes(),
    );
    if let Some(opk) = params.their_one_time_pre_key {
        secret.extend_from_slice(params.our_base_key.agree(opk).as_bytes());
    }
    let keys = derive_initial_keys(&secret)?;
    secret.zeroize();
    Ok(keys)
}

/// Derive the responder's (root, chain) pair; the DH mirror of
/// [`alice_initial_keys`].
pub fn bob_initial_keys(params: &BobParams<'_>) -> Result<(RootKey, ChainKey)> {
    let mut secret = Vec::with_capacity(128);
    secret.extend_from_slice(
        params
            .our_signed_pre_key
            .agree(params.their_identity)
            .as_bytes(),
    );
    secret.extend_from_slice(
        params
            .our_identity
            .key_pair()
            .agree(params.their_base_key)
            .as_bytes(),
    );
    secret.extend_from_slice(
        params
            .our_signed_pre_key
            .agree(params.their_base_key)
            .as_bytes(),
    );
    if let Some(opk) = params.our_one_time_pre_key {
        secret.extend_from_slice(opk.agree(params.their_base_key).as_bytes());
    }
    let keys = derive_initial_keys(&secret)?;
    secret.zeroize();
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SignedPreKeyRecord;

    fn agreed_pair(with_otpk: bool) -> (RootKey, ChainKey, RootKey, ChainKey) {
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        let bob_spk = SignedPreKeyRecord::generate(1, &bob_identity);
        let bob_otpk = KeyPair::generate();
        let alice_base = KeyPair::generate();

        let (ar, ac) = alice_initial_keys(&AliceParams {
            our_identity: &alice_identity,
            our_base_key: &alice_base,
            their_identity: bob_identity.public(),
            their_signed_pre_key: &bob_spk.key_pair.public,
            their_one_time_pre_key: with_otpk.then_some(&bob_otpk.public),
        })
        .unwrap();

        let (br, bc) = bob_initial_keys(&BobParams {
            our_identity: &bob_identity,
            our_signed_pre_key: &bob_spk.key_pair,
            our_one_time_pre_key: with_otpk.then_some(&bob_otpk),
            their_identity: alice_identity.public(),
            their_base_key: &alice_base.public,
        })
        .unwrap();
        (ar, ac, br, bc)
    }

    #[test]
    fn both_sides_agree_with_one_time_key() {
        let (ar, ac, br, bc) = agreed_pair(true);
        assert_eq!(ar.bytes(), br.bytes());
        assert_eq!(ac.bytes(), bc.bytes());
    }

    #[test]
    fn both_sides_agree_without_one_time_key() {
        let (ar, ac, br, bc) = agreed_pair(false);
        assert_eq!(ar.bytes(), br.bytes());
        assert_eq!(ac.bytes(), bc.bytes());
    }

    #[test]
    fn bundle_signature_verification() {
        let identity = IdentityKeyPair::generate();
        let spk = SignedPreKeyRecord::generate(5, &identity);
        let mut bundle = PreKeyBundle {
            registration_id: 1,
            device_id: 1,
            pre_key_id: None,
            pre_key: None,
            signed_pre_key_id: 5,
            signed_pre_key: spk.key_pair.public,
            signed_pre_key_signature: spk.signature.clone(),
            identity_key: *identity.public(),
        };
        bundle.verify().unwrap();

        bundle.signed_pre_key_signature[10] ^= 1;
        assert!(bundle.verify().is_err());
    }
}
