//! Envelope → session → content pipeline over file stores, no network.

use std::path::PathBuf;

use axolotl::keys::{generate_registration_id, IdentityKeyPair, PreKeyRecord, SignedPreKeyRecord};
use axolotl::store::{Address, IdentityStore, PreKeyStore, SignedPreKeyStore};
use axolotl::x3dh::PreKeyBundle;
use axolotl::{CiphertextMessage, SessionBuilder, SessionCipher};

use textsecure::content::PushContent;
use textsecure::envelope::{envelope_type, open_envelope, seal_envelope, IncomingPushMessage, SignalingKey};
use textsecure::store::FileStore;
use textsecure::Error;

fn tmp_store(tag: &str) -> FileStore {
    let dir: PathBuf = std::env::temp_dir().join(format!(
        "ts-pipeline-{tag}-{}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    let store = FileStore::open(&dir, Some("pipeline test password")).unwrap();
    store
        .set_identity_key_pair(&IdentityKeyPair::generate())
        .unwrap();
    store
        .set_local_registration_id(generate_registration_id())
        .unwrap();
    store
}

/// Register Bob's pre-keys and build the bundle Alice would fetch.
fn bob_bundle(bob: &mut FileStore) -> PreKeyBundle {
    let identity = bob.identity_key_pair().unwrap();
    let pre_key = PreKeyRecord::generate(1);
    let signed = SignedPreKeyRecord::generate(1, &identity);
    bob.store_pre_key(&pre_key).unwrap();
    bob.store_signed_pre_key(&signed).unwrap();
    PreKeyBundle {
        registration_id: bob.local_registration_id().unwrap(),
        device_id: 1,
        pre_key_id: Some(pre_key.id),
        pre_key: Some(pre_key.key_pair.public),
        signed_pre_key_id: signed.id,
        signed_pre_key: signed.key_pair.public,
        signed_pre_key_signature: signed.signature.clone(),
        identity_key: *identity.public(),
    }
}

fn push_for(message: &CiphertextMessage, source: &str) -> IncomingPushMessage {
    let message_type = if message.is_pre_key() {
        envelope_type::PREKEY_BUNDLE
    } else {
        envelope_type::CIPHERTEXT
    };
    IncomingPushMessage {
        message_type,
        source: source.into(),
        source_device: 1,
        timestamp: 1_722_000_000_000,
        message: message.serialized().to_vec(),
    }
}

#[test]
fn first_contact_roundtrip_through_envelopes() {
    let mut alice = tmp_store("alice");
    let mut bob = tmp_store("bob");
    let bundle = bob_bundle(&mut bob);

    let signaling_raw = SignalingKey::generate();
    let signaling = SignalingKey::from_bytes(&signaling_raw).unwrap();

    // Alice builds the session and seals her first message.
    let bob_address = Address::new("15557654321", 1);
    SessionBuilder::process_bundle(&mut alice, &bob_address, &bundle).unwrap();
    let padded = PushContent::text("hello bob").encode_padded().unwrap();
    let sealed = SessionCipher::new(&mut alice, bob_address.clone())
        .encrypt(&padded)
        .unwrap();
    assert!(sealed.is_pre_key());

    // The service wraps it in a signaling envelope and pushes it.
    let envelope = seal_envelope(&signaling, &push_for(&sealed, "+15551234567")).unwrap();

    // Bob's side of the pipeline: envelope MAC + decrypt, session
    // decrypt, padding strip, content decode.
    let push = open_envelope(&signaling, &envelope).unwrap();
    assert_eq!(push.message_type, envelope_type::PREKEY_BUNDLE);
    assert_eq!(push.source, "+15551234567");

    let alice_address = Address::new("15551234567", push.source_device);
    let plaintext = SessionCipher::new(&mut bob, alice_address.clone())
        .decrypt_pre_key_whisper(&push.message)
        .unwrap();
    let content = PushContent::decode_padded(&plaintext).unwrap();
    assert_eq!(content.body.as_deref(), Some("hello bob"));

    // Bob replies; Alice decrypts through the same pipeline.
    let padded = PushContent::text("hi alice").encode_padded().unwrap();
    let reply = SessionCipher::new(&mut bob, alice_address)
        .encrypt(&padded)
        .unwrap();
    let envelope = seal_envelope(&signaling, &push_for(&reply, "+15557654321")).unwrap();
    let push = open_envelope(&signaling, &envelope).unwrap();
    assert_eq!(push.message_type, envelope_type::CIPHERTEXT);

    let plaintext = SessionCipher::new(&mut alice, bob_address)
        .decrypt_whisper(&push.message)
        .unwrap();
    let content = PushContent::decode_padded(&plaintext).unwrap();
    assert_eq!(content.body.as_deref(), Some("hi alice"));
}

#[test]
fn tampered_envelope_never_reaches_the_session() {
    let mut alice = tmp_store("alice2");
    let mut bob = tmp_store("bob2");
    let bundle = bob_bundle(&mut bob);

    let signaling_raw = SignalingKey::generate();
    let signaling = SignalingKey::from_bytes(&signaling_raw).unwrap();

    let bob_address = Address::new("15557654321", 1);
    SessionBuilder::process_bundle(&mut alice, &bob_address, &bundle).unwrap();
    let padded = PushContent::text("sealed").encode_padded().unwrap();
    let sealed = SessionCipher::new(&mut alice, bob_address)
        .encrypt(&padded)
        .unwrap();
    let envelope = seal_envelope(&signaling, &push_for(&sealed, "+15551234567")).unwrap();

    for pos in [0usize, 1, envelope.len() / 2, envelope.len() - 1] {
        let mut tampered = envelope.clone();
        tampered[pos] ^= 0x40;
        assert!(matches!(
            open_envelope(&signaling, &tampered),
            Err(Error::EnvelopeMac)
        ));
    }

    // Bob's pre-key is still unconsumed: nothing got past the MAC.
    assert_eq!(bob.pre_key_ids().unwrap(), vec![1]);
}

#[test]
fn sessions_survive_store_reopen() {
    let alice_dir = std::env::temp_dir().join(format!("ts-pipeline-reopen-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&alice_dir);
    std::fs::create_dir_all(&alice_dir).unwrap();

    let mut bob = tmp_store("bob3");
    let bundle = bob_bundle(&mut bob);
    let bob_address = Address::new("15557654321", 1);

    {
        let mut alice = FileStore::open(&alice_dir, Some("pw")).unwrap();
        alice
            .set_identity_key_pair(&IdentityKeyPair::generate())
            .unwrap();
        alice
            .set_local_registration_id(generate_registration_id())
            .unwrap();
        SessionBuilder::process_bundle(&mut alice, &bob_address, &bundle).unwrap();
    }

    // A fresh handle on the same directory continues the session.
    let mut alice = FileStore::open(&alice_dir, Some("pw")).unwrap();
    assert!(alice.valid());
    assert_eq!(alice.session_devices("15557654321").unwrap(), vec![1]);

    let padded = PushContent::text("after reopen").encode_padded().unwrap();
    let sealed = SessionCipher::new(&mut alice, bob_address)
        .encrypt(&padded)
        .unwrap();

    let plaintext = SessionCipher::new(&mut bob, Address::new("15551234567", 1))
        .decrypt_pre_key_whisper(sealed.serialized())
        .unwrap();
    assert_eq!(
        PushContent::decode_padded(&plaintext).unwrap().body.as_deref(),
        Some("after reopen")
    );
}
