//! The inner message content: body text, attachment pointers and group
//! context, plus the transport padding applied before session encryption.

use serde::{Deserialize, Serialize};

use axolotl::crypto::{
    aes_cbc_decrypt, aes_cbc_encrypt, constant_time_eq, hmac_sha256, random_bytes,
};

use crate::error::{Error, Result};

/// Content is padded to a multiple of this before session encryption so
/// ciphertext length leaks less about the body.
const PADDING_BLOCK: usize = 160;

/// Group context types carried inside [`PushContent`].
pub mod group_type {
    /// Create or update the group record
    pub const UPDATE: u32 = 1;
    /// A normal message addressed to the group
    pub const DELIVER: u32 = 2;
    /// The sender left the group
    pub const QUIT: u32 = 3;
}

/// Reference to an uploaded attachment blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentPointer {
    /// Blob id assigned by the service
    pub id: u64,
    /// MIME type of the plaintext
    pub content_type: String,
    /// 64 bytes of key material: AES-256 key || HMAC-SHA256 key
    pub key: Vec<u8>,
}

/// Group context attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupContext {
    /// 16-byte group id
    pub id: Vec<u8>,
    /// One of the [`group_type`] constants
    pub group_type: u32,
    /// Group name, on UPDATE
    pub name: Option<String>,
    /// Member list, on UPDATE
    pub members: Vec<String>,
}

/// The decrypted message payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushContent {
    /// Message body text
    pub body: Option<String>,
    /// Attachments referenced by the message
    pub attachments: Vec<AttachmentPointer>,
    /// Group context, when the message belongs to a group
    pub group: Option<GroupContext>,
}

impl PushContent {
    /// A plain text message.
    pub fn text(body: impl Into<String>) -> Self {
        PushContent {
            body: Some(body.into()),
            ..Default::default()
        }
    }

    /// Encode and pad, ready for session encryption.
    pub fn encode_padded(&self) -> Result<Vec<u8>> {
        let mut out = rmp_serde::to_vec(self)?;
        out.push(0x80);
        let rem = out.len() % PADDING_BLOCK;
        if rem != 0 {
            out.resize(out.len() + PADDING_BLOCK - rem, 0);
        }
        Ok(out)
    }

    /// Strip the transport padding and decode.
    pub fn decode_padded(bytes: &[u8]) -> Result<Self> {
        let stripped = strip_padding(bytes);
        rmp_serde::from_slice(stripped).map_err(|e| Error::Codec(e.to_string()))
    }
}

/// Truncate at the last `0x80` padding marker. Content without a marker
/// is passed through untouched, for peers that do not pad.
pub fn strip_padding(bytes: &[u8]) -> &[u8] {
    match bytes.iter().rposition(|&b| b == 0x80) {
        Some(pos) => &bytes[..pos],
        None => bytes,
    }
}

/// Key material for one attachment: AES-256 key followed by HMAC key.
pub fn generate_attachment_keys() -> [u8; 64] {
    let mut keys = [0u8; 64];
    random_bytes(&mut keys);
    keys
}

/// Seal attachment bytes as `iv(16) || CBC ciphertext || HMAC(32)`.
pub fn seal_attachment(keys: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    if keys.len() != 64 {
        return Err(Error::Codec("attachment key material must be 64 bytes".into()));
    }
    let mut iv = [0u8; 16];
    random_bytes(&mut iv);
    let ciphertext = aes_cbc_encrypt(&keys[..32], &iv, plaintext)
        .map_err(|e| Error::Codec(e.to_string()))?;
    let mut out = Vec::with_capacity(16 + ciphertext.len() + 32);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    let mac = hmac_sha256(&keys[32..], &out).map_err(|e| Error::Codec(e.to_string()))?;
    out.extend_from_slice(&mac);
    Ok(out)
}

/// Verify and decrypt a sealed attachment.
pub fn open_attachment(keys: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    if keys.len() != 64 {
        return Err(Error::Codec("attachment key material must be 64 bytes".into()));
    }
    if sealed.len() < 16 + 16 + 32 {
        return Err(Error::Codec("attachment too short".into()));
    }
    let (body, tag) = sealed.split_at(sealed.len() - 32);
    let expected = hmac_sha256(&keys[32..], body).map_err(|e| Error::Codec(e.to_string()))?;
    if !constant_time_eq(&expected, tag) {
        return Err(Error::Codec("attachment MAC mismatch".into()));
    }
    let (iv, ciphertext) = body.split_at(16);
    aes_cbc_decrypt(&keys[..32], iv, ciphertext).map_err(|e| Error::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_roundtrip() {
        let content = PushContent::text("hello there");
        let padded = content.encode_padded().unwrap();
        assert_eq!(padded.len() % PADDING_BLOCK, 0);
        let back = PushContent::decode_padded(&padded).unwrap();
        assert_eq!(back, content);
    }

    #[test]
    fn padding_lengths_collapse() {
        // Bodies of nearby sizes produce identical padded lengths.
        let a = PushContent::text("x".repeat(10)).encode_padded().unwrap();
        let b = PushContent::text("x".repeat(40)).encode_padded().unwrap();
        assert_eq!(a.len(), b.len());
    }

    #[test]
    fn group_context_roundtrip() {
        let content = PushContent {
            body: Some("moving to the new channel".into()),
            attachments: vec![AttachmentPointer {
                id: 42,
                content_type: "image/png".into(),
                key: vec![1u8; 64],
            }],
            group: Some(GroupContext {
                id: vec![7u8; 16],
                group_type: group_type::DELIVER,
                name: None,
                members: Vec::new(),
            }),
        };
        let padded = content.encode_padded().unwrap();
        assert_eq!(PushContent::decode_padded(&padded).unwrap(), content);
    }

    #[test]
    fn strip_finds_the_last_marker() {
        assert_eq!(strip_padding(&[1, 2, 0x80, 0, 0]), &[1, 2]);
        assert_eq!(strip_padding(&[0x80, 5, 0x80, 0]), &[0x80, 5]);
        assert_eq!(strip_padding(&[1, 2, 3]), &[1, 2, 3]);
    }

    #[test]
    fn attachment_roundtrip_and_tamper() {
        let keys = generate_attachment_keys();
        let payload = b"file contents, could be anything".to_vec();
        let sealed = seal_attachment(&keys, &payload).unwrap();
        assert_eq!(open_attachment(&keys, &sealed).unwrap(), payload);

        let mut tampered = sealed.clone();
        tampered[20] ^= 1;
        assert!(open_attachment(&keys, &tampered).is_err());

        let other = generate_attachment_keys();
        assert!(open_attachment(&other, &sealed).is_err());
    }
}
