//! Symmetric primitives shared by the session cipher and the client stores.
//!
//! Everything here is synchronous and CPU-bound. Malformed inputs produce
//! [`Error`] values rather than panics so that callers can reject a single
//! message instead of crashing the process.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Type alias for HMAC-SHA256
pub type HmacSha256 = Hmac<Sha256>;

/// Fill `buf` with cryptographically secure random bytes.
pub fn random_bytes(buf: &mut [u8]) {
    rand::rngs::OsRng.fill_bytes(buf);
}

/// HMAC-SHA256 of `data` under `key`, full 32-byte tag.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// HKDF-SHA256 with optional salt, filling `okm`.
pub fn hkdf_sha256(salt: Option<&[u8]>, ikm: &[u8], info: &[u8], okm: &mut [u8]) -> Result<()> {
    Hkdf::<Sha256>::new(salt, ikm)
        .expand(info, okm)
        .map_err(|e| Error::Crypto(e.to_string()))
}

/// AES-256-CBC encrypt with PKCS#7 padding.
pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let enc = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|_| Error::InvalidKey("bad AES key or IV length".into()))?;
    Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// AES-256-CBC decrypt with PKCS#7 padding.
///
/// Bad padding is reported as a generic crypto failure; callers that need
/// MAC-then-decrypt semantics verify the MAC first, so a padding error here
/// only ever means corrupt input.
pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let dec = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| Error::InvalidKey("bad AES key or IV length".into()))?;
    dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::Crypto("CBC padding check failed".into()))
}

/// Constant-time comparison of byte slices.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Verify that `tag` equals the first `tag.len()` bytes of
/// HMAC-SHA256(key, data), in constant time.
pub fn verify_trunc_mac(key: &[u8], data: &[u8], tag: &[u8]) -> Result<bool> {
    let full = hmac_sha256(key, data)?;
    if tag.is_empty() || tag.len() > full.len() {
        return Ok(false);
    }
    Ok(constant_time_eq(&full[..tag.len()], tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbc_roundtrip() {
        let key = [0x11u8; 32];
        let iv = [0x22u8; 16];
        for len in [0usize, 1, 15, 16, 17, 255, 4096] {
            let pt: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let ct = aes_cbc_encrypt(&key, &iv, &pt).unwrap();
            assert_eq!(ct.len() % 16, 0);
            assert!(ct.len() > pt.len() || pt.is_empty());
            let back = aes_cbc_decrypt(&key, &iv, &ct).unwrap();
            assert_eq!(back, pt);
        }
    }

    #[test]
    fn cbc_rejects_bad_lengths() {
        assert!(aes_cbc_encrypt(&[0u8; 16], &[0u8; 16], b"x").is_err());
        assert!(aes_cbc_encrypt(&[0u8; 32], &[0u8; 8], b"x").is_err());
        assert!(aes_cbc_decrypt(&[0u8; 32], &[0u8; 16], &[0u8; 15]).is_err());
    }

    #[test]
    fn cbc_wrong_key_fails_padding_or_differs() {
        let ct = aes_cbc_encrypt(&[0x11u8; 32], &[0u8; 16], b"some message").unwrap();
        match aes_cbc_decrypt(&[0x12u8; 32], &[0u8; 16], &ct) {
            Ok(pt) => assert_ne!(pt, b"some message"),
            Err(_) => {}
        }
    }

    #[test]
    fn trunc_mac_verifies() {
        let key = [7u8; 20];
        let data = b"payload";
        let full = hmac_sha256(&key, data).unwrap();
        assert!(verify_trunc_mac(&key, data, &full[..10]).unwrap());
        let mut bad = full[..10].to_vec();
        bad[3] ^= 1;
        assert!(!verify_trunc_mac(&key, data, &bad).unwrap());
        assert!(!verify_trunc_mac(&key, data, &[]).unwrap());
    }

    #[test]
    fn hkdf_expands() {
        let mut okm = [0u8; 64];
        hkdf_sha256(Some(&[1u8; 32]), &[2u8; 32], b"info", &mut okm).unwrap();
        assert_ne!(okm, [0u8; 64]);
        let mut okm2 = [0u8; 64];
        hkdf_sha256(Some(&[1u8; 32]), &[2u8; 32], b"other", &mut okm2).unwrap();
        assert_ne!(okm, okm2);
    }
}
