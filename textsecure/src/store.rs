//! Persistent key-value store rooted at `<root>/.storage/`.
//!
//! Layout:
//!
//! ```text
//! .storage/
//!   identity/identity_key        device identity private scalar
//!   identity/regid               local registration id
//!   identity/remote_<peer>       trusted peer identity (TOFU)
//!   prekeys/<id>                 one-time pre-key records
//!   prekeys/counter              next pre-key id to hand out
//!   signed_prekey                the current signed pre-key record
//!   sessions/<peer>/<device>     ratchet session records
//!   http/password                HTTP basic-auth password
//!   http/signaling_key           52-byte envelope key material
//!   groups/<hex id>              local group records
//! ```
//!
//! Unless `unencryptedStorage` is set, every value is wrapped as
//! `iv(16) || AES-256-CBC(k_enc, value) || HMAC-SHA256(k_mac, iv||ct)`
//! with `(k_enc, k_mac)` derived from the storage password by HKDF.

use std::fs;
use std::path::{Path, PathBuf};

use x25519_dalek::PublicKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

use axolotl::crypto::{
    aes_cbc_decrypt, aes_cbc_encrypt, constant_time_eq, hkdf_sha256, hmac_sha256, random_bytes,
};
use axolotl::keys::{decode_point, encode_point};
use axolotl::store::{Address, IdentityStore, PreKeyStore, SessionStore, SignedPreKeyStore};
use axolotl::{IdentityKeyPair, PreKeyRecord, SessionState, SignedPreKeyRecord};

use crate::error::{Error, Result};

const STORAGE_KEY_INFO: &[u8] = b"TextSecure Storage Keys";
const WRAP_OVERHEAD: usize = 16 + 32;

/// Length of the signaling key: 32 bytes AES + 20 bytes MAC.
pub const SIGNALING_KEY_LEN: usize = 52;

#[derive(ZeroizeOnDrop)]
struct StorageKeys {
    enc: [u8; 32],
    mac: [u8; 32],
}

impl StorageKeys {
    fn derive(password: &str) -> Result<Self> {
        let mut okm = [0u8; 64];
        hkdf_sha256(None, password.as_bytes(), STORAGE_KEY_INFO, &mut okm)
            .map_err(|e| Error::Store(e.to_string()))?;
        let mut enc = [0u8; 32];
        let mut mac = [0u8; 32];
        enc.copy_from_slice(&okm[..32]);
        mac.copy_from_slice(&okm[32..]);
        okm.zeroize();
        Ok(StorageKeys { enc, mac })
    }
}

/// File-backed store for identity, registration secrets, pre-keys and
/// sessions. One instance owns the directory; the [`crate::Context`]
/// serializes access behind a single lock.
pub struct FileStore {
    root: PathBuf,
    keys: Option<StorageKeys>,
}

impl FileStore {
    /// Open (creating directories as needed) the store under
    /// `<root>/.storage/`. `password` of `None` selects plaintext
    /// storage.
    pub fn open(root_dir: &Path, password: Option<&str>) -> Result<Self> {
        let root = root_dir.join(".storage");
        for sub in ["identity", "prekeys", "sessions", "http", "groups"] {
            fs::create_dir_all(root.join(sub)).map_err(|e| Error::Store(e.to_string()))?;
        }
        let keys = password.map(StorageKeys::derive).transpose()?;
        Ok(FileStore { root, keys })
    }

    /// Whether the store already holds a usable identity: the file exists
    /// and decrypts cleanly under the configured password.
    pub fn valid(&self) -> bool {
        self.path(&["identity", "identity_key"]).exists()
            && self.read_identity_key_pair().is_ok()
    }

    fn path(&self, parts: &[&str]) -> PathBuf {
        let mut p = self.root.clone();
        for part in parts {
            p = p.join(part);
        }
        p
    }

    fn seal(&self, value: &[u8]) -> Result<Vec<u8>> {
        match &self.keys {
            None => Ok(value.to_vec()),
            Some(keys) => {
                let mut iv = [0u8; 16];
                random_bytes(&mut iv);
                let ciphertext = aes_cbc_encrypt(&keys.enc, &iv, value)
                    .map_err(|e| Error::Store(e.to_string()))?;
                let mut out = Vec::with_capacity(WRAP_OVERHEAD + ciphertext.len());
                out.extend_from_slice(&iv);
                out.extend_from_slice(&ciphertext);
                let tag =
                    hmac_sha256(&keys.mac, &out).map_err(|e| Error::Store(e.to_string()))?;
                out.extend_from_slice(&tag);
                Ok(out)
            }
        }
    }

    fn unseal(&self, raw: &[u8]) -> Result<Vec<u8>> {
        match &self.keys {
            None => Ok(raw.to_vec()),
            Some(keys) => {
                if raw.len() < WRAP_OVERHEAD {
                    return Err(Error::Store("stored value too short".into()));
                }
                let (body, tag) = raw.split_at(raw.len() - 32);
                let expected =
                    hmac_sha256(&keys.mac, body).map_err(|e| Error::Store(e.to_string()))?;
                if !constant_time_eq(&expected, tag) {
                    return Err(Error::Store(
                        "stored value MAC mismatch (wrong password?)".into(),
                    ));
                }
                let (iv, ciphertext) = body.split_at(16);
                aes_cbc_decrypt(&keys.enc, iv, ciphertext)
                    .map_err(|e| Error::Store(e.to_string()))
            }
        }
    }

    fn write_value(&self, parts: &[&str], value: &[u8]) -> Result<()> {
        let path = self.path(parts);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::Store(e.to_string()))?;
        }
        let sealed = self.seal(value)?;
        fs::write(&path, sealed)
            .map_err(|e| Error::Store(format!("{}: {e}", path.display())))
    }

    fn read_value(&self, parts: &[&str]) -> Result<Option<Vec<u8>>> {
        let path = self.path(parts);
        match fs::read(&path) {
            Ok(raw) => Ok(Some(self.unseal(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Store(format!("{}: {e}", path.display()))),
        }
    }

    fn remove_value(&self, parts: &[&str]) -> Result<()> {
        let path = self.path(parts);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Store(format!("{}: {e}", path.display()))),
        }
    }

    // ─── identity & registration secrets ───────────────────────────────

    /// Write the identity key pair. The identity is created exactly once
    /// per install; overwriting an existing one is refused.
    pub fn set_identity_key_pair(&self, identity: &IdentityKeyPair) -> Result<()> {
        if self.path(&["identity", "identity_key"]).exists() {
            return Err(Error::Store(
                "identity key already exists and is never rotated".into(),
            ));
        }
        self.write_value(&["identity", "identity_key"], &identity.private_bytes())
    }

    fn read_identity_key_pair(&self) -> Result<IdentityKeyPair> {
        let raw = self
            .read_value(&["identity", "identity_key"])?
            .ok_or_else(|| Error::Store("no identity key".into()))?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| Error::Store("identity key has wrong length".into()))?;
        Ok(IdentityKeyPair::from_private_bytes(bytes))
    }

    /// Persist the local registration id.
    pub fn set_local_registration_id(&self, id: u32) -> Result<()> {
        self.write_value(&["identity", "regid"], id.to_string().as_bytes())
    }

    /// Persist the HTTP basic-auth password.
    pub fn store_http_password(&self, password: &str) -> Result<()> {
        self.write_value(&["http", "password"], password.as_bytes())
    }

    /// Load the HTTP basic-auth password.
    pub fn load_http_password(&self) -> Result<String> {
        let raw = self
            .read_value(&["http", "password"])?
            .ok_or_else(|| Error::Store("no http password".into()))?;
        String::from_utf8(raw).map_err(|_| Error::Store("http password is not UTF-8".into()))
    }

    /// Persist the 52-byte signaling key.
    pub fn store_signaling_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != SIGNALING_KEY_LEN {
            return Err(Error::Store(format!(
                "signaling key length {} (want {SIGNALING_KEY_LEN})",
                key.len()
            )));
        }
        self.write_value(&["http", "signaling_key"], key)
    }

    /// Load the signaling key, validating its length.
    pub fn load_signaling_key(&self) -> Result<Vec<u8>> {
        let raw = self
            .read_value(&["http", "signaling_key"])?
            .ok_or_else(|| Error::Store("no signaling key".into()))?;
        if raw.len() != SIGNALING_KEY_LEN {
            return Err(Error::Store(format!(
                "signaling key length {} (want {SIGNALING_KEY_LEN})",
                raw.len()
            )));
        }
        Ok(raw)
    }

    // ─── pre-key id allocation ─────────────────────────────────────────

    /// Allocate `count` monotonically increasing pre-key ids.
    ///
    /// Ids start at 1; id 0 is the "no pre-key" convention on the wire.
    pub fn allocate_pre_key_ids(&self, count: u32) -> Result<Vec<u32>> {
        let next = match self.read_value(&["prekeys", "counter"])? {
            Some(raw) => String::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .ok_or_else(|| Error::Store("corrupt pre-key counter".into()))?,
            None => 1,
        };
        let ids: Vec<u32> = (next..next + count).collect();
        self.write_value(&["prekeys", "counter"], (next + count).to_string().as_bytes())?;
        Ok(ids)
    }

    // ─── groups ────────────────────────────────────────────────────────

    /// Persist a serialized group record under its hex id.
    pub fn store_group(&self, hex_id: &str, record: &[u8]) -> Result<()> {
        self.write_value(&["groups", hex_id], record)
    }

    /// Load a serialized group record.
    pub fn load_group(&self, hex_id: &str) -> Result<Option<Vec<u8>>> {
        self.read_value(&["groups", hex_id])
    }

    /// Remove a group record.
    pub fn remove_group(&self, hex_id: &str) -> Result<()> {
        self.remove_value(&["groups", hex_id])
    }

    /// All stored group records.
    pub fn groups(&self) -> Result<Vec<Vec<u8>>> {
        let dir = self.path(&["groups"]);
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| Error::Store(e.to_string()))? {
            let entry = entry.map_err(|e| Error::Store(e.to_string()))?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(record) = self.read_value(&["groups", name])? {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

    /// Forget a peer's recorded identity; the operator's path out of
    /// an `UntrustedIdentity` failure.
    pub fn forget_identity(&self, recipient: &str) -> Result<()> {
        self.remove_value(&["identity", &format!("remote_{recipient}")])
    }

    /// Devices of `recipient` we hold sessions for.
    pub fn session_devices(&self, recipient: &str) -> Result<Vec<u32>> {
        let dir = self.path(&["sessions", recipient]);
        let mut devices = Vec::new();
        match fs::read_dir(&dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry.map_err(|e| Error::Store(e.to_string()))?;
                    if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                        devices.push(id);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Store(e.to_string())),
        }
        devices.sort_unstable();
        Ok(devices)
    }

    /// The current signed pre-key, whatever its id.
    pub fn current_signed_pre_key(&self) -> Result<Option<SignedPreKeyRecord>> {
        self.read_value(&["signed_prekey"])?
            .map(|raw| {
                SignedPreKeyRecord::from_bytes(&raw).map_err(|e| Error::Store(e.to_string()))
            })
            .transpose()
    }
}

impl IdentityStore for FileStore {
    fn identity_key_pair(&self) -> axolotl::Result<IdentityKeyPair> {
        self.read_identity_key_pair()
            .map_err(|e| axolotl::Error::Store(e.to_string()))
    }

    fn local_registration_id(&self) -> axolotl::Result<u32> {
        let raw = self
            .read_value(&["identity", "regid"])
            .map_err(|e| axolotl::Error::Store(e.to_string()))?
            .ok_or_else(|| axolotl::Error::Store("no registration id".into()))?;
        String::from_utf8(raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| axolotl::Error::Store("corrupt registration id".into()))
    }

    fn is_trusted_identity(&self, recipient: &str, identity: &PublicKey) -> axolotl::Result<bool> {
        match self
            .read_value(&["identity", &format!("remote_{recipient}")])
            .map_err(|e| axolotl::Error::Store(e.to_string()))?
        {
            Some(known) => {
                let known = decode_point(&known)?;
                Ok(constant_time_eq(known.as_bytes(), identity.as_bytes()))
            }
            None => Ok(true),
        }
    }

    fn save_identity(&mut self, recipient: &str, identity: &PublicKey) -> axolotl::Result<()> {
        self.write_value(
            &["identity", &format!("remote_{recipient}")],
            &encode_point(identity),
        )
        .map_err(|e| axolotl::Error::Store(e.to_string()))
    }

    fn remote_identity(&self, recipient: &str) -> axolotl::Result<Option<PublicKey>> {
        self.read_value(&["identity", &format!("remote_{recipient}")])
            .map_err(|e| axolotl::Error::Store(e.to_string()))?
            .map(|raw| decode_point(&raw))
            .transpose()
    }
}

impl PreKeyStore for FileStore {
    fn load_pre_key(&self, id: u32) -> axolotl::Result<Option<PreKeyRecord>> {
        self.read_value(&["prekeys", &id.to_string()])
            .map_err(|e| axolotl::Error::Store(e.to_string()))?
            .map(|raw| PreKeyRecord::from_bytes(&raw))
            .transpose()
    }

    fn store_pre_key(&mut self, record: &PreKeyRecord) -> axolotl::Result<()> {
        let bytes = record.to_bytes()?;
        self.write_value(&["prekeys", &record.id.to_string()], &bytes)
            .map_err(|e| axolotl::Error::Store(e.to_string()))
    }

    fn remove_pre_key(&mut self, id: u32) -> axolotl::Result<()> {
        if id == 0 {
            return Ok(());
        }
        self.remove_value(&["prekeys", &id.to_string()])
            .map_err(|e| axolotl::Error::Store(e.to_string()))
    }

    fn pre_key_ids(&self) -> axolotl::Result<Vec<u32>> {
        let dir = self.path(&["prekeys"]);
        let mut ids = Vec::new();
        let entries =
            fs::read_dir(&dir).map_err(|e| axolotl::Error::Store(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| axolotl::Error::Store(e.to_string()))?;
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

impl SignedPreKeyStore for FileStore {
    fn load_signed_pre_key(&self, id: u32) -> axolotl::Result<Option<SignedPreKeyRecord>> {
        let raw = self
            .read_value(&["signed_prekey"])
            .map_err(|e| axolotl::Error::Store(e.to_string()))?;
        match raw {
            Some(raw) => {
                let record = SignedPreKeyRecord::from_bytes(&raw)?;
                Ok((record.id == id).then_some(record))
            }
            None => Ok(None),
        }
    }

    fn store_signed_pre_key(&mut self, record: &SignedPreKeyRecord) -> axolotl::Result<()> {
        let bytes = record.to_bytes()?;
        self.write_value(&["signed_prekey"], &bytes)
            .map_err(|e| axolotl::Error::Store(e.to_string()))
    }
}

impl SessionStore for FileStore {
    fn load_session(&self, address: &Address) -> axolotl::Result<Option<SessionState>> {
        self.read_value(&["sessions", &address.recipient, &address.device_id.to_string()])
            .map_err(|e| axolotl::Error::Store(e.to_string()))?
            .map(|raw| SessionState::from_bytes(&raw))
            .transpose()
    }

    fn store_session(&mut self, address: &Address, state: &SessionState) -> axolotl::Result<()> {
        let bytes = state.to_bytes()?;
        self.write_value(
            &["sessions", &address.recipient, &address.device_id.to_string()],
            &bytes,
        )
        .map_err(|e| axolotl::Error::Store(e.to_string()))
    }

    fn contains_session(&self, address: &Address) -> axolotl::Result<bool> {
        Ok(self
            .path(&["sessions", &address.recipient, &address.device_id.to_string()])
            .exists())
    }

    fn delete_session(&mut self, address: &Address) -> axolotl::Result<()> {
        self.remove_value(&["sessions", &address.recipient, &address.device_id.to_string()])
            .map_err(|e| axolotl::Error::Store(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "ts-store-{tag}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn plaintext_roundtrip() {
        let root = tmp_root("plain");
        let store = FileStore::open(&root, None).unwrap();
        assert!(!store.valid());

        let identity = IdentityKeyPair::generate();
        store.set_identity_key_pair(&identity).unwrap();
        assert!(store.valid());

        let loaded = store.read_identity_key_pair().unwrap();
        assert_eq!(loaded.public().as_bytes(), identity.public().as_bytes());
    }

    #[test]
    fn identity_is_written_exactly_once() {
        let root = tmp_root("once");
        let store = FileStore::open(&root, None).unwrap();
        store.set_identity_key_pair(&IdentityKeyPair::generate()).unwrap();
        assert!(store
            .set_identity_key_pair(&IdentityKeyPair::generate())
            .is_err());
    }

    #[test]
    fn encrypted_values_need_the_password() {
        let root = tmp_root("enc");
        let identity = IdentityKeyPair::generate();
        {
            let store = FileStore::open(&root, Some("correct horse")).unwrap();
            store.set_identity_key_pair(&identity).unwrap();
            store.store_http_password("basicpass").unwrap();
            assert!(store.valid());
            assert_eq!(store.load_http_password().unwrap(), "basicpass");
        }

        // Wrong password: MAC rejects, valid() is false.
        let wrong = FileStore::open(&root, Some("battery staple")).unwrap();
        assert!(!wrong.valid());
        assert!(wrong.load_http_password().is_err());

        // Correct password again: byte-identical value.
        let again = FileStore::open(&root, Some("correct horse")).unwrap();
        assert!(again.valid());
        assert_eq!(again.load_http_password().unwrap(), "basicpass");
        assert_eq!(
            again.read_identity_key_pair().unwrap().private_bytes(),
            identity.private_bytes()
        );
    }

    #[test]
    fn signaling_key_length_is_enforced() {
        let root = tmp_root("sig");
        let store = FileStore::open(&root, None).unwrap();
        assert!(store.store_signaling_key(&[0u8; 51]).is_err());
        store.store_signaling_key(&[7u8; 52]).unwrap();
        assert_eq!(store.load_signaling_key().unwrap(), vec![7u8; 52]);

        // A truncated on-disk key is rejected at load.
        fs::write(root.join(".storage/http/signaling_key"), [1u8; 20]).unwrap();
        assert!(store.load_signaling_key().is_err());
    }

    #[test]
    fn pre_key_ids_are_monotonic() {
        let root = tmp_root("ids");
        let store = FileStore::open(&root, None).unwrap();
        let first = store.allocate_pre_key_ids(100).unwrap();
        assert_eq!(first[0], 1);
        assert_eq!(first.len(), 100);
        let second = store.allocate_pre_key_ids(10).unwrap();
        assert_eq!(second[0], first[99] + 1);
    }

    #[test]
    fn trusted_identity_tofu() {
        let root = tmp_root("tofu");
        let mut store = FileStore::open(&root, None).unwrap();
        let k1 = IdentityKeyPair::generate();
        let k2 = IdentityKeyPair::generate();

        assert!(store.is_trusted_identity("peer", k1.public()).unwrap());
        store.save_identity("peer", k1.public()).unwrap();
        assert!(store.is_trusted_identity("peer", k1.public()).unwrap());
        assert!(!store.is_trusted_identity("peer", k2.public()).unwrap());

        store.forget_identity("peer").unwrap();
        assert!(store.is_trusted_identity("peer", k2.public()).unwrap());
    }

    #[test]
    fn session_files_per_device() {
        let root = tmp_root("sess");
        let store = FileStore::open(&root, None).unwrap();
        let a1 = Address::new("15551110000", 1);
        assert!(!store.contains_session(&a1).unwrap());
        assert!(store.load_session(&a1).unwrap().is_none());
    }
}
