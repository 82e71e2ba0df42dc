//! Client configuration
//!
//! Loaded from `<root>/.config/config.yml`. The server URL must be
//! `https://` and the fingerprint must be the hex SHA-256 of the server
//! certificate's SubjectPublicKeyInfo; both are validated eagerly so a
//! bad config fails at startup instead of on the first dial.

use serde::Deserialize;
use std::path::Path;

use crate::error::{Error, Result};

fn default_verification_type() -> String {
    "sms".to_string()
}

/// Application configuration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Account phone number in E.164 form
    pub tel: String,
    /// Service base URL, `https://host[:port]`
    pub server: String,
    /// Hex SHA-256 of the server certificate's SubjectPublicKeyInfo DER
    pub fingerprint: String,
    /// Bypass CA chain verification (the pin is still enforced)
    #[serde(default, rename = "skipTLSCheck")]
    pub skip_tls_check: bool,
    /// `sms` (default) or `voice`
    #[serde(default = "default_verification_type")]
    pub verification_type: String,
    /// Store keys and sessions in plaintext; development only
    #[serde(default)]
    pub unencrypted_storage: bool,
    /// Storage password; when unset the password provider is asked
    #[serde(default)]
    pub storage_password: Option<String>,
}

impl Config {
    /// Parse and validate a YAML config document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read the config file under `root`.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(".config").join("config.yml");
        let text = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    /// The configured fingerprint as raw bytes.
    pub fn fingerprint_bytes(&self) -> Result<[u8; 32]> {
        let decoded =
            hex::decode(&self.fingerprint).map_err(|e| Error::Config(e.to_string()))?;
        decoded
            .try_into()
            .map_err(|_| Error::Config("fingerprint must be 32 hex-encoded bytes".into()))
    }

    fn validate(&self) -> Result<()> {
        if self.tel.is_empty() {
            return Err(Error::Config("tel must be set".into()));
        }
        if !self.server.starts_with("https://") {
            return Err(Error::Config(format!(
                "server must be an https:// URL, got {}",
                self.server
            )));
        }
        self.fingerprint_bytes()?;
        match self.verification_type.as_str() {
            "sms" | "voice" => Ok(()),
            other => Err(Error::Config(format!(
                "verificationType must be sms or voice, got {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FP: &str = "0000000000000000000000000000000000000000000000000000000000000000";

    #[test]
    fn parses_minimal_config() {
        let yaml = format!(
            "tel: \"+15551234567\"\nserver: https://example.org:4433\nfingerprint: {FP}\n"
        );
        let config = Config::from_yaml(&yaml).unwrap();
        assert_eq!(config.tel, "+15551234567");
        assert_eq!(config.verification_type, "sms");
        assert!(!config.skip_tls_check);
        assert!(!config.unencrypted_storage);
        assert!(config.storage_password.is_none());
    }

    #[test]
    fn parses_all_fields() {
        let yaml = format!(
            "tel: \"+15551234567\"\n\
             server: https://example.org\n\
             fingerprint: {FP}\n\
             skipTLSCheck: true\n\
             verificationType: voice\n\
             unencryptedStorage: true\n\
             storagePassword: hunter2\n"
        );
        let config = Config::from_yaml(&yaml).unwrap();
        assert!(config.skip_tls_check);
        assert_eq!(config.verification_type, "voice");
        assert!(config.unencrypted_storage);
        assert_eq!(config.storage_password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn rejects_plain_http() {
        let yaml = format!("tel: \"+1\"\nserver: http://example.org\nfingerprint: {FP}\n");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn rejects_short_fingerprint() {
        let yaml = "tel: \"+1\"\nserver: https://example.org\nfingerprint: abcd\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn rejects_unknown_verification_type() {
        let yaml =
            format!("tel: \"+1\"\nserver: https://e.org\nfingerprint: {FP}\nverificationType: fax\n");
        assert!(Config::from_yaml(&yaml).is_err());
    }
}
