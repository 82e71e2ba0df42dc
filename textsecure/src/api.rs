//! REST surface of the central service.
//!
//! All registration endpoints speak JSON; message bodies are the base64
//! of session-layer wire bytes. Device-list mismatches (409/410) are
//! reported to the send layer, which owns the session store and performs
//! the documented sync-and-retry.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::info;

use axolotl::keys::decode_point;
use axolotl::x3dh::PreKeyBundle;
use axolotl::{IdentityKeyPair, PreKeyRecord, SignedPreKeyRecord};

use crate::error::{Error, Result};
use crate::transport::{url_encode, HttpTransport};

/// Pre-keys kept registered with the service; a fresh batch is uploaded
/// when the server-side count drops below [`PRE_KEY_LOW_WATER`].
pub const PRE_KEY_BATCH_SIZE: u32 = 100;

/// Server-side pre-key count that triggers replenishment.
pub const PRE_KEY_LOW_WATER: u32 = 10;

/// The id the last-resort key is registered under.
pub const LAST_RESORT_KEY_ID: u32 = 0xFFFFFF;

/// Base64 without trailing padding, as the service encodes keys.
pub fn base64_nopad(bytes: &[u8]) -> String {
    STANDARD_NO_PAD.encode(bytes)
}

/// Decode base64 with or without padding.
pub fn base64_decode(s: &str) -> Result<Vec<u8>> {
    STANDARD_NO_PAD
        .decode(s.trim_end_matches('='))
        .map_err(|e| Error::Codec(e.to_string()))
}

/// Generate the 22-character HTTP basic-auth password.
pub fn generate_password() -> String {
    let mut raw = [0u8; 16];
    axolotl::crypto::random_bytes(&mut raw);
    base64_nopad(&raw)
}

/// Directory token: base64-no-pad of the first 10 bytes of SHA-1(tel).
pub fn contact_token(tel: &str) -> String {
    let digest = Sha1::digest(tel.as_bytes());
    base64_nopad(&digest[..10])
}

// ─── JSON payloads ──────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyCodePayload {
    signaling_key: String,
    supports_sms: bool,
    fetches_messages: bool,
    registration_id: u32,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreKeyEntity {
    key_id: u32,
    public_key: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedPreKeyEntity {
    key_id: u32,
    public_key: String,
    signature: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterKeysPayload {
    identity_key: String,
    pre_keys: Vec<PreKeyEntity>,
    last_resort_key: PreKeyEntity,
    signed_pre_key: SignedPreKeyEntity,
}

#[derive(Deserialize)]
struct PreKeyCountResponse {
    count: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BundleDevice {
    device_id: u32,
    registration_id: u32,
    signed_pre_key: SignedPreKeyEntity,
    pre_key: Option<PreKeyEntity>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BundleResponse {
    identity_key: String,
    devices: Vec<BundleDevice>,
}

/// One per-device sealed message inside a send request.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingEnvelope {
    /// Envelope type: CIPHERTEXT or PREKEY_BUNDLE
    #[serde(rename = "type")]
    pub message_type: u32,
    /// Target device
    pub destination_device_id: u32,
    /// Registration id the session was built against
    pub destination_registration_id: u32,
    /// Base64 of the session wire bytes
    pub body: String,
    /// Sender timestamp, milliseconds
    pub timestamp: u64,
}

#[derive(Serialize)]
struct SendPayload<'a> {
    messages: &'a [OutgoingEnvelope],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MismatchedDevicesResponse {
    #[serde(default)]
    missing_devices: Vec<u32>,
    #[serde(default)]
    extra_devices: Vec<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StaleDevicesResponse {
    #[serde(default)]
    stale_devices: Vec<u32>,
}

#[derive(Deserialize)]
struct AttachmentAllocation {
    id: u64,
    location: String,
}

#[derive(Serialize)]
struct DirectoryPayload<'a> {
    contacts: &'a [String],
}

#[derive(Deserialize)]
struct DirectoryEntry {
    token: String,
}

#[derive(Deserialize)]
struct DirectoryResponse {
    contacts: Vec<DirectoryEntry>,
}

/// Outcome of a send attempt, for the caller's device-sync logic.
#[derive(Debug)]
pub enum SendOutcome {
    /// Accepted by the service
    Ok,
    /// 409: the device list diverged; sync and retry once
    Mismatched {
        /// Devices we must establish sessions with
        missing: Vec<u32>,
        /// Devices we must stop sending to
        extra: Vec<u32>,
    },
    /// 410: listed sessions are stale; drop them and retry once
    Stale {
        /// Devices whose sessions must be discarded
        stale: Vec<u32>,
    },
}

// ─── the service client ─────────────────────────────────────────────────

/// Typed access to the service endpoints over the pinned transport.
pub struct Service {
    transport: HttpTransport,
}

impl Service {
    /// Wrap a transport.
    pub fn new(transport: HttpTransport) -> Self {
        Service { transport }
    }

    /// The underlying transport, for the websocket dialer and blobs.
    pub fn transport(&self) -> &HttpTransport {
        &self.transport
    }

    /// Ask the service to deliver a verification code by SMS or voice.
    pub async fn request_code(&self, tel: &str, verification_type: &str) -> Result<()> {
        let path = format!("/v1/accounts/{verification_type}/code/{}", url_encode(tel));
        let response = self.transport.get(&path).await?;
        if response.is_error() {
            return Err(Error::ServerStatus(response.status));
        }
        Ok(())
    }

    /// Submit the verification code together with our registration state.
    pub async fn verify_code(
        &self,
        code: &str,
        signaling_key: &[u8],
        registration_id: u32,
    ) -> Result<()> {
        let payload = VerifyCodePayload {
            signaling_key: STANDARD.encode(signaling_key),
            supports_sms: false,
            fetches_messages: true,
            registration_id,
        };
        let body = serde_json::to_vec(&payload)?;
        let path = format!("/v1/accounts/code/{code}");
        let response = self.transport.put_json(&path, &body).await?;
        if response.is_error() {
            return Err(Error::ServerStatus(response.status));
        }
        Ok(())
    }

    /// Upload the identity key, the signed pre-key and a pre-key batch.
    pub async fn register_keys(
        &self,
        identity: &IdentityKeyPair,
        signed_pre_key: &SignedPreKeyRecord,
        pre_keys: &[PreKeyRecord],
        last_resort: &PreKeyRecord,
    ) -> Result<()> {
        let payload = RegisterKeysPayload {
            identity_key: base64_nopad(&identity.public_serialized()),
            pre_keys: pre_keys
                .iter()
                .map(|record| PreKeyEntity {
                    key_id: record.id,
                    public_key: base64_nopad(&record.key_pair.public_serialized()),
                })
                .collect(),
            last_resort_key: PreKeyEntity {
                key_id: last_resort.id,
                public_key: base64_nopad(&last_resort.key_pair.public_serialized()),
            },
            signed_pre_key: SignedPreKeyEntity {
                key_id: signed_pre_key.id,
                public_key: base64_nopad(&signed_pre_key.key_pair.public_serialized()),
                signature: base64_nopad(&signed_pre_key.signature),
            },
        };
        let body = serde_json::to_vec(&payload)?;
        let response = self.transport.put_json("/v2/keys", &body).await?;
        if response.is_error() {
            return Err(Error::ServerStatus(response.status));
        }
        info!("registered {} pre-keys", pre_keys.len());
        Ok(())
    }

    /// How many one-time pre-keys the service still holds for us.
    pub async fn pre_key_count(&self) -> Result<u32> {
        let response = self.transport.get("/v2/keys").await?;
        if response.is_error() {
            return Err(Error::ServerStatus(response.status));
        }
        let parsed: PreKeyCountResponse = response.json()?;
        Ok(parsed.count)
    }

    /// Fetch pre-key bundles for every device of `tel`.
    pub async fn pre_key_bundles(&self, tel: &str) -> Result<Vec<PreKeyBundle>> {
        self.pre_key_bundles_for_device(tel, "*").await
    }

    /// Fetch pre-key bundles for one device (or `*` for all).
    pub async fn pre_key_bundles_for_device(
        &self,
        tel: &str,
        device: &str,
    ) -> Result<Vec<PreKeyBundle>> {
        let path = format!("/v2/keys/{}/{device}", url_encode(tel));
        let response = self.transport.get(&path).await?;
        if response.is_error() {
            return Err(Error::ServerStatus(response.status));
        }
        let parsed: BundleResponse = response.json()?;
        let identity_key = decode_point(&base64_decode(&parsed.identity_key)?)
            .map_err(Error::Protocol)?;

        let mut bundles = Vec::with_capacity(parsed.devices.len());
        for device in parsed.devices {
            let signed_pre_key =
                decode_point(&base64_decode(&device.signed_pre_key.public_key)?)
                    .map_err(Error::Protocol)?;
            let (pre_key_id, pre_key) = match device.pre_key {
                Some(entity) => (
                    Some(entity.key_id),
                    Some(
                        decode_point(&base64_decode(&entity.public_key)?)
                            .map_err(Error::Protocol)?,
                    ),
                ),
                None => (None, None),
            };
            bundles.push(PreKeyBundle {
                registration_id: device.registration_id,
                device_id: device.device_id,
                pre_key_id,
                pre_key,
                signed_pre_key_id: device.signed_pre_key.key_id,
                signed_pre_key,
                signed_pre_key_signature: base64_decode(&device.signed_pre_key.signature)?,
                identity_key,
            });
        }
        Ok(bundles)
    }

    /// PUT the per-device envelopes for one recipient.
    pub async fn send_messages(
        &self,
        tel: &str,
        envelopes: &[OutgoingEnvelope],
    ) -> Result<SendOutcome> {
        let body = serde_json::to_vec(&SendPayload { messages: envelopes })?;
        let path = format!("/v1/messages/{}", url_encode(tel));
        let response = self.transport.put_json(&path, &body).await?;
        match response.status {
            status if (200..300).contains(&status) => Ok(SendOutcome::Ok),
            409 => {
                let parsed: MismatchedDevicesResponse = response.json()?;
                Ok(SendOutcome::Mismatched {
                    missing: parsed.missing_devices,
                    extra: parsed.extra_devices,
                })
            }
            410 => {
                let parsed: StaleDevicesResponse = response.json()?;
                Ok(SendOutcome::Stale {
                    stale: parsed.stale_devices,
                })
            }
            status => Err(Error::ServerStatus(status)),
        }
    }

    /// Allocate an attachment slot, upload the sealed blob, return the id.
    pub async fn upload_attachment(&self, sealed: &[u8]) -> Result<u64> {
        let response = self.transport.get("/v1/attachments/").await?;
        if response.is_error() {
            return Err(Error::ServerStatus(response.status));
        }
        let allocation: AttachmentAllocation = response.json()?;
        let put = self
            .transport
            .put_absolute(&allocation.location, sealed)
            .await?;
        if put.is_error() {
            return Err(Error::ServerStatus(put.status));
        }
        Ok(allocation.id)
    }

    /// Which of the given contact tokens are registered.
    pub async fn registered_tokens(&self, tokens: &[String]) -> Result<Vec<String>> {
        let body = serde_json::to_vec(&DirectoryPayload { contacts: tokens })?;
        let response = self.transport.put_json("/v1/directory/tokens", &body).await?;
        if response.is_error() {
            return Err(Error::ServerStatus(response.status));
        }
        let parsed: DirectoryResponse = response.json()?;
        Ok(parsed.contacts.into_iter().map(|c| c.token).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_22_chars_nopad() {
        let password = generate_password();
        assert_eq!(password.len(), 22);
        assert!(!password.contains('='));
        assert_eq!(base64_decode(&password).unwrap().len(), 16);
    }

    #[test]
    fn base64_decode_accepts_both_paddings() {
        assert_eq!(base64_decode("aGk=").unwrap(), b"hi");
        assert_eq!(base64_decode("aGk").unwrap(), b"hi");
    }

    #[test]
    fn contact_tokens_are_stable_and_short() {
        let token = contact_token("+15551234567");
        assert_eq!(token, contact_token("+15551234567"));
        assert_ne!(token, contact_token("+15551234568"));
        assert_eq!(base64_decode(&token).unwrap().len(), 10);
    }

    #[test]
    fn verify_payload_shape() {
        let payload = VerifyCodePayload {
            signaling_key: "AAAA".into(),
            supports_sms: false,
            fetches_messages: true,
            registration_id: 1234,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["signalingKey"], "AAAA");
        assert_eq!(json["supportsSms"], false);
        assert_eq!(json["fetchesMessages"], true);
        assert_eq!(json["registrationId"], 1234);
    }

    #[test]
    fn outgoing_envelope_shape() {
        let envelope = OutgoingEnvelope {
            message_type: 3,
            destination_device_id: 1,
            destination_registration_id: 77,
            body: "Zm9v".into(),
            timestamp: 1000,
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], 3);
        assert_eq!(json["destinationDeviceId"], 1);
        assert_eq!(json["destinationRegistrationId"], 77);
        assert_eq!(json["body"], "Zm9v");
    }

    #[test]
    fn mismatch_responses_parse() {
        let mismatched: MismatchedDevicesResponse =
            serde_json::from_str(r#"{"missingDevices":[2,3],"extraDevices":[5]}"#).unwrap();
        assert_eq!(mismatched.missing_devices, vec![2, 3]);
        assert_eq!(mismatched.extra_devices, vec![5]);

        let stale: StaleDevicesResponse =
            serde_json::from_str(r#"{"staleDevices":[1]}"#).unwrap();
        assert_eq!(stale.stale_devices, vec![1]);

        let empty: MismatchedDevicesResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.missing_devices.is_empty());
    }

    #[test]
    fn bundle_response_parses() {
        let identity = IdentityKeyPair::generate();
        let spk = SignedPreKeyRecord::generate(11, &identity);
        let raw = serde_json::json!({
            "identityKey": base64_nopad(&identity.public_serialized()),
            "devices": [{
                "deviceId": 1,
                "registrationId": 555,
                "signedPreKey": {
                    "keyId": 11,
                    "publicKey": base64_nopad(&spk.key_pair.public_serialized()),
                    "signature": base64_nopad(&spk.signature),
                },
                "preKey": null,
            }]
        });
        let parsed: BundleResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.devices.len(), 1);
        assert_eq!(parsed.devices[0].registration_id, 555);
        assert!(parsed.devices[0].pre_key.is_none());
    }
}
