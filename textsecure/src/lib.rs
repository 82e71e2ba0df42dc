//! TextSecure client library.
//!
//! [`setup`] loads (or creates, registering with the service) the
//! device's cryptographic state and returns a [`Context`] carrying
//! everything an operation needs: configuration, the persistent store
//! behind a single writer lock, the pinned transport and the
//! application's capability traits. Nothing is process-global; tests
//! instantiate several contexts side by side.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod api;
pub mod config;
pub mod content;
pub mod envelope;
pub mod error;
pub mod groups;
pub mod store;
pub mod transport;
pub mod websocket;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use axolotl::keys::generate_registration_id;
use axolotl::store::{Address, IdentityStore, PreKeyStore, SessionStore, SignedPreKeyStore};
use axolotl::{IdentityKeyPair, PreKeyRecord, SessionBuilder, SessionCipher, SignedPreKeyRecord};

use api::{
    contact_token, generate_password, OutgoingEnvelope, SendOutcome, Service, LAST_RESORT_KEY_ID,
    PRE_KEY_BATCH_SIZE, PRE_KEY_LOW_WATER,
};
pub use config::Config;
use content::PushContent;
pub use content::{AttachmentPointer, GroupContext};
use envelope::{envelope_type, open_envelope, IncomingPushMessage, SignalingKey};
pub use error::{Error, Result};
use groups::Group;
use store::FileStore;
use transport::HttpTransport;
use websocket::{unwrap_body, WsConn};

/// A local address-book entry.
#[derive(Debug, Clone)]
pub struct Contact {
    /// Phone number in E.164 form
    pub tel: String,
    /// Display name
    pub name: String,
}

/// A decrypted message delivered to the application.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Sender phone number
    pub source: String,
    /// Message body
    pub message: String,
    /// Attachment references; blob download is the host's concern
    pub attachments: Vec<AttachmentPointer>,
    /// Group name when the message was sent to a group
    pub group: Option<String>,
    /// Sender timestamp, milliseconds
    pub timestamp: u64,
}

/// Supplies the registration verification code.
pub trait CodeProvider: Send + Sync {
    /// Return the code received by SMS or voice call.
    fn verification_code(&self) -> String;
}

/// Supplies the storage password when the store is encrypted.
pub trait PasswordProvider: Send + Sync {
    /// Return the storage password.
    fn storage_password(&self) -> String;
}

/// Supplies the local address book for directory lookups.
pub trait ContactProvider: Send + Sync {
    /// Return the local contacts.
    fn local_contacts(&self) -> Vec<Contact>;
}

/// Receives decrypted messages and delivery receipts. Invoked from the
/// receive task; implementations must not block indefinitely.
pub trait MessageSink: Send + Sync {
    /// A message arrived and decrypted cleanly.
    fn incoming_message(&self, message: IncomingMessage);

    /// The peer's device acknowledged delivery.
    fn delivery_receipt(&self, _source: &str, _timestamp: u64) {}
}

/// Application callbacks and the root directory, handed to [`setup`].
pub struct Client {
    /// Directory holding `.config/` and `.storage/`
    pub root_dir: PathBuf,
    /// Verification-code source
    pub code_provider: Arc<dyn CodeProvider>,
    /// Storage-password source; optional when the config carries one
    pub password_provider: Option<Arc<dyn PasswordProvider>>,
    /// Address book, for [`Context::registered_contacts`]
    pub contact_provider: Option<Arc<dyn ContactProvider>>,
    /// Message delivery target
    pub message_sink: Arc<dyn MessageSink>,
}

struct RegistrationInfo {
    password: String,
    signaling_key: Vec<u8>,
    registration_id: u32,
}

/// Everything one client instance needs, created by [`setup`].
pub struct Context {
    config: Config,
    store: Mutex<FileStore>,
    service: Service,
    registration: RegistrationInfo,
    session_locks: Mutex<HashMap<Address, Arc<Mutex<()>>>>,
    client: Client,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Store key for a peer: the phone number without its leading `+`.
fn rec_id(tel: &str) -> String {
    tel.strip_prefix('+').unwrap_or(tel).to_string()
}

/// Load configuration and state, registering with the service when the
/// store holds no identity yet. Startup store failures are fatal.
pub async fn setup(client: Client) -> Result<Context> {
    let config = Config::load(&client.root_dir)?;
    setup_with_config(client, config).await
}

/// [`setup`] with an explicit configuration, for hosts that manage their
/// own config loading.
pub async fn setup_with_config(client: Client, config: Config) -> Result<Context> {
    let storage_password = if config.unencrypted_storage {
        None
    } else {
        match (&config.storage_password, &client.password_provider) {
            (Some(password), _) => Some(password.clone()),
            (None, Some(provider)) => Some(provider.storage_password()),
            (None, None) => {
                return Err(Error::Config(
                    "encrypted storage needs storagePassword or a password provider".into(),
                ))
            }
        }
    };

    let mut store = FileStore::open(&client.root_dir, storage_password.as_deref())?;
    let tls = transport::pinned_tls_config(config.fingerprint_bytes()?, config.skip_tls_check)?;

    if !store.valid() {
        register(&client, &config, &mut store, tls.clone()).await?;
    }

    let registration = RegistrationInfo {
        password: store.load_http_password()?,
        signaling_key: store.load_signaling_key()?,
        registration_id: store.local_registration_id().map_err(|e| Error::Store(e.to_string()))?,
    };
    // reject a corrupt signaling key before the first envelope arrives
    SignalingKey::from_bytes(&registration.signaling_key)?;

    let transport = HttpTransport::new(&config.server, &config.tel, &registration.password, tls)?;
    let service = Service::new(transport);

    Ok(Context {
        config,
        store: Mutex::new(store),
        service,
        registration,
        session_locks: Mutex::new(HashMap::new()),
        client,
    })
}

async fn register(
    client: &Client,
    config: &Config,
    store: &mut FileStore,
    tls: Arc<rustls::ClientConfig>,
) -> Result<()> {
    info!("no usable identity in the store, registering {}", config.tel);

    let registration_id = generate_registration_id();
    store.set_local_registration_id(registration_id)?;

    let password = generate_password();
    store.store_http_password(&password)?;

    let signaling_key = SignalingKey::generate();
    store.store_signaling_key(&signaling_key)?;

    let identity = IdentityKeyPair::generate();
    store.set_identity_key_pair(&identity)?;

    let transport = HttpTransport::new(&config.server, &config.tel, &password, tls)?;
    let service = Service::new(transport);

    service
        .request_code(&config.tel, &config.verification_type)
        .await?;
    let code = client.code_provider.verification_code().replace('-', "");
    service
        .verify_code(&code, &signaling_key, registration_id)
        .await?;

    let pre_keys = generate_pre_key_batch(store)?;
    let signed_id = store.allocate_pre_key_ids(1)?[0];
    let signed_pre_key = SignedPreKeyRecord::generate(signed_id, &identity);
    let last_resort = PreKeyRecord::generate(LAST_RESORT_KEY_ID);
    store_records(store, &pre_keys, &signed_pre_key, &last_resort)?;

    service
        .register_keys(&identity, &signed_pre_key, &pre_keys, &last_resort)
        .await?;
    info!("registration done");
    Ok(())
}

fn generate_pre_key_batch(store: &FileStore) -> Result<Vec<PreKeyRecord>> {
    let ids = store.allocate_pre_key_ids(PRE_KEY_BATCH_SIZE)?;
    Ok(ids.into_iter().map(PreKeyRecord::generate).collect())
}

fn store_records(
    store: &mut FileStore,
    pre_keys: &[PreKeyRecord],
    signed_pre_key: &SignedPreKeyRecord,
    last_resort: &PreKeyRecord,
) -> Result<()> {
    for record in pre_keys {
        store.store_pre_key(record).map_err(Error::Protocol)?;
    }
    store.store_pre_key(last_resort).map_err(Error::Protocol)?;
    store
        .store_signed_pre_key(signed_pre_key)
        .map_err(Error::Protocol)?;
    Ok(())
}

impl Context {
    /// The loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn session_lock(&self, address: &Address) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks
            .entry(address.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ─── sending ────────────────────────────────────────────────────────

    /// Send a text message to a peer.
    pub async fn send_message(&self, to: &str, body: &str) -> Result<()> {
        self.send_content(to, &PushContent::text(body)).await
    }

    /// Seal and upload an attachment, then send a message referencing it.
    pub async fn send_attachment(
        &self,
        to: &str,
        body: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<()> {
        let pointer = self.upload_attachment(content_type, data).await?;
        let content = PushContent {
            body: (!body.is_empty()).then(|| body.to_string()),
            attachments: vec![pointer],
            group: None,
        };
        self.send_content(to, &content).await
    }

    async fn upload_attachment(&self, content_type: &str, data: &[u8]) -> Result<AttachmentPointer> {
        let keys = content::generate_attachment_keys();
        let sealed = content::seal_attachment(&keys, data)?;
        let id = self.service.upload_attachment(&sealed).await?;
        Ok(AttachmentPointer {
            id,
            content_type: content_type.to_string(),
            key: keys.to_vec(),
        })
    }

    /// Create a group and announce it to every member.
    pub async fn new_group(&self, name: &str, members: &[String]) -> Result<()> {
        let mut all_members: Vec<String> = members.to_vec();
        if !all_members.contains(&self.config.tel) {
            all_members.push(self.config.tel.clone());
        }
        let group = Group::new(name, all_members);
        {
            let store = self.store.lock().await;
            groups::store_group(&store, &group)?;
        }
        let content = PushContent {
            body: None,
            attachments: Vec::new(),
            group: Some(group.update_context()),
        };
        self.fan_out(&group, &content).await
    }

    /// Leave a group: tell the members, then drop the local record.
    pub async fn leave_group(&self, name: &str) -> Result<()> {
        let group = {
            let store = self.store.lock().await;
            groups::find_group_by_name(&store, name)?
                .ok_or_else(|| Error::UnknownGroup(name.to_string()))?
        };
        let content = PushContent {
            body: None,
            attachments: Vec::new(),
            group: Some(GroupContext {
                id: group.id.clone(),
                group_type: content::group_type::QUIT,
                name: None,
                members: Vec::new(),
            }),
        };
        self.fan_out(&group, &content).await?;
        let store = self.store.lock().await;
        store.remove_group(&group.hex_id())
    }

    /// Send a text message to every member of a group.
    pub async fn send_group_message(&self, name: &str, body: &str) -> Result<()> {
        let group = {
            let store = self.store.lock().await;
            groups::find_group_by_name(&store, name)?
                .ok_or_else(|| Error::UnknownGroup(name.to_string()))?
        };
        let content = PushContent {
            body: Some(body.to_string()),
            attachments: Vec::new(),
            group: Some(GroupContext {
                id: group.id.clone(),
                group_type: content::group_type::DELIVER,
                name: None,
                members: Vec::new(),
            }),
        };
        self.fan_out(&group, &content).await
    }

    async fn fan_out(&self, group: &Group, content: &PushContent) -> Result<()> {
        for member in &group.members {
            if *member == self.config.tel {
                continue;
            }
            if let Err(e) = self.send_content(member, content).await {
                // one unreachable member must not abort the fan-out
                warn!("group send to {member} failed: {e}");
            }
        }
        Ok(())
    }

    async fn send_content(&self, to: &str, content: &PushContent) -> Result<()> {
        let padded = content.encode_padded()?;
        let timestamp = now_millis();

        self.ensure_sessions(to).await?;
        let envelopes = self.build_envelopes(to, &padded, timestamp).await?;

        match self.service.send_messages(to, &envelopes).await? {
            SendOutcome::Ok => Ok(()),
            SendOutcome::Mismatched { missing, extra } => {
                info!("device list for {to} diverged; syncing and retrying");
                self.drop_sessions(to, &extra).await?;
                for device in missing {
                    self.establish_session(to, &device.to_string()).await?;
                }
                self.retry_send(to, &padded, timestamp).await
            }
            SendOutcome::Stale { stale } => {
                info!("stale devices for {to}; discarding sessions and retrying");
                self.drop_sessions(to, &stale).await?;
                for device in stale {
                    self.establish_session(to, &device.to_string()).await?;
                }
                self.retry_send(to, &padded, timestamp).await
            }
        }
    }

    async fn retry_send(&self, to: &str, padded: &[u8], timestamp: u64) -> Result<()> {
        let envelopes = self.build_envelopes(to, padded, timestamp).await?;
        match self.service.send_messages(to, &envelopes).await? {
            SendOutcome::Ok => Ok(()),
            SendOutcome::Mismatched { .. } => Err(Error::ServerStatus(409)),
            SendOutcome::Stale { .. } => Err(Error::ServerStatus(410)),
        }
    }

    async fn drop_sessions(&self, to: &str, devices: &[u32]) -> Result<()> {
        let recipient = rec_id(to);
        let mut store = self.store.lock().await;
        for device in devices {
            store
                .delete_session(&Address::new(recipient.clone(), *device))
                .map_err(Error::Protocol)?;
        }
        Ok(())
    }

    /// Make sure at least one session exists for the peer, fetching
    /// bundles on first contact.
    async fn ensure_sessions(&self, to: &str) -> Result<()> {
        let recipient = rec_id(to);
        let devices = {
            let store = self.store.lock().await;
            store.session_devices(&recipient)?
        };
        if devices.is_empty() {
            self.establish_session(to, "*").await?;
        }
        Ok(())
    }

    async fn establish_session(&self, to: &str, device: &str) -> Result<()> {
        let recipient = rec_id(to);
        let bundles = self.service.pre_key_bundles_for_device(to, device).await?;
        for bundle in bundles {
            let address = Address::new(recipient.clone(), bundle.device_id);
            let lock = self.session_lock(&address).await;
            let _guard = lock.lock().await;
            let mut store = self.store.lock().await;
            SessionBuilder::process_bundle(&mut *store, &address, &bundle)
                .map_err(Error::Protocol)?;
        }
        Ok(())
    }

    async fn build_envelopes(
        &self,
        to: &str,
        padded: &[u8],
        timestamp: u64,
    ) -> Result<Vec<OutgoingEnvelope>> {
        let recipient = rec_id(to);
        let devices = {
            let store = self.store.lock().await;
            store.session_devices(&recipient)?
        };
        if devices.is_empty() {
            return Err(Error::Protocol(axolotl::Error::NoSession(recipient)));
        }

        let mut envelopes = Vec::with_capacity(devices.len());
        for device in devices {
            let address = Address::new(recipient.clone(), device);
            let lock = self.session_lock(&address).await;
            let _guard = lock.lock().await;
            let mut store = self.store.lock().await;

            let registration_id = store
                .load_session(&address)
                .map_err(Error::Protocol)?
                .map(|s| s.remote_registration_id())
                .unwrap_or(0);

            let mut cipher = SessionCipher::new(&mut *store, address);
            let message = cipher.encrypt(padded).map_err(Error::Protocol)?;
            let message_type = if message.is_pre_key() {
                envelope_type::PREKEY_BUNDLE
            } else {
                envelope_type::CIPHERTEXT
            };
            envelopes.push(OutgoingEnvelope {
                message_type,
                destination_device_id: device,
                destination_registration_id: registration_id,
                body: api::base64_nopad(message.serialized()),
                timestamp,
            });
        }
        Ok(envelopes)
    }

    // ─── directory & identity ───────────────────────────────────────────

    /// The subset of local contacts registered with the service.
    pub async fn registered_contacts(&self) -> Result<Vec<Contact>> {
        let provider = self
            .client
            .contact_provider
            .as_ref()
            .ok_or_else(|| Error::Config("no contact provider installed".into()))?;
        let contacts = provider.local_contacts();
        let tokens: Vec<String> = contacts.iter().map(|c| contact_token(&c.tel)).collect();
        let registered = self.service.registered_tokens(&tokens).await?;
        Ok(contacts
            .into_iter()
            .zip(tokens)
            .filter(|(_, token)| registered.contains(token))
            .map(|(contact, _)| contact)
            .collect())
    }

    /// Hex fingerprint of an identity key: ours for `me`/`self`/our own
    /// number, otherwise the recorded key for the peer.
    pub async fn identity_fingerprint(&self, id: &str) -> Result<String> {
        let store = self.store.lock().await;
        let key = if id == "me" || id == "self" || id == self.config.tel {
            *store.identity_key_pair().map_err(Error::Protocol)?.public()
        } else {
            store
                .remote_identity(&rec_id(id))
                .map_err(Error::Protocol)?
                .ok_or_else(|| Error::Store(format!("no recorded identity for {id}")))?
        };
        Ok(key
            .as_bytes()
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(" "))
    }

    /// Top up the server-side pre-key supply when it runs low.
    pub async fn ensure_pre_keys(&self) -> Result<()> {
        let count = self.service.pre_key_count().await?;
        if count >= PRE_KEY_LOW_WATER {
            return Ok(());
        }
        info!("server holds {count} pre-keys, registering a fresh batch");
        let mut store = self.store.lock().await;
        let identity = store.identity_key_pair().map_err(Error::Protocol)?;
        let pre_keys = generate_pre_key_batch(&store)?;
        let signed_pre_key = match store.current_signed_pre_key()? {
            Some(record) => record,
            None => {
                let id = store.allocate_pre_key_ids(1)?[0];
                SignedPreKeyRecord::generate(id, &identity)
            }
        };
        let last_resort = match store.load_pre_key(LAST_RESORT_KEY_ID).map_err(Error::Protocol)? {
            Some(record) => record,
            None => PreKeyRecord::generate(LAST_RESORT_KEY_ID),
        };
        store_records(&mut store, &pre_keys, &signed_pre_key, &last_resort)?;
        drop(store);
        self.service
            .register_keys(&identity, &signed_pre_key, &pre_keys, &last_resort)
            .await
    }

    // ─── receiving ──────────────────────────────────────────────────────

    /// Authenticate, decrypt and dispatch one pushed envelope.
    pub async fn handle_received_message(&self, body: &[u8]) -> Result<()> {
        let signaling = SignalingKey::from_bytes(&self.registration.signaling_key)?;
        let push = open_envelope(&signaling, body)?;
        match push.message_type {
            envelope_type::RECEIPT => {
                self.client
                    .message_sink
                    .delivery_receipt(&push.source, push.timestamp);
                Ok(())
            }
            envelope_type::CIPHERTEXT => {
                let plaintext = self.session_decrypt(&push, false).await?;
                self.dispatch_content(&push, &plaintext, true).await
            }
            envelope_type::PREKEY_BUNDLE => {
                let plaintext = self.session_decrypt(&push, true).await?;
                self.dispatch_content(&push, &plaintext, true).await
            }
            envelope_type::PLAINTEXT => self.dispatch_content(&push, &push.message, false).await,
            other => Err(Error::Envelope(format!("unhandled envelope type {other}"))),
        }
    }

    async fn session_decrypt(&self, push: &IncomingPushMessage, prekey: bool) -> Result<Vec<u8>> {
        let address = Address::new(rec_id(&push.source), push.source_device);
        let lock = self.session_lock(&address).await;
        let _guard = lock.lock().await;
        let mut store = self.store.lock().await;
        let mut cipher = SessionCipher::new(&mut *store, address);
        let plaintext = if prekey {
            cipher.decrypt_pre_key_whisper(&push.message)?
        } else {
            cipher.decrypt_whisper(&push.message)?
        };
        Ok(plaintext)
    }

    async fn dispatch_content(
        &self,
        push: &IncomingPushMessage,
        plaintext: &[u8],
        padded: bool,
    ) -> Result<()> {
        let content = if padded {
            PushContent::decode_padded(plaintext)?
        } else {
            rmp_serde::from_slice(plaintext).map_err(|e| Error::Codec(e.to_string()))?
        };

        let group = match &content.group {
            Some(context) => {
                let store = self.store.lock().await;
                groups::apply_group_context(&store, &push.source, context)?
            }
            None => None,
        };

        self.client.message_sink.incoming_message(IncomingMessage {
            source: push.source.clone(),
            message: content.body.unwrap_or_default(),
            attachments: content.attachments,
            group,
            timestamp: push.timestamp,
        });
        Ok(())
    }

    /// Connect the websocket and dispatch pushes until a fatal error.
    ///
    /// Transient failures sleep three seconds and reconnect. Decrypt
    /// failures are logged and the envelope is acknowledged anyway so the
    /// server does not redeliver it forever.
    pub async fn listen(&self) -> Result<()> {
        if let Err(e) = self.ensure_pre_keys().await {
            warn!("pre-key replenishment failed: {e}");
        }

        loop {
            let mut conn = match WsConn::connect(
                &self.config.server,
                &self.config.tel,
                &self.registration.password,
                self.service.transport().tls_config(),
            )
            .await
            {
                Ok(conn) => conn,
                Err(Error::PinMismatch) => return Err(Error::PinMismatch),
                Err(e) => {
                    warn!("websocket connect failed: {e}");
                    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                    continue;
                }
            };

            loop {
                let request = match conn.next_request().await {
                    Ok(request) => request,
                    Err(e) => {
                        warn!("websocket receive failed: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                        break;
                    }
                };

                if let Some(body) = &request.body {
                    let envelope_bytes = unwrap_body(body);
                    if let Err(e) = self.handle_received_message(&envelope_bytes).await {
                        match e {
                            Error::PinMismatch => return Err(Error::PinMismatch),
                            // recoverable per-envelope failures: drop the
                            // envelope, keep the loop alive
                            e => error!("dropping undecryptable envelope: {e}"),
                        }
                    }
                }
                if let Some(id) = request.id {
                    if let Err(e) = conn.send_ack(id).await {
                        warn!("ack failed: {e}");
                    }
                }
            }
        }
    }
}
