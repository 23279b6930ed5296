use crate::directory::KeyDirectory;
use crate::key_store::{IdentityChange, KeyStore, LocalIdentity, PendingPreKey, SessionRecord};
use crate::prekeys::{generate_prekeys, generate_signed_prekey, KeyUpload};
use crate::session::{PreKeyMessage, RatchetMessage, Session};
use crate::utils::pubkey_from_hex;
use crate::{
    x3dh, EngineConfig, Error, MessageType, ProtocolAddress, Result, SerializableKeyPair,
    StorageAdapter,
};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Ciphertext ready for a `SignalMessage` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub message_type: MessageType,
    pub content: Vec<u8>,
}

/// Establishes sessions and runs encrypt/decrypt for this device. Access to
/// a single peer device's ratchet is serialized; different peers proceed
/// concurrently.
pub struct SessionManager {
    user_id: String,
    device_id: u32,
    store: KeyStore,
    directory: Arc<dyn KeyDirectory>,
    prekey_batch_size: u32,
    locks: Mutex<HashMap<ProtocolAddress, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(
        user_id: impl Into<String>,
        device_id: u32,
        storage: Arc<dyn StorageAdapter>,
        directory: Arc<dyn KeyDirectory>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            device_id,
            store: KeyStore::new(storage, config.trust_policy),
            directory,
            prekey_batch_size: config.prekey_batch_size,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn key_store(&self) -> &KeyStore {
        &self.store
    }

    pub fn identity_key(&self) -> Result<Option<String>> {
        Ok(self.store.local_identity()?.map(|i| i.key_pair.public_hex()))
    }

    fn address_lock(&self, address: &ProtocolAddress) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry(address.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Makes sure this device has keys and the server has them too.
    ///
    /// With `force_refresh` the signed prekey and one-time prekeys are rotated
    /// and re-uploaded while the identity is kept. With `verify` an existing
    /// identity is checked against the server and republished when missing.
    pub async fn ensure_keys(&self, force_refresh: bool, verify: bool) -> Result<()> {
        let identity = match self.store.local_identity()? {
            Some(identity) => {
                if !force_refresh {
                    if !verify {
                        return Ok(());
                    }
                    let published = self
                        .directory
                        .has_keys(&self.user_id, self.device_id, &identity.key_pair.public_hex())
                        .await?;
                    if published {
                        debug!("keys verified on server");
                        return Ok(());
                    }
                    warn!("server has no keys for this device, republishing");
                }
                identity
            }
            None => {
                let identity = LocalIdentity {
                    key_pair: SerializableKeyPair::generate(),
                    registration_id: rand::thread_rng().gen_range(1..=16380),
                };
                self.store.save_local_identity(&identity)?;
                info!(registration_id = identity.registration_id, "generated device identity");
                identity
            }
        };

        self.publish_keys(&identity).await
    }

    async fn publish_keys(&self, identity: &LocalIdentity) -> Result<()> {
        let signed_id = self
            .store
            .current_signed_prekey()?
            .map(|s| s.id.wrapping_add(1))
            .unwrap_or(1);
        let signed = generate_signed_prekey(&identity.key_pair, signed_id)?;
        let prekeys = generate_prekeys(self.store.next_prekey_id()?, self.prekey_batch_size);

        let upload = KeyUpload {
            user_id: self.user_id.clone(),
            device_id: self.device_id,
            registration_id: identity.registration_id,
            identity_key: identity.key_pair.public_hex(),
            signed_prekey: signed.public(),
            prekeys: prekeys.iter().map(|p| p.public()).collect(),
        };
        self.directory.upload_keys(upload).await?;

        self.store.store_signed_prekey(&signed)?;
        self.store.store_prekeys(&prekeys)?;
        info!(
            signed_prekey_id = signed_id,
            prekeys = prekeys.len(),
            "published keys"
        );
        Ok(())
    }

    /// Creates a session from the peer's published bundle unless one exists.
    pub async fn ensure_session(&self, address: &ProtocolAddress) -> Result<()> {
        let lock = self.address_lock(address);
        let _guard = lock.lock().await;
        self.ensure_session_locked(address).await
    }

    async fn ensure_session_locked(&self, address: &ProtocolAddress) -> Result<()> {
        if self.store.has_session(address)? {
            return Ok(());
        }

        let identity = self.store.local_identity()?.ok_or(Error::MissingLocalKeys)?;
        let bundle = self
            .directory
            .fetch_bundle(&address.user_id, address.device_id)
            .await?;

        let change = self.store.check_identity(&address.user_id, &bundle.identity_key)?;
        let initiation = x3dh::initiate(&identity.key_pair, &bundle)?;
        let session = Session::init(
            initiation.their_signed_prekey,
            &initiation.ephemeral,
            true,
            initiation.shared_secret,
        )?;

        let base_key = initiation.ephemeral.public_hex();
        self.store.store_session(
            address,
            &SessionRecord::new(
                session.state,
                base_key.clone(),
                bundle.identity_key.clone(),
                Some(PendingPreKey {
                    base_key,
                    signed_prekey_id: initiation.signed_prekey_id,
                    one_time_prekey_id: initiation.one_time_prekey_id,
                }),
            ),
        )?;
        if change != IdentityChange::Unchanged {
            self.store.save_identity(&address.user_id, &bundle.identity_key)?;
        }

        info!(peer = %address.user_id, device = address.device_id, "session established");
        Ok(())
    }

    pub async fn encrypt_message(
        &self,
        address: &ProtocolAddress,
        plaintext: &str,
    ) -> Result<EncryptedPayload> {
        let lock = self.address_lock(address);
        let _guard = lock.lock().await;
        self.ensure_session_locked(address).await?;

        let mut record = self
            .store
            .load_session(address)?
            .ok_or_else(|| Error::NoSession(address.to_string()))?;
        let mut session = Session::new(record.state);
        let message = session.encrypt(plaintext)?;
        record.state = session.state;

        let payload = match &record.pending_pre_key {
            Some(pending) => {
                let identity = self.store.local_identity()?.ok_or(Error::MissingLocalKeys)?;
                let prekey_message = PreKeyMessage {
                    registration_id: identity.registration_id,
                    identity_key: identity.key_pair.public_hex(),
                    base_key: pending.base_key.clone(),
                    signed_prekey_id: pending.signed_prekey_id,
                    one_time_prekey_id: pending.one_time_prekey_id,
                    message,
                };
                EncryptedPayload {
                    message_type: MessageType::PreKey,
                    content: prekey_message.to_bytes()?,
                }
            }
            None => EncryptedPayload {
                message_type: MessageType::Normal,
                content: message.to_bytes()?,
            },
        };

        self.store.store_session(address, &record)?;
        debug!(peer = %address.user_id, device = address.device_id, "encrypted message");
        Ok(payload)
    }

    /// Decrypts a message from `address`. A replay fails with
    /// [`Error::DuplicateMessage`]; no failure alters the stored session.
    pub async fn decrypt_message(
        &self,
        address: &ProtocolAddress,
        content: &[u8],
        message_type: MessageType,
    ) -> Result<String> {
        let lock = self.address_lock(address);
        let _guard = lock.lock().await;

        match message_type {
            MessageType::Normal => {
                let message = RatchetMessage::from_bytes(content)?;
                let record = self
                    .store
                    .load_session(address)?
                    .ok_or_else(|| Error::NoSession(address.to_string()))?;
                self.decrypt_with_record(address, record, &message)
            }
            MessageType::PreKey => {
                let prekey_message = PreKeyMessage::from_bytes(content)?;
                match self.store.load_session(address)? {
                    Some(record) if record.knows_base_key(&prekey_message.base_key) => {
                        self.decrypt_with_record(address, record, &prekey_message.message)
                    }
                    existing => self.accept_prekey_message(address, existing, prekey_message),
                }
            }
        }
    }

    /// Tries the current session, then archived ones newest first. An
    /// archived session that decrypts becomes current.
    fn decrypt_with_record(
        &self,
        address: &ProtocolAddress,
        mut record: SessionRecord,
        message: &RatchetMessage,
    ) -> Result<String> {
        let mut session = Session::new(record.state.clone());
        let current_error = match session.decrypt(message) {
            Ok(plaintext) => {
                record.state = session.state;
                record.pending_pre_key = None;
                self.store.store_session(address, &record)?;
                return Ok(plaintext);
            }
            Err(e) if e.is_duplicate() => return Err(e),
            Err(e) => e,
        };

        for index in 0..record.previous.len() {
            let mut session = Session::new(record.previous[index].state.clone());
            match session.decrypt(message) {
                Ok(plaintext) => {
                    record.promote(index, session.state);
                    self.store.store_session(address, &record)?;
                    debug!(peer = %address.user_id, device = address.device_id, "switched to archived session");
                    return Ok(plaintext);
                }
                Err(e) if e.is_duplicate() => return Err(e),
                Err(_) => {}
            }
        }
        Err(current_error)
    }

    /// Builds the responder side of a new session. A session already held
    /// for the peer is archived, not discarded, since both sides may have
    /// initiated at once.
    fn accept_prekey_message(
        &self,
        address: &ProtocolAddress,
        existing: Option<SessionRecord>,
        message: PreKeyMessage,
    ) -> Result<String> {
        let identity = self.store.local_identity()?.ok_or(Error::MissingLocalKeys)?;
        let change = self.store.check_identity(&address.user_id, &message.identity_key)?;

        let signed = self
            .store
            .load_signed_prekey(message.signed_prekey_id)?
            .ok_or_else(|| Error::Decryption(format!("unknown signed prekey {}", message.signed_prekey_id)))?;
        let one_time = match message.one_time_prekey_id {
            Some(id) => Some(
                self.store
                    .load_prekey(id)?
                    .ok_or_else(|| Error::Decryption(format!("one-time prekey {} not available", id)))?,
            ),
            None => None,
        };

        let their_identity = pubkey_from_hex(&message.identity_key)?;
        let their_base = pubkey_from_hex(&message.base_key)?;
        let shared_secret = x3dh::respond(
            &identity.key_pair,
            &signed.key_pair,
            one_time.as_ref().map(|k| &k.key_pair),
            &their_identity,
            &their_base,
        )?;

        let mut session = Session::init(their_base, &signed.key_pair, false, shared_secret)?;
        let plaintext = session.decrypt(&message.message)?;

        let record = match existing {
            Some(mut record) => {
                record.replace_current(session.state, message.base_key.clone());
                record.their_identity = message.identity_key.clone();
                record
            }
            None => SessionRecord::new(
                session.state,
                message.base_key.clone(),
                message.identity_key.clone(),
                None,
            ),
        };
        self.store.store_session(address, &record)?;
        if let Some(prekey) = &one_time {
            self.store.remove_prekey(prekey.id)?;
        }
        if change != IdentityChange::Unchanged {
            self.store.save_identity(&address.user_id, &message.identity_key)?;
        }

        info!(peer = %address.user_id, device = address.device_id, "session accepted from prekey message");
        Ok(plaintext)
    }

    /// Wipes every key and session. Used on sign-out.
    pub fn clear(&self) -> Result<()> {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).clear();
        self.store.clear()
    }
}
