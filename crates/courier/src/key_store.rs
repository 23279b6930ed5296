use crate::config::TrustPolicy;
use crate::prekeys::{PreKeyRecord, SignedPreKeyRecord};
use crate::storage::parse_record;
use crate::{Error, ProtocolAddress, Result, SerializableKeyPair, SessionState, StorageAdapter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

const PREFIX: &str = "keys/";
const MAX_ARCHIVED_SESSIONS: usize = 4;

/// Long-lived device identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub key_pair: SerializableKeyPair,
    pub registration_id: u32,
}

/// Key-agreement header repeated on outgoing messages until the peer answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPreKey {
    pub base_key: String,
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
}

/// A replaced session kept so messages the peer encrypted with it still
/// decrypt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedSession {
    pub state: SessionState,
    pub base_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub state: SessionState,
    /// Initiator's ephemeral key the session was derived from
    pub base_key: String,
    pub their_identity: String,
    #[serde(default)]
    pub pending_pre_key: Option<PendingPreKey>,
    /// Most recent first
    #[serde(default)]
    pub previous: Vec<ArchivedSession>,
}

impl SessionRecord {
    pub fn new(
        state: SessionState,
        base_key: impl Into<String>,
        their_identity: impl Into<String>,
        pending_pre_key: Option<PendingPreKey>,
    ) -> Self {
        Self {
            state,
            base_key: base_key.into(),
            their_identity: their_identity.into(),
            pending_pre_key,
            previous: Vec::new(),
        }
    }

    /// Makes a new session current and archives the old one.
    pub fn replace_current(&mut self, state: SessionState, base_key: String) {
        let old_state = std::mem::replace(&mut self.state, state);
        let old_base = std::mem::replace(&mut self.base_key, base_key);
        self.pending_pre_key = None;
        self.archive(ArchivedSession {
            state: old_state,
            base_key: old_base,
        });
    }

    /// Swaps the archived session at `index`, advanced to `state`, with the
    /// current one.
    pub fn promote(&mut self, index: usize, state: SessionState) {
        let archived = self.previous.remove(index);
        self.replace_current(state, archived.base_key);
    }

    pub fn knows_base_key(&self, base_key: &str) -> bool {
        self.base_key == base_key || self.previous.iter().any(|p| p.base_key == base_key)
    }

    fn archive(&mut self, session: ArchivedSession) {
        self.previous.retain(|p| p.base_key != session.base_key);
        self.previous.insert(0, session);
        self.previous.truncate(MAX_ARCHIVED_SESSIONS);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityChange {
    New,
    Unchanged,
    Changed,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PrekeyCursor {
    next_prekey_id: u32,
    current_signed_prekey_id: Option<u32>,
}

/// Durable key material and ratchet sessions for this device.
#[derive(Clone)]
pub struct KeyStore {
    storage: Arc<dyn StorageAdapter>,
    trust_policy: TrustPolicy,
}

impl KeyStore {
    pub fn new(storage: Arc<dyn StorageAdapter>, trust_policy: TrustPolicy) -> Self {
        Self {
            storage,
            trust_policy,
        }
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.storage.get(key)? {
            Some(raw) => Ok(Some(parse_record(key, &raw)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.storage.put(key, serde_json::to_string(value)?)
    }

    pub fn local_identity(&self) -> Result<Option<LocalIdentity>> {
        self.get_json(&format!("{}identity", PREFIX))
    }

    pub fn save_local_identity(&self, identity: &LocalIdentity) -> Result<()> {
        self.put_json(&format!("{}identity", PREFIX), identity)
    }

    fn cursor(&self) -> Result<PrekeyCursor> {
        Ok(self
            .get_json(&format!("{}prekey-cursor", PREFIX))?
            .unwrap_or(PrekeyCursor {
                next_prekey_id: 1,
                current_signed_prekey_id: None,
            }))
    }

    fn save_cursor(&self, cursor: &PrekeyCursor) -> Result<()> {
        self.put_json(&format!("{}prekey-cursor", PREFIX), cursor)
    }

    pub fn next_prekey_id(&self) -> Result<u32> {
        Ok(self.cursor()?.next_prekey_id)
    }

    pub fn store_prekeys(&self, prekeys: &[PreKeyRecord]) -> Result<()> {
        for prekey in prekeys {
            self.put_json(&format!("{}prekey/{}", PREFIX, prekey.id), prekey)?;
        }
        if let Some(last) = prekeys.iter().map(|p| p.id).max() {
            let mut cursor = self.cursor()?;
            cursor.next_prekey_id = cursor.next_prekey_id.max(last.wrapping_add(1));
            self.save_cursor(&cursor)?;
        }
        Ok(())
    }

    pub fn load_prekey(&self, id: u32) -> Result<Option<PreKeyRecord>> {
        self.get_json(&format!("{}prekey/{}", PREFIX, id))
    }

    pub fn remove_prekey(&self, id: u32) -> Result<()> {
        self.storage.del(&format!("{}prekey/{}", PREFIX, id))
    }

    pub fn prekey_count(&self) -> Result<usize> {
        Ok(self.storage.list(&format!("{}prekey/", PREFIX))?.len())
    }

    /// Stores a signed prekey and makes it current. Older ones stay loadable.
    pub fn store_signed_prekey(&self, signed: &SignedPreKeyRecord) -> Result<()> {
        self.put_json(&format!("{}signed-prekey/{}", PREFIX, signed.id), signed)?;
        let mut cursor = self.cursor()?;
        cursor.current_signed_prekey_id = Some(signed.id);
        self.save_cursor(&cursor)
    }

    pub fn load_signed_prekey(&self, id: u32) -> Result<Option<SignedPreKeyRecord>> {
        self.get_json(&format!("{}signed-prekey/{}", PREFIX, id))
    }

    pub fn current_signed_prekey(&self) -> Result<Option<SignedPreKeyRecord>> {
        match self.cursor()?.current_signed_prekey_id {
            Some(id) => self.load_signed_prekey(id),
            None => Ok(None),
        }
    }

    pub fn trusted_identity(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self.storage.get(&format!("{}trusted/{}", PREFIX, user_id))?)
    }

    /// Applies the trust policy to `identity_key` without recording it.
    pub fn check_identity(&self, user_id: &str, identity_key: &str) -> Result<IdentityChange> {
        match self.trusted_identity(user_id)? {
            None => Ok(IdentityChange::New),
            Some(known) if known == identity_key => Ok(IdentityChange::Unchanged),
            Some(_) => match self.trust_policy {
                TrustPolicy::AcceptChanged => {
                    warn!(peer = %user_id, "identity key changed, accepting new key");
                    Ok(IdentityChange::Changed)
                }
                TrustPolicy::RejectChanged => {
                    warn!(peer = %user_id, "identity key changed, refusing");
                    Err(Error::UntrustedIdentity(user_id.to_string()))
                }
            },
        }
    }

    pub fn save_identity(&self, user_id: &str, identity_key: &str) -> Result<()> {
        self.storage
            .put(&format!("{}trusted/{}", PREFIX, user_id), identity_key.to_string())
    }

    /// Forgets a peer's trusted key so the next one is accepted as new.
    pub fn forget_identity(&self, user_id: &str) -> Result<()> {
        self.storage.del(&format!("{}trusted/{}", PREFIX, user_id))
    }

    fn session_key(address: &ProtocolAddress) -> String {
        format!("{}session/{}", PREFIX, address)
    }

    pub fn load_session(&self, address: &ProtocolAddress) -> Result<Option<SessionRecord>> {
        self.get_json(&Self::session_key(address))
    }

    pub fn store_session(&self, address: &ProtocolAddress, record: &SessionRecord) -> Result<()> {
        self.put_json(&Self::session_key(address), record)
    }

    pub fn has_session(&self, address: &ProtocolAddress) -> Result<bool> {
        Ok(self.storage.get(&Self::session_key(address))?.is_some())
    }

    /// Wipes identity, prekeys, trust records and sessions. Other data
    /// sharing the same storage is left alone.
    pub fn clear(&self) -> Result<()> {
        self.storage.del_prefix(PREFIX)
    }
}
