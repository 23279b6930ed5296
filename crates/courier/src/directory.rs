//! Server-side collaborators the engine consumes: the prekey directory and
//! direct-conversation lookup. The CLI talks to them over HTTP; tests use
//! [`InMemoryDirectory`].

use crate::prekeys::{KeyUpload, PreKeyBundle};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[async_trait]
pub trait KeyDirectory: Send + Sync {
    async fn upload_keys(&self, upload: KeyUpload) -> Result<()>;

    /// Whether the server still holds keys for this device and identity.
    async fn has_keys(&self, user_id: &str, device_id: u32, identity_key: &str) -> Result<bool>;

    /// Fails with [`Error::NoPublishedKeys`] when the device never uploaded
    /// keys. The returned one-time prekey is removed server side.
    async fn fetch_bundle(&self, user_id: &str, device_id: u32) -> Result<PreKeyBundle>;

    async fn list_devices(&self, user_id: &str) -> Result<Vec<u32>>;
}

#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    async fn create_or_get_direct(&self, user_id: &str, peer_id: &str) -> Result<String>;
}

#[derive(Default)]
struct DirectoryState {
    uploads: BTreeMap<(String, u32), KeyUpload>,
    conversations: HashMap<(String, String), String>,
    bundle_fetches: usize,
}

/// Directory held in memory, shared by every client in a test.
#[derive(Default)]
pub struct InMemoryDirectory {
    state: Mutex<DirectoryState>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn bundle_fetches(&self) -> usize {
        self.state().bundle_fetches
    }

    pub fn remaining_prekeys(&self, user_id: &str, device_id: u32) -> usize {
        self.state()
            .uploads
            .get(&(user_id.to_string(), device_id))
            .map(|u| u.prekeys.len())
            .unwrap_or(0)
    }

    /// Drops a device's keys as if the server lost them.
    pub fn forget(&self, user_id: &str, device_id: u32) {
        self.state().uploads.remove(&(user_id.to_string(), device_id));
    }
}

#[async_trait]
impl KeyDirectory for InMemoryDirectory {
    async fn upload_keys(&self, upload: KeyUpload) -> Result<()> {
        self.state()
            .uploads
            .insert((upload.user_id.clone(), upload.device_id), upload);
        Ok(())
    }

    async fn has_keys(&self, user_id: &str, device_id: u32, identity_key: &str) -> Result<bool> {
        Ok(self
            .state()
            .uploads
            .get(&(user_id.to_string(), device_id))
            .is_some_and(|u| u.identity_key == identity_key))
    }

    async fn fetch_bundle(&self, user_id: &str, device_id: u32) -> Result<PreKeyBundle> {
        let mut state = self.state();
        state.bundle_fetches += 1;
        let upload = state
            .uploads
            .get_mut(&(user_id.to_string(), device_id))
            .ok_or_else(|| Error::NoPublishedKeys(format!("{}.{}", user_id, device_id)))?;

        let one_time_prekey = if upload.prekeys.is_empty() {
            None
        } else {
            Some(upload.prekeys.remove(0))
        };

        Ok(PreKeyBundle {
            user_id: upload.user_id.clone(),
            device_id: upload.device_id,
            registration_id: upload.registration_id,
            identity_key: upload.identity_key.clone(),
            signed_prekey: upload.signed_prekey.clone(),
            one_time_prekey,
        })
    }

    async fn list_devices(&self, user_id: &str) -> Result<Vec<u32>> {
        Ok(self
            .state()
            .uploads
            .keys()
            .filter(|(user, _)| user == user_id)
            .map(|(_, device)| *device)
            .collect())
    }
}

#[async_trait]
impl ConversationDirectory for InMemoryDirectory {
    async fn create_or_get_direct(&self, user_id: &str, peer_id: &str) -> Result<String> {
        let pair = if user_id <= peer_id {
            (user_id.to_string(), peer_id.to_string())
        } else {
            (peer_id.to_string(), user_id.to_string())
        };
        Ok(self
            .state()
            .conversations
            .entry(pair)
            .or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone())
    }
}
