pub mod account;
pub mod message;

use crate::config::Config;
use crate::http_directory::HttpDirectory;
use anyhow::{Context, Result};
use courier::{EncryptedStorage, FileStorageAdapter, Messenger, StorageAdapter};
use std::path::Path;
use std::sync::Arc;

/// Builds the engine over the encrypted on-disk store. Nothing connects
/// until `sign_in`.
pub fn open_messenger(config: &mut Config, data_dir: &Path) -> Result<Arc<Messenger>> {
    let account = config.account()?.clone();
    let storage_key = config.ensure_storage_key()?;
    let files = FileStorageAdapter::new(data_dir.join("store"))
        .context("Failed to open local store")?;
    let storage: Arc<dyn StorageAdapter> = Arc::new(EncryptedStorage::new(files, storage_key));
    let directory = Arc::new(HttpDirectory::new(&config.api_url, account.auth_token.clone())?);

    Ok(Messenger::new(
        account,
        &config.engine,
        storage,
        directory.clone(),
        directory,
    )?)
}

/// Accepts a peer id with a known conversation, or a conversation id.
pub fn resolve_conversation(messenger: &Messenger, target: &str) -> Result<String> {
    Ok(messenger
        .store()
        .conversation_for_peer(target)?
        .unwrap_or_else(|| target.to_string()))
}
