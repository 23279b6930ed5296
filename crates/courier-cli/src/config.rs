use anyhow::{Context, Result};
use courier::{Account, EngineConfig};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration, stored as `config.json` in the data directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<Account>,

    /// Base URL of the key and conversation HTTP API
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default)]
    pub engine: EngineConfig,

    /// At-rest key for the local store (hex)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,

    #[serde(skip)]
    pub path: PathBuf,
}

fn default_api_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            account: None,
            api_url: default_api_url(),
            engine: EngineConfig::default(),
            storage_key: None,
            path: PathBuf::new(),
        }
    }
}

impl Config {
    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("config.json");

        if config_path.exists() {
            let content =
                std::fs::read_to_string(&config_path).context("Failed to read config file")?;
            let mut config: Config =
                serde_json::from_str(&content).context("Failed to parse config file")?;
            config.path = config_path;
            Ok(config)
        } else {
            Ok(Config {
                path: config_path,
                ..Default::default()
            })
        }
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&self.path, content).context("Failed to write config file")?;
        Ok(())
    }

    pub fn account(&self) -> Result<&Account> {
        self.account
            .as_ref()
            .context("Not logged in. Run `courier login` first")
    }

    pub fn is_logged_in(&self) -> bool {
        self.account.is_some()
    }

    /// Returns the storage key, generating and saving one on first use.
    pub fn ensure_storage_key(&mut self) -> Result<[u8; 32]> {
        if self.storage_key.is_none() {
            let mut key = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            self.storage_key = Some(hex::encode(key));
            self.save()?;
        }
        self.storage_key_bytes()
    }

    pub fn storage_key_bytes(&self) -> Result<[u8; 32]> {
        let key = self.storage_key.as_ref().context("No storage key")?;
        let bytes = hex::decode(key).context("Invalid storage key format")?;
        bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Storage key must be 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_nonexistent_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let config = Config::load(temp.path()).unwrap();
        assert!(!config.is_logged_in());
        assert!(config.account().is_err());
        assert_eq!(config.engine.max_retries, EngineConfig::default().max_retries);
    }

    #[test]
    fn account_survives_save_and_load() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::load(temp.path()).unwrap();
        config.account = Some(Account {
            user_id: "alice".to_string(),
            device_id: 2,
            auth_token: Some("token".to_string()),
        });
        config.engine.server_url = "ws://example.test/ws".to_string();
        config.save().unwrap();

        let loaded = Config::load(temp.path()).unwrap();
        assert_eq!(loaded.account().unwrap().device_id, 2);
        assert_eq!(loaded.engine.server_url, "ws://example.test/ws");
    }

    #[test]
    fn storage_key_is_generated_once() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::load(temp.path()).unwrap();
        let first = config.ensure_storage_key().unwrap();
        let second = config.ensure_storage_key().unwrap();
        assert_eq!(first, second);

        let reloaded = Config::load(temp.path()).unwrap();
        assert_eq!(reloaded.storage_key_bytes().unwrap(), first);
    }

    #[test]
    fn partial_engine_section_uses_defaults() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("config.json"),
            r#"{"engine": {"server_url": "ws://x", "max_retries": 5}}"#,
        )
        .unwrap();
        let config = Config::load(temp.path()).unwrap();
        assert_eq!(config.engine.max_retries, 5);
        assert_eq!(config.engine.retry_delay_ms, EngineConfig::default().retry_delay_ms);
        assert_eq!(config.api_url, default_api_url());
    }
}
