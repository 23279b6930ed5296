use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What to do when a peer presents an identity key different from the one
/// already trusted for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrustPolicy {
    /// Trust on first use and overwrite on change. The change is logged and
    /// reported to the caller.
    #[default]
    AcceptChanged,
    /// Trust on first use, refuse a changed key until it is cleared.
    RejectChanged,
}

/// Engine tunables. Every field has a default so partial JSON files load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// WebSocket endpoint of the message server
    pub server_url: String,
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    /// How long a drain waits for the transport before treating the client as offline
    pub wait_for_connection_ms: u64,
    pub retry_delay_ms: u64,
    pub max_retries: u32,
    pub prekey_batch_size: u32,
    pub trust_policy: TrustPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080/ws".to_string(),
            connect_timeout_ms: 8_000,
            heartbeat_interval_ms: 25_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 15_000,
            wait_for_connection_ms: 3_000,
            retry_delay_ms: 2_000,
            max_retries: 3,
            prekey_batch_size: 100,
            trust_policy: TrustPolicy::AcceptChanged,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("reconnect_base_ms", self.reconnect_base_ms),
            ("wait_for_connection_ms", self.wait_for_connection_ms),
            ("retry_delay_ms", self.retry_delay_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(Error::Config(format!("{} must be positive", name)));
            }
        }
        if self.reconnect_max_ms < self.reconnect_base_ms {
            return Err(Error::Config(
                "reconnect_max_ms must not be below reconnect_base_ms".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn wait_for_connection(&self) -> Duration {
        Duration::from_millis(self.wait_for_connection_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(
            &path,
            r#"{"server_url":"wss://chat.example/ws","max_retries":5,"trust_policy":"reject-changed"}"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.server_url, "wss://chat.example/ws");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.trust_policy, TrustPolicy::RejectChanged);
        assert_eq!(config.connect_timeout(), Duration::from_secs(8));
        assert_eq!(config.reconnect_max(), Duration::from_secs(15));
    }

    #[test]
    fn rejects_inverted_backoff_bounds() {
        let config = EngineConfig {
            reconnect_base_ms: 20_000,
            reconnect_max_ms: 1_000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_zero_timeouts() {
        let config = EngineConfig {
            retry_delay_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(EngineConfig::default().validate().is_ok());
    }
}
