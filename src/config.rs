use crate::store::etcd::{DEFAULT_WATCH_RECONNECT_ATTEMPTS, DEFAULT_WATCH_RECONNECT_INTERVAL};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lease TTL for cell presence keys.
pub const CELL_PRESENCE_TTL: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub presence: PresenceSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: String,
    pub namespace: String,
    pub etcd_endpoints: Vec<String>,
    pub watch_reconnect_ms: u64,
    pub watch_reconnect_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "etcd".to_string(),
            namespace: "rimio".to_string(),
            etcd_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            watch_reconnect_ms: DEFAULT_WATCH_RECONNECT_INTERVAL.as_millis() as u64,
            watch_reconnect_attempts: DEFAULT_WATCH_RECONNECT_ATTEMPTS,
        }
    }
}

impl StoreConfig {
    pub fn watch_reconnect(&self) -> Duration {
        Duration::from_millis(self.watch_reconnect_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceSettings {
    pub ttl_secs: u64,
    pub retry_interval_ms: u64,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            ttl_secs: CELL_PRESENCE_TTL.as_secs(),
            retry_interval_ms: DEFAULT_RETRY_INTERVAL.as_millis() as u64,
        }
    }
}

impl PresenceSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl PresenceConfig {
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("RIMIO_PRESENCE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("store.etcd_endpoints")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::PresenceError::Config(e.to_string()))?;

        let config: PresenceConfig = settings
            .try_deserialize()
            .map_err(|e| crate::error::PresenceError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.store.namespace.trim().trim_matches('/').is_empty() {
            return Err(crate::error::PresenceError::Config(
                "store namespace cannot be empty".to_string(),
            ));
        }

        if self.presence.ttl_secs == 0 {
            return Err(crate::error::PresenceError::Config(
                "presence ttl_secs must be positive".to_string(),
            ));
        }

        if self.presence.retry_interval_ms == 0 {
            return Err(crate::error::PresenceError::Config(
                "presence retry_interval_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_cell_presence_ttl() {
        let config = PresenceConfig::default();
        assert_eq!(config.presence.ttl(), CELL_PRESENCE_TTL);
        assert_eq!(config.presence.retry_interval(), DEFAULT_RETRY_INTERVAL);
        assert_eq!(config.store.backend, "etcd");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn loads_yaml_file_with_partial_sections() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("presence.yaml");
        let mut file = std::fs::File::create(&path).expect("create");
        writeln!(
            file,
            "store:\n  backend: memory\n  namespace: edge\npresence:\n  retry_interval_ms: 250"
        )
        .expect("write");

        let config = PresenceConfig::from_file(path.to_str().expect("utf-8 path")).expect("load");
        assert_eq!(config.store.backend, "memory");
        assert_eq!(config.store.namespace, "edge");
        assert_eq!(config.presence.retry_interval(), Duration::from_millis(250));
        assert_eq!(config.presence.ttl(), CELL_PRESENCE_TTL);
    }

    #[test]
    fn rejects_zero_ttl() {
        let mut config = PresenceConfig::default();
        config.presence.ttl_secs = 0;
        assert!(config.validate().is_err());
    }
}
