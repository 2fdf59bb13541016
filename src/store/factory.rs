use super::{CoordinationStore, etcd::EtcdStore, memory::MemoryStore};
use crate::config::StoreConfig;
use crate::error::{PresenceError, Result};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct StoreBuilder {
    backend: Option<String>,
    etcd_endpoints: Option<Vec<String>>,
    watch_reconnect_interval: Option<Duration>,
    watch_reconnect_attempts: Option<u32>,
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new()
            .backend(config.backend.clone())
            .etcd_endpoints(config.etcd_endpoints.clone())
            .watch_reconnect(config.watch_reconnect(), config.watch_reconnect_attempts)
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn etcd_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.etcd_endpoints = Some(endpoints);
        self
    }

    pub fn watch_reconnect(mut self, interval: Duration, attempts: u32) -> Self {
        self.watch_reconnect_interval = Some(interval);
        self.watch_reconnect_attempts = Some(attempts);
        self
    }

    fn resolve_backend(&self) -> Result<String> {
        let backend = self
            .backend
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if backend.is_empty() {
            return Err(PresenceError::Config(
                "store backend cannot be empty".to_string(),
            ));
        }

        Ok(backend)
    }

    pub async fn build(&self) -> Result<Arc<dyn CoordinationStore>> {
        let backend = self.resolve_backend()?;

        match backend.as_str() {
            "etcd" => {
                let endpoints: Vec<String> = self
                    .etcd_endpoints
                    .clone()
                    .ok_or_else(|| {
                        PresenceError::Config(
                            "etcd endpoints are required for etcd backend".to_string(),
                        )
                    })?
                    .into_iter()
                    .map(|endpoint| endpoint.trim().to_string())
                    .filter(|endpoint| !endpoint.is_empty())
                    .collect();

                if endpoints.is_empty() {
                    return Err(PresenceError::Config(
                        "etcd endpoints cannot be empty for etcd backend".to_string(),
                    ));
                }

                let mut store = EtcdStore::new(&endpoints).await?;
                if let (Some(interval), Some(attempts)) =
                    (self.watch_reconnect_interval, self.watch_reconnect_attempts)
                {
                    store = store.with_watch_reconnect(interval, attempts);
                }
                Ok(Arc::new(store))
            }
            "memory" => Ok(Arc::new(MemoryStore::new())),
            other => Err(PresenceError::Config(format!(
                "unsupported store backend: {}",
                other
            ))),
        }
    }
}
