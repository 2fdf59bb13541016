//! Coordination store boundary for cell presence
//!
//! Provides a trait-based abstraction over the store that owns leases
//! (etcd, or the embedded in-memory store).

pub mod etcd;
pub mod factory;
pub mod memory;
#[cfg(test)]
pub(crate) mod testing;

use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub use etcd::EtcdStore;
pub use factory::StoreBuilder;
pub use memory::MemoryStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key already held by another lease: {0}")]
    Conflict(String),

    #[error("lease expired for key: {0}")]
    LeaseExpired(String),

    #[error("key no longer bound to lease: {0}")]
    LeaseLost(String),
}

impl From<etcd_client::Error> for StoreError {
    fn from(err: etcd_client::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Handle to a store-owned lease binding one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub id: i64,
    pub ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// Capabilities the presence subsystem needs from a coordination store.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Acquire `key` under a fresh lease when `held` is `None`, otherwise renew
    /// `held` and confirm the key is still bound to it.
    async fn acquire_or_renew(
        &self,
        key: &str,
        payload: &[u8],
        ttl: Duration,
        held: Option<&Lease>,
    ) -> StoreResult<Lease>;

    /// Give up a lease, removing the key it binds.
    async fn release(&self, lease: &Lease) -> StoreResult<()>;

    /// Value of a key currently bound to a lease.
    async fn get_acquired_value(&self, key: &str) -> StoreResult<Vec<u8>>;

    /// Every lease-bound value under `prefix`. `NotFound` when nothing at all
    /// exists under the prefix.
    async fn list_acquired_values(&self, prefix: &str) -> StoreResult<Vec<AcquiredValue>>;

    /// Stream of removed-key batches under `prefix`. The receiver closes when
    /// `shutdown` fires, the receiver is dropped on the other side, or the
    /// watch can no longer be continued.
    fn watch_for_removed_keys_under(
        &self,
        prefix: &str,
        shutdown: ShutdownSignal,
    ) -> mpsc::Receiver<Vec<String>>;
}
