use crate::shutdown::{ShutdownSignal, cancelled};
use crate::store::{AcquiredValue, CoordinationStore, Lease, StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Default)]
struct Script {
    acquire_failures: usize,
    renew_results: VecDeque<StoreResult<()>>,
    acquisitions: Vec<Instant>,
    renewals: Vec<Instant>,
    releases: Vec<Lease>,
    values: HashMap<String, StoreResult<Vec<u8>>>,
    listing: Option<StoreResult<Vec<AcquiredValue>>>,
    batches: Vec<Vec<String>>,
    next_lease: i64,
}

/// Store double with scripted outcomes and a record of every call.
#[derive(Clone, Default)]
pub(crate) struct ScriptedStore {
    script: Arc<Mutex<Script>>,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_acquisitions(&self, times: usize) {
        self.script.lock().unwrap().acquire_failures = times;
    }

    pub fn fail_acquisitions_forever(&self) {
        self.fail_acquisitions(usize::MAX);
    }

    pub fn push_renewal(&self, result: StoreResult<()>) {
        self.script.lock().unwrap().renew_results.push_back(result);
    }

    pub fn set_value(&self, key: &str, value: StoreResult<Vec<u8>>) {
        self.script
            .lock()
            .unwrap()
            .values
            .insert(key.to_string(), value);
    }

    pub fn set_listing(&self, listing: StoreResult<Vec<AcquiredValue>>) {
        self.script.lock().unwrap().listing = Some(listing);
    }

    pub fn set_batches(&self, batches: Vec<Vec<String>>) {
        self.script.lock().unwrap().batches = batches;
    }

    pub fn acquisitions(&self) -> Vec<Instant> {
        self.script.lock().unwrap().acquisitions.clone()
    }

    pub fn renewals(&self) -> Vec<Instant> {
        self.script.lock().unwrap().renewals.clone()
    }

    pub fn releases(&self) -> Vec<Lease> {
        self.script.lock().unwrap().releases.clone()
    }
}

#[async_trait]
impl CoordinationStore for ScriptedStore {
    async fn acquire_or_renew(
        &self,
        key: &str,
        _payload: &[u8],
        ttl: Duration,
        held: Option<&Lease>,
    ) -> StoreResult<Lease> {
        let mut script = self.script.lock().unwrap();
        match held {
            Some(lease) => {
                script.renewals.push(Instant::now());
                match script.renew_results.pop_front().unwrap_or(Ok(())) {
                    Ok(()) => Ok(lease.clone()),
                    Err(err) => Err(err),
                }
            }
            None => {
                script.acquisitions.push(Instant::now());
                if script.acquire_failures > 0 {
                    script.acquire_failures -= 1;
                    return Err(StoreError::Unavailable("scripted failure".to_string()));
                }
                script.next_lease += 1;
                Ok(Lease {
                    key: key.to_string(),
                    id: script.next_lease,
                    ttl,
                })
            }
        }
    }

    async fn release(&self, lease: &Lease) -> StoreResult<()> {
        self.script.lock().unwrap().releases.push(lease.clone());
        Ok(())
    }

    async fn get_acquired_value(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.script
            .lock()
            .unwrap()
            .values
            .get(key)
            .cloned()
            .unwrap_or_else(|| Err(StoreError::NotFound(key.to_string())))
    }

    async fn list_acquired_values(&self, prefix: &str) -> StoreResult<Vec<AcquiredValue>> {
        self.script
            .lock()
            .unwrap()
            .listing
            .clone()
            .unwrap_or_else(|| Err(StoreError::NotFound(prefix.to_string())))
    }

    /// Emits the scripted batches in order and then closes, unless shutdown
    /// fires first. With no batches scripted the watch stays open until
    /// shutdown.
    fn watch_for_removed_keys_under(
        &self,
        _prefix: &str,
        mut shutdown: ShutdownSignal,
    ) -> mpsc::Receiver<Vec<String>> {
        let (tx, rx) = mpsc::channel(1);
        let batches = std::mem::take(&mut self.script.lock().unwrap().batches);

        tokio::spawn(async move {
            if batches.is_empty() {
                cancelled(&mut shutdown).await;
                return;
            }
            for batch in batches {
                tokio::select! {
                    _ = cancelled(&mut shutdown) => return,
                    sent = tx.send(batch) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        rx
    }
}
