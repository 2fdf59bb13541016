use crate::shutdown::{ShutdownSignal, cancelled};
use crate::store::{AcquiredValue, CoordinationStore, Lease, StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const REAP_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    lease: Option<i64>,
    deadline: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

#[derive(Debug)]
struct State {
    entries: HashMap<String, Entry>,
    next_lease: i64,
    available: bool,
    /// One queue per open watch. Unbounded so a stalled subscriber never
    /// loses removal batches.
    watchers: Vec<mpsc::UnboundedSender<Vec<String>>>,
}

impl State {
    fn notify(&mut self, keys: Vec<String>) {
        self.watchers.retain(|watcher| watcher.send(keys.clone()).is_ok());
    }
}

/// In-process coordination store with lease expiry, for single-process
/// deployments and tests.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                entries: HashMap::new(),
                next_lease: 1,
                available: true,
                watchers: Vec::new(),
            })),
        }
    }

    /// Toggle availability; while unavailable every call fails with
    /// `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Write a value that is not bound to any lease.
    pub fn put_unleased(&self, key: &str, value: &[u8]) {
        self.lock().entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                lease: None,
                deadline: None,
            },
        );
    }

    /// Number of removal watches still open.
    pub fn watcher_count(&self) -> usize {
        let mut state = self.lock();
        state.watchers.retain(|watcher| !watcher.is_closed());
        state.watchers.len()
    }

    /// Forcibly delete a key, notifying watchers.
    pub fn remove(&self, key: &str) -> bool {
        let mut state = self.lock();
        let removed = state.entries.remove(key).is_some();
        if removed {
            state.notify(vec![key.to_string()]);
        }
        removed
    }

    /// Drop every entry whose lease deadline has passed, notifying watchers with
    /// one batch.
    pub fn reap_expired(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        let mut expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.entries.remove(key);
        }

        if !expired.is_empty() {
            expired.sort();
            state.notify(expired);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.lock().available {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".to_string()))
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn acquire_or_renew(
        &self,
        key: &str,
        payload: &[u8],
        ttl: Duration,
        held: Option<&Lease>,
    ) -> StoreResult<Lease> {
        self.ensure_available()?;
        self.reap_expired();

        let mut state = self.lock();
        let deadline = Instant::now() + ttl;

        match held {
            Some(lease) => match state.entries.get_mut(key) {
                Some(entry) if entry.lease == Some(lease.id) => {
                    entry.deadline = Some(deadline);
                    Ok(lease.clone())
                }
                Some(_) => Err(StoreError::LeaseLost(key.to_string())),
                None => Err(StoreError::LeaseExpired(key.to_string())),
            },
            None => {
                if state.entries.contains_key(key) {
                    return Err(StoreError::Conflict(key.to_string()));
                }

                let id = state.next_lease;
                state.next_lease += 1;
                state.entries.insert(
                    key.to_string(),
                    Entry {
                        value: payload.to_vec(),
                        lease: Some(id),
                        deadline: Some(deadline),
                    },
                );

                Ok(Lease {
                    key: key.to_string(),
                    id,
                    ttl,
                })
            }
        }
    }

    async fn release(&self, lease: &Lease) -> StoreResult<()> {
        self.ensure_available()?;

        let mut state = self.lock();
        if let Some(entry) = state.entries.get(&lease.key)
            && entry.lease == Some(lease.id)
        {
            state.entries.remove(&lease.key);
            state.notify(vec![lease.key.clone()]);
        }

        Ok(())
    }

    async fn get_acquired_value(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.ensure_available()?;
        self.reap_expired();

        match self.lock().entries.get(key) {
            Some(entry) if entry.lease.is_some() => Ok(entry.value.clone()),
            _ => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn list_acquired_values(&self, prefix: &str) -> StoreResult<Vec<AcquiredValue>> {
        self.ensure_available()?;
        self.reap_expired();

        let state = self.lock();
        let mut under_prefix = state
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .peekable();

        if under_prefix.peek().is_none() {
            return Err(StoreError::NotFound(prefix.to_string()));
        }

        Ok(under_prefix
            .filter(|(_, entry)| entry.lease.is_some())
            .map(|(key, entry)| AcquiredValue {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect())
    }

    fn watch_for_removed_keys_under(
        &self,
        prefix: &str,
        mut shutdown: ShutdownSignal,
    ) -> mpsc::Receiver<Vec<String>> {
        let (tx, rx) = mpsc::channel(1);
        let (watcher, mut removals) = mpsc::unbounded_channel();
        self.lock().watchers.push(watcher);
        let store = self.clone();
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            let mut reaper = tokio::time::interval(REAP_INTERVAL);
            loop {
                let batch = tokio::select! {
                    _ = cancelled(&mut shutdown) => return,
                    _ = tx.closed() => return,
                    _ = reaper.tick() => {
                        store.reap_expired();
                        continue;
                    }
                    batch = removals.recv() => batch,
                };

                let Some(keys) = batch else {
                    tracing::debug!(prefix = %prefix, "memory store dropped removal watch");
                    return;
                };

                let matching: Vec<String> = keys
                    .into_iter()
                    .filter(|key| key.starts_with(&prefix))
                    .collect();
                if matching.is_empty() {
                    continue;
                }

                tokio::select! {
                    _ = cancelled(&mut shutdown) => return,
                    sent = tx.send(matching) => {
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
