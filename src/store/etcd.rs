use crate::shutdown::{ShutdownSignal, cancelled};
use crate::store::{AcquiredValue, CoordinationStore, Lease, StoreError, StoreResult};
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper,
    PutOptions, Txn, TxnOp, WatchOptions,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

pub const DEFAULT_WATCH_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_WATCH_RECONNECT_ATTEMPTS: u32 = 5;

/// etcd-backed coordination store
pub struct EtcdStore {
    client: Client,
    keep_alives: KeepAlives<KeepAlive>,
    reconnect_interval: Duration,
    reconnect_attempts: u32,
}

/// Open keep-alive stream for one lease.
struct KeepAlive {
    keeper: LeaseKeeper,
    responses: LeaseKeepAliveStream,
}

/// Keep-alive streams parked between renewals, keyed by lease id. A renewal
/// checks its stream out and only returns it after a successful round trip,
/// so a broken stream is reopened on the next attempt.
struct KeepAlives<T> {
    parked: Mutex<HashMap<i64, T>>,
}

impl<T> KeepAlives<T> {
    fn new() -> Self {
        Self {
            parked: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, T>> {
        self.parked.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_out(&self, lease_id: i64) -> Option<T> {
        self.lock().remove(&lease_id)
    }

    fn check_in(&self, lease_id: i64, stream: T) {
        self.lock().insert(lease_id, stream);
    }

    fn forget(&self, lease_id: i64) {
        self.lock().remove(&lease_id);
    }
}

impl EtcdStore {
    pub async fn new(endpoints: &[String]) -> StoreResult<Self> {
        let client = Client::connect(endpoints, None).await?;

        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            keep_alives: KeepAlives::new(),
            reconnect_interval: DEFAULT_WATCH_RECONNECT_INTERVAL,
            reconnect_attempts: DEFAULT_WATCH_RECONNECT_ATTEMPTS,
        }
    }

    /// Pause between watch resyncs, and how many consecutive failed resyncs a
    /// watch tolerates before it closes.
    pub fn with_watch_reconnect(mut self, interval: Duration, attempts: u32) -> Self {
        self.reconnect_interval = interval;
        self.reconnect_attempts = attempts.max(1);
        self
    }

    async fn acquire(&self, key: &str, payload: &[u8], ttl: Duration) -> StoreResult<Lease> {
        let mut client = self.client.clone();
        let grant = client.lease_grant(lease_ttl_secs(ttl), None).await?;
        let lease_id = grant.id();

        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                key,
                payload.to_vec(),
                Some(PutOptions::new().with_lease(lease_id)),
            )]);

        let committed = match client.txn(txn).await {
            Ok(resp) => resp.succeeded(),
            Err(err) => {
                let _ = client.lease_revoke(lease_id).await;
                return Err(err.into());
            }
        };

        if !committed {
            let _ = client.lease_revoke(lease_id).await;
            return Err(StoreError::Conflict(key.to_string()));
        }

        Ok(Lease {
            key: key.to_string(),
            id: lease_id,
            ttl,
        })
    }

    async fn renew(&self, lease: &Lease) -> StoreResult<Lease> {
        let mut client = self.client.clone();
        let mut stream = match self.keep_alives.check_out(lease.id) {
            Some(stream) => stream,
            None => {
                let (keeper, responses) = client.lease_keep_alive(lease.id).await?;
                KeepAlive { keeper, responses }
            }
        };

        stream.keeper.keep_alive().await?;
        match stream.responses.message().await? {
            Some(resp) if resp.ttl() > 0 => {}
            _ => return Err(StoreError::LeaseExpired(lease.key.clone())),
        }

        let resp = client.get(lease.key.as_str(), None).await?;
        let bound = resp.kvs().first().map(|kv| kv.lease()) == Some(lease.id);
        if !bound {
            let _ = client.lease_revoke(lease.id).await;
            return Err(StoreError::LeaseLost(lease.key.clone()));
        }

        self.keep_alives.check_in(lease.id, stream);
        Ok(lease.clone())
    }
}

fn lease_ttl_secs(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1) as i64
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn acquire_or_renew(
        &self,
        key: &str,
        payload: &[u8],
        ttl: Duration,
        held: Option<&Lease>,
    ) -> StoreResult<Lease> {
        match held {
            Some(lease) => self.renew(lease).await,
            None => self.acquire(key, payload, ttl).await,
        }
    }

    async fn release(&self, lease: &Lease) -> StoreResult<()> {
        self.keep_alives.forget(lease.id);
        let mut client = self.client.clone();
        client.lease_revoke(lease.id).await?;

        Ok(())
    }

    async fn get_acquired_value(&self, key: &str) -> StoreResult<Vec<u8>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;

        match resp.kvs().first() {
            Some(kv) if kv.lease() != 0 => Ok(kv.value().to_vec()),
            _ => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn list_acquired_values(&self, prefix: &str) -> StoreResult<Vec<AcquiredValue>> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        if resp.kvs().is_empty() {
            return Err(StoreError::NotFound(prefix.to_string()));
        }

        let mut values = Vec::new();
        for kv in resp.kvs() {
            if kv.lease() == 0 {
                continue;
            }
            let Ok(key) = kv.key_str() else {
                tracing::warn!(prefix = %prefix, "skipping etcd key that is not valid utf-8");
                continue;
            };
            values.push(AcquiredValue {
                key: key.to_string(),
                value: kv.value().to_vec(),
            });
        }

        Ok(values)
    }

    fn watch_for_removed_keys_under(
        &self,
        prefix: &str,
        shutdown: ShutdownSignal,
    ) -> mpsc::Receiver<Vec<String>> {
        let (tx, rx) = mpsc::channel(1);
        let watch = RemovalWatch {
            client: self.client.clone(),
            prefix: prefix.to_string(),
            reconnect_interval: self.reconnect_interval,
            reconnect_attempts: self.reconnect_attempts,
            known: KnownKeys::default(),
            tx,
        };
        tokio::spawn(watch.run(shutdown));

        rx
    }
}

enum Follow {
    Stop,
    Resync,
}

/// Keys a removal watch has seen under its prefix.
#[derive(Debug, Default)]
struct KnownKeys {
    keys: BTreeSet<String>,
    seeded: bool,
}

impl KnownKeys {
    /// Replace the known set with a fresh snapshot. Returns the keys that
    /// vanished since the previous one; the first snapshot only seeds.
    fn resync(&mut self, current: BTreeSet<String>) -> Vec<String> {
        let vanished = if self.seeded {
            self.keys.difference(&current).cloned().collect()
        } else {
            Vec::new()
        };
        self.keys = current;
        self.seeded = true;
        vanished
    }

    /// Apply watched events in order. Returns deleted keys that were known,
    /// each exactly once.
    fn apply<'a>(&mut self, events: impl IntoIterator<Item = (EventType, &'a str)>) -> Vec<String> {
        let mut removed = Vec::new();
        for (event_type, key) in events {
            match event_type {
                EventType::Put => {
                    self.keys.insert(key.to_string());
                }
                EventType::Delete => {
                    if self.keys.remove(key) {
                        removed.push(key.to_string());
                    }
                }
            }
        }
        removed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResyncReason {
    Compacted(i64),
    Canceled,
}

fn resync_reason(compact_revision: i64, canceled: bool) -> Option<ResyncReason> {
    if compact_revision > 0 {
        Some(ResyncReason::Compacted(compact_revision))
    } else if canceled {
        Some(ResyncReason::Canceled)
    } else {
        None
    }
}

/// Relays etcd delete events under a prefix. Keeps the set of keys it has seen
/// so that a resync after a dropped stream or a compaction reports exactly the
/// keys that vanished in between, and a key is never reported twice.
struct RemovalWatch {
    client: Client,
    prefix: String,
    reconnect_interval: Duration,
    reconnect_attempts: u32,
    known: KnownKeys,
    tx: mpsc::Sender<Vec<String>>,
}

impl RemovalWatch {
    async fn run(mut self, mut shutdown: ShutdownSignal) {
        let mut failures = 0u32;

        loop {
            let snapshot = tokio::select! {
                _ = cancelled(&mut shutdown) => return,
                _ = self.tx.closed() => return,
                snapshot = self.snapshot() => snapshot,
            };

            match snapshot {
                Ok((keys, revision)) => {
                    failures = 0;
                    let vanished = self.known.resync(keys);
                    if !vanished.is_empty() && !self.publish(vanished, &mut shutdown).await {
                        return;
                    }

                    match self.follow(revision + 1, &mut shutdown).await {
                        Follow::Stop => return,
                        Follow::Resync => {}
                    }
                }
                Err(err) => {
                    failures += 1;
                    tracing::warn!(
                        prefix = %self.prefix,
                        attempt = failures,
                        error = %err,
                        "failed to snapshot keys for removal watch"
                    );
                    if failures >= self.reconnect_attempts {
                        tracing::error!(prefix = %self.prefix, "giving up on removal watch");
                        return;
                    }
                }
            }

            tokio::select! {
                _ = cancelled(&mut shutdown) => return,
                _ = self.tx.closed() => return,
                _ = tokio::time::sleep(self.reconnect_interval) => {}
            }
        }
    }

    async fn snapshot(&self) -> StoreResult<(BTreeSet<String>, i64)> {
        let mut client = self.client.clone();
        let resp = client
            .get(
                self.prefix.as_str(),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await?;

        let revision = resp
            .header()
            .map(|header| header.revision())
            .ok_or_else(|| StoreError::Unavailable("etcd response without header".to_string()))?;

        let keys = resp
            .kvs()
            .iter()
            .filter_map(|kv| kv.key_str().ok().map(str::to_string))
            .collect();

        Ok((keys, revision))
    }

    async fn follow(&mut self, start_revision: i64, shutdown: &mut ShutdownSignal) -> Follow {
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(start_revision);
        let mut client = self.client.clone();
        let (mut watcher, mut stream) = match client.watch(self.prefix.as_str(), Some(options)).await
        {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(prefix = %self.prefix, error = %err, "failed to open etcd watch");
                return Follow::Resync;
            }
        };

        loop {
            let message = tokio::select! {
                _ = cancelled(shutdown) => {
                    let _ = watcher.cancel().await;
                    return Follow::Stop;
                }
                _ = self.tx.closed() => {
                    let _ = watcher.cancel().await;
                    return Follow::Stop;
                }
                message = stream.message() => message,
            };

            let resp = match message {
                Ok(Some(resp)) => resp,
                Ok(None) => {
                    tracing::warn!(prefix = %self.prefix, "etcd watch stream ended, resyncing");
                    return Follow::Resync;
                }
                Err(err) => {
                    tracing::warn!(prefix = %self.prefix, error = %err, "etcd watch failed, resyncing");
                    return Follow::Resync;
                }
            };

            match resync_reason(resp.compact_revision(), resp.canceled()) {
                Some(ResyncReason::Compacted(compact_revision)) => {
                    tracing::warn!(
                        prefix = %self.prefix,
                        compact_revision,
                        "etcd watch compacted, resyncing"
                    );
                    return Follow::Resync;
                }
                Some(ResyncReason::Canceled) => {
                    tracing::warn!(prefix = %self.prefix, "etcd watch canceled by server, resyncing");
                    return Follow::Resync;
                }
                None => {}
            }

            let removed = self.known.apply(resp.events().iter().filter_map(|event| {
                let key = event.kv()?.key_str().ok()?;
                Some((event.event_type(), key))
            }));

            if !removed.is_empty() && !self.publish(removed, shutdown).await {
                let _ = watcher.cancel().await;
                return Follow::Stop;
            }
        }
    }

    async fn publish(&self, keys: Vec<String>, shutdown: &mut ShutdownSignal) -> bool {
        tokio::select! {
            _ = cancelled(shutdown) => false,
            sent = self.tx.send(keys) => sent.is_ok(),
        }
    }
}
