//! Keeps one cell's presence key acquired for as long as the task runs.
//!
//! The maintainer is a two-state loop. While unheld it attempts acquisition
//! once per retry interval; while held it renews every third of the TTL and
//! drops back to unheld on any renewal failure. Store errors never end the
//! loop, only shutdown does.

use crate::shutdown::{ShutdownSignal, cancelled, shutdown_channel};
use crate::store::{CoordinationStore, Lease};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Unheld,
    Held,
    Stopped,
}

enum LeaseState {
    Unheld,
    Held(Lease),
}

enum Step {
    Next(LeaseState),
    Stop(LeaseState),
}

pub struct PresenceMaintainer {
    store: Arc<dyn CoordinationStore>,
    key: String,
    payload: Vec<u8>,
    ttl: Duration,
    retry_interval: Duration,
}

impl PresenceMaintainer {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        key: impl Into<String>,
        payload: Vec<u8>,
        ttl: Duration,
        retry_interval: Duration,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            payload,
            ttl,
            retry_interval,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn renew_interval(&self) -> Duration {
        (self.ttl / 3).max(Duration::from_millis(1))
    }

    /// Run the maintainer in a background task.
    pub fn spawn(self) -> PresenceHandle {
        let (shutdown_tx, shutdown_rx) = shutdown_channel();
        let (status_tx, status_rx) = watch::channel(PresenceStatus::Unheld);
        let task = tokio::spawn(self.run(shutdown_rx, status_tx));

        PresenceHandle {
            shutdown_tx,
            status_rx,
            task,
        }
    }

    /// Drive the acquire/renew loop until `shutdown` fires.
    pub async fn run(self, mut shutdown: ShutdownSignal, status: watch::Sender<PresenceStatus>) {
        let mut state = LeaseState::Unheld;

        loop {
            let step = match state {
                LeaseState::Unheld => self.acquire(&mut shutdown, &status).await,
                LeaseState::Held(lease) => self.renew(lease, &mut shutdown, &status).await,
            };
            match step {
                Step::Next(next) => state = next,
                Step::Stop(last) => {
                    state = last;
                    break;
                }
            }
        }

        if let LeaseState::Held(lease) = state {
            match self.store.release(&lease).await {
                Ok(()) => tracing::info!(key = %self.key, lease_id = lease.id, "presence released"),
                Err(err) => tracing::debug!(
                    key = %self.key,
                    lease_id = lease.id,
                    error = %err,
                    "failed to release presence"
                ),
            }
        }

        status.send_replace(PresenceStatus::Stopped);
    }

    async fn acquire(
        &self,
        shutdown: &mut ShutdownSignal,
        status: &watch::Sender<PresenceStatus>,
    ) -> Step {
        let mut pending = self
            .store
            .acquire_or_renew(&self.key, &self.payload, self.ttl, None);
        let attempt = tokio::select! {
            attempt = &mut pending => attempt,
            _ = cancelled(shutdown) => {
                // The store may already have committed the key; wait out the
                // reply for at most one retry interval so it can be released.
                return match tokio::time::timeout(self.retry_interval, pending).await {
                    Ok(Ok(lease)) => Step::Stop(LeaseState::Held(lease)),
                    _ => Step::Stop(LeaseState::Unheld),
                };
            }
        };

        match attempt {
            Ok(lease) => {
                tracing::info!(key = %self.key, lease_id = lease.id, "presence acquired");
                status.send_replace(PresenceStatus::Held);
                Step::Next(LeaseState::Held(lease))
            }
            Err(err) => {
                tracing::warn!(
                    key = %self.key,
                    error = %err,
                    retry_in_ms = self.retry_interval.as_millis() as u64,
                    "failed to acquire presence"
                );
                self.after_retry_interval(shutdown).await
            }
        }
    }

    async fn renew(
        &self,
        lease: Lease,
        shutdown: &mut ShutdownSignal,
        status: &watch::Sender<PresenceStatus>,
    ) -> Step {
        let due = tokio::select! {
            _ = cancelled(shutdown) => false,
            _ = tokio::time::sleep(self.renew_interval()) => true,
        };
        if !due {
            return Step::Stop(LeaseState::Held(lease));
        }

        let renewal = tokio::select! {
            _ = cancelled(shutdown) => None,
            renewal = self.store.acquire_or_renew(&self.key, &self.payload, self.ttl, Some(&lease)) => Some(renewal),
        };

        match renewal {
            None => Step::Stop(LeaseState::Held(lease)),
            Some(Ok(renewed)) => Step::Next(LeaseState::Held(renewed)),
            Some(Err(err)) => {
                tracing::warn!(
                    key = %self.key,
                    lease_id = lease.id,
                    error = %err,
                    "lost presence"
                );
                status.send_replace(PresenceStatus::Unheld);
                self.after_retry_interval(shutdown).await
            }
        }
    }

    async fn after_retry_interval(&self, shutdown: &mut ShutdownSignal) -> Step {
        tokio::select! {
            _ = cancelled(shutdown) => Step::Stop(LeaseState::Unheld),
            _ = tokio::time::sleep(self.retry_interval) => Step::Next(LeaseState::Unheld),
        }
    }
}

/// Handle to a running maintainer. Dropping it cancels the task.
pub struct PresenceHandle {
    shutdown_tx: watch::Sender<bool>,
    status_rx: watch::Receiver<PresenceStatus>,
    task: JoinHandle<()>,
}

impl PresenceHandle {
    pub fn status(&self) -> PresenceStatus {
        *self.status_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PresenceStatus> {
        self.status_rx.clone()
    }

    /// Resolves once the presence is held. Returns `false` if the maintainer
    /// stopped first.
    pub async fn wait_until_held(&self) -> bool {
        let mut status = self.status_rx.clone();
        match status
            .wait_for(|s| matches!(s, PresenceStatus::Held | PresenceStatus::Stopped))
            .await
        {
            Ok(s) => *s == PresenceStatus::Held,
            Err(_) => false,
        }
    }

    /// Signals the maintainer to release its lease and exit.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Waits for the maintainer task to terminate.
    pub async fn wait(self) {
        let PresenceHandle {
            shutdown_tx, task, ..
        } = self;
        let _ = task.await;
        drop(shutdown_tx);
    }

    pub async fn shutdown(self) {
        self.request_shutdown();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::ScriptedStore;
    use crate::store::{AcquiredValue, MemoryStore, StoreError, StoreResult};
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    const TTL: Duration = Duration::from_secs(9);
    const RETRY: Duration = Duration::from_secs(2);

    fn maintainer(store: &ScriptedStore) -> PresenceMaintainer {
        PresenceMaintainer::new(
            Arc::new(store.clone()),
            "/rimio/v1/cells/cell-1",
            b"{}".to_vec(),
            TTL,
            RETRY,
        )
    }

    fn assert_at(at: Instant, start: Instant, expected: Duration) {
        let elapsed = at.duration_since(start);
        let drift = elapsed.abs_diff(expected);
        assert!(
            drift <= Duration::from_millis(5),
            "expected ~{expected:?} after start, got {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn acquires_after_three_failed_attempts() {
        let store = ScriptedStore::new();
        store.fail_acquisitions(3);
        let start = Instant::now();

        let handle = maintainer(&store).spawn();
        assert!(handle.wait_until_held().await);
        assert_at(Instant::now(), start, RETRY * 3);

        let attempts = store.acquisitions();
        assert_eq!(attempts.len(), 4);
        for (i, attempt) in attempts.iter().enumerate() {
            assert_at(*attempt, start, RETRY * i as u32);
        }

        handle.shutdown().await;
        assert_eq!(store.releases().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn renews_every_third_of_ttl_while_held() {
        let store = ScriptedStore::new();
        let start = Instant::now();
        let handle = maintainer(&store).spawn();
        assert!(handle.wait_until_held().await);

        tokio::time::sleep(TTL + Duration::from_millis(100)).await;
        let renewals = store.renewals();
        assert_eq!(renewals.len(), 3);
        for (i, renewal) in renewals.iter().enumerate() {
            assert_at(*renewal, start, TTL / 3 * (i as u32 + 1));
        }
        assert_eq!(store.acquisitions().len(), 1);
        assert_eq!(handle.status(), PresenceStatus::Held);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_is_reacquired_after_retry_interval() {
        let store = ScriptedStore::new();
        store.push_renewal(Err(StoreError::LeaseExpired(
            "/rimio/v1/cells/cell-1".to_string(),
        )));
        let start = Instant::now();

        let handle = maintainer(&store).spawn();
        let mut status = handle.subscribe();
        status.wait_for(|s| *s == PresenceStatus::Held).await.unwrap();
        status.wait_for(|s| *s == PresenceStatus::Unheld).await.unwrap();
        status.wait_for(|s| *s == PresenceStatus::Held).await.unwrap();

        let attempts = store.acquisitions();
        assert_eq!(attempts.len(), 2);
        assert_at(attempts[1], start, TTL / 3 + RETRY);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_attempts_within_one_interval() {
        let store = ScriptedStore::new();
        store.fail_acquisitions_forever();

        let handle = maintainer(&store).spawn();
        tokio::time::sleep(RETRY * 2 + Duration::from_millis(500)).await;
        let before = store.acquisitions().len();
        assert_eq!(before, 3);

        handle.request_shutdown();
        tokio::time::timeout(RETRY, handle.wait())
            .await
            .expect("maintainer should stop within one retry interval");

        tokio::time::sleep(RETRY * 3).await;
        assert_eq!(store.acquisitions().len(), before);
        assert!(store.releases().is_empty());
    }

    /// Commits acquisitions immediately but answers only after `delay`.
    struct SlowReplyStore {
        inner: MemoryStore,
        delay: Duration,
    }

    #[async_trait]
    impl CoordinationStore for SlowReplyStore {
        async fn acquire_or_renew(
            &self,
            key: &str,
            payload: &[u8],
            ttl: Duration,
            held: Option<&Lease>,
        ) -> StoreResult<Lease> {
            let lease = self.inner.acquire_or_renew(key, payload, ttl, held).await;
            tokio::time::sleep(self.delay).await;
            lease
        }

        async fn release(&self, lease: &Lease) -> StoreResult<()> {
            self.inner.release(lease).await
        }

        async fn get_acquired_value(&self, key: &str) -> StoreResult<Vec<u8>> {
            self.inner.get_acquired_value(key).await
        }

        async fn list_acquired_values(&self, prefix: &str) -> StoreResult<Vec<AcquiredValue>> {
            self.inner.list_acquired_values(prefix).await
        }

        fn watch_for_removed_keys_under(
            &self,
            prefix: &str,
            shutdown: ShutdownSignal,
        ) -> mpsc::Receiver<Vec<String>> {
            self.inner.watch_for_removed_keys_under(prefix, shutdown)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_acquisition_releases_committed_key() {
        let inner = MemoryStore::new();
        let store = SlowReplyStore {
            inner: inner.clone(),
            delay: Duration::from_secs(1),
        };
        let handle = PresenceMaintainer::new(
            Arc::new(store),
            "/rimio/v1/cells/cell-1",
            b"{}".to_vec(),
            TTL,
            RETRY,
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(inner.get_acquired_value("/rimio/v1/cells/cell-1").await.is_ok());

        let mut status = handle.subscribe();
        tokio::time::timeout(RETRY, handle.shutdown())
            .await
            .expect("maintainer should stop within one retry interval");
        assert_eq!(*status.borrow_and_update(), PresenceStatus::Stopped);

        assert_eq!(
            inner
                .get_acquired_value("/rimio/v1/cells/cell-1")
                .await
                .unwrap_err(),
            StoreError::NotFound("/rimio/v1/cells/cell-1".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_cancels_and_releases() {
        let store = ScriptedStore::new();
        let handle = maintainer(&store).spawn();
        assert!(handle.wait_until_held().await);
        let mut status = handle.subscribe();

        drop(handle);
        status
            .wait_for(|s| *s == PresenceStatus::Stopped)
            .await
            .unwrap();
        assert_eq!(store.releases().len(), 1);
    }
}
