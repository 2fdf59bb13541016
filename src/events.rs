use crate::schema::cell_id_from_key;
use crate::shutdown::{ShutdownSignal, cancelled};
use crate::store::CoordinationStore;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellEventType {
    CellDisappeared,
}

/// Cells whose presence keys vanished in one store notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellDisappearedEvent {
    pub cell_ids: Vec<String>,
}

impl CellDisappearedEvent {
    pub fn from_keys(keys: &[String]) -> Self {
        Self {
            cell_ids: keys.iter().map(|key| cell_id_from_key(key)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellEvent {
    Disappeared(CellDisappearedEvent),
}

impl CellEvent {
    pub fn event_type(&self) -> CellEventType {
        match self {
            CellEvent::Disappeared(_) => CellEventType::CellDisappeared,
        }
    }

    pub fn cell_ids(&self) -> &[String] {
        match self {
            CellEvent::Disappeared(event) => &event.cell_ids,
        }
    }
}

/// Relay removed-key batches under `prefix` as cell events. The returned
/// receiver closes when the underlying watch closes or `shutdown` fires.
pub fn cell_events(
    store: &Arc<dyn CoordinationStore>,
    prefix: &str,
    mut shutdown: ShutdownSignal,
) -> mpsc::Receiver<CellEvent> {
    let (tx, rx) = mpsc::channel(1);
    let mut disappeared = store.watch_for_removed_keys_under(prefix, shutdown.clone());
    let prefix = prefix.to_string();

    tokio::spawn(async move {
        loop {
            let keys = tokio::select! {
                _ = cancelled(&mut shutdown) => break,
                _ = tx.closed() => break,
                keys = disappeared.recv() => match keys {
                    Some(keys) => keys,
                    None => break,
                },
            };

            let event = CellDisappearedEvent::from_keys(&keys);
            tracing::info!(prefix = %prefix, cell_ids = ?event.cell_ids, "cell disappeared");

            tokio::select! {
                _ = cancelled(&mut shutdown) => break,
                sent = tx.send(CellEvent::Disappeared(event)) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(prefix = %prefix, "cell event relay stopped");
    });

    rx
}
