use crate::config::PresenceConfig;
use crate::directory::{CellListing, PresenceDirectory};
use crate::error::Result;
use crate::events::{self, CellEvent};
use crate::maintainer::PresenceMaintainer;
use crate::presence::{self, CellPresence};
use crate::schema::CellSchema;
use crate::shutdown::ShutdownSignal;
use crate::store::{CoordinationStore, StoreBuilder};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Cell presence operations bound to one store handle and one namespace.
pub struct PresenceClient {
    store: Arc<dyn CoordinationStore>,
    schema: CellSchema,
    directory: PresenceDirectory,
    ttl: Duration,
}

impl PresenceClient {
    pub fn new(store: Arc<dyn CoordinationStore>, namespace: &str, ttl: Duration) -> Self {
        let schema = CellSchema::new(namespace);
        let directory = PresenceDirectory::new(Arc::clone(&store), schema.clone());

        Self {
            store,
            schema,
            directory,
            ttl,
        }
    }

    /// Build the configured store backend and a client on top of it.
    pub async fn connect(config: &PresenceConfig) -> Result<Self> {
        config.validate()?;
        let store = StoreBuilder::from_config(&config.store).build().await?;

        Ok(Self::new(
            store,
            &config.store.namespace,
            config.presence.ttl(),
        ))
    }

    pub fn schema(&self) -> &CellSchema {
        &self.schema
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Maintainer that keeps `cell` registered. Fails immediately if the record
    /// cannot be encoded.
    pub fn new_cell_presence(
        &self,
        cell: &CellPresence,
        retry_interval: Duration,
    ) -> Result<PresenceMaintainer> {
        let payload = presence::to_json(cell)?;

        Ok(PresenceMaintainer::new(
            Arc::clone(&self.store),
            self.schema.cell_path(&cell.cell_id),
            payload,
            self.ttl,
            retry_interval,
        ))
    }

    pub async fn cell_by_id(&self, cell_id: &str) -> Result<CellPresence> {
        self.directory.cell_by_id(cell_id).await
    }

    pub async fn cells(&self) -> Result<Vec<CellPresence>> {
        self.directory.cells().await
    }

    pub async fn list_cells(&self) -> Result<CellListing> {
        self.directory.list_cells().await
    }

    pub fn cell_events(&self, shutdown: ShutdownSignal) -> mpsc::Receiver<CellEvent> {
        events::cell_events(&self.store, &self.schema.prefix(), shutdown)
    }
}
