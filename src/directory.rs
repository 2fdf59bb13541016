use crate::error::{PresenceError, Result};
use crate::presence::{self, CellPresence};
use crate::schema::CellSchema;
use crate::store::{CoordinationStore, StoreError};
use std::sync::Arc;

/// Result of listing cells: every record that decoded, plus how many were
/// skipped because their payload did not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellListing {
    pub cells: Vec<CellPresence>,
    pub skipped: usize,
}

/// Point-in-time queries over registered cells.
pub struct PresenceDirectory {
    store: Arc<dyn CoordinationStore>,
    schema: CellSchema,
}

impl PresenceDirectory {
    pub fn new(store: Arc<dyn CoordinationStore>, schema: CellSchema) -> Self {
        Self { store, schema }
    }

    pub async fn cell_by_id(&self, cell_id: &str) -> Result<CellPresence> {
        let value = self
            .store
            .get_acquired_value(&self.schema.cell_path(cell_id))
            .await?;

        presence::from_json(&value)
    }

    pub async fn cells(&self) -> Result<Vec<CellPresence>> {
        Ok(self.list_cells().await?.cells)
    }

    pub async fn list_cells(&self) -> Result<CellListing> {
        let values = match self.store.list_acquired_values(&self.schema.prefix()).await {
            Ok(values) => values,
            Err(StoreError::NotFound(_)) => Vec::new(),
            Err(err) => return Err(PresenceError::from(err)),
        };

        let mut listing = CellListing::default();
        for value in values {
            match presence::from_json(&value.value) {
                Ok(cell) => listing.cells.push(cell),
                Err(err) => {
                    tracing::error!(key = %value.key, error = %err, "failed to unmarshal cell presence");
                    listing.skipped += 1;
                }
            }
        }

        Ok(listing)
    }
}
