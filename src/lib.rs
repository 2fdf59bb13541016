//! Rimio Presence - lease-backed liveness tracking for cells
//!
//! Cells register a presence record under a lease in a coordination store:
//! - a maintainer task keeps each cell's lease acquired and renewed
//! - a directory answers point-in-time queries over registered cells
//! - an event stream reports cells whose presence disappeared

pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod maintainer;
pub mod presence;
pub mod schema;
pub mod shutdown;
pub mod store;

pub use client::PresenceClient;
pub use config::{CELL_PRESENCE_TTL, PresenceConfig, PresenceSettings, StoreConfig};
pub use directory::{CellListing, PresenceDirectory};
pub use error::{PresenceError, Result};
pub use events::{CellDisappearedEvent, CellEvent, CellEventType, cell_events};
pub use maintainer::{PresenceHandle, PresenceMaintainer, PresenceStatus};
pub use presence::{CellCapacity, CellPresence};
pub use schema::{CellSchema, cell_id_from_key};
pub use shutdown::{ShutdownSignal, shutdown_channel};
pub use store::{
    AcquiredValue, CoordinationStore, EtcdStore, Lease, MemoryStore, StoreBuilder,
    StoreError, StoreResult,
};
