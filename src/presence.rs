use crate::error::{PresenceError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellCapacity {
    pub memory_mb: u32,
    pub disk_mb: u32,
    pub containers: u32,
}

impl CellCapacity {
    pub fn new(memory_mb: u32, disk_mb: u32, containers: u32) -> Self {
        Self {
            memory_mb,
            disk_mb,
            containers,
        }
    }
}

/// Presence record a cell publishes under its lease-backed key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellPresence {
    pub cell_id: String,
    pub rep_address: String,
    #[serde(default)]
    pub rep_url: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub capacity: CellCapacity,
    #[serde(default)]
    pub rootfs_providers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub placement_tags: Vec<String>,
    #[serde(default)]
    pub optional_placement_tags: Vec<String>,
}

impl CellPresence {
    pub fn new(
        cell_id: impl Into<String>,
        rep_address: impl Into<String>,
        zone: impl Into<String>,
        capacity: CellCapacity,
    ) -> Self {
        Self {
            cell_id: cell_id.into(),
            rep_address: rep_address.into(),
            zone: zone.into(),
            capacity,
            ..Self::default()
        }
    }

    pub fn with_rep_url(mut self, rep_url: impl Into<String>) -> Self {
        self.rep_url = rep_url.into();
        self
    }

    pub fn with_rootfs_provider(mut self, scheme: impl Into<String>, rootfses: Vec<String>) -> Self {
        self.rootfs_providers.insert(scheme.into(), rootfses);
        self
    }

    pub fn with_placement_tags(mut self, tags: Vec<String>) -> Self {
        self.placement_tags = tags;
        self
    }

    pub fn with_optional_placement_tags(mut self, tags: Vec<String>) -> Self {
        self.optional_placement_tags = tags;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.cell_id.trim().is_empty() {
            problems.push("cell_id cannot be empty".to_string());
        } else if self.cell_id.contains('/') {
            problems.push(format!("cell_id '{}' cannot contain '/'", self.cell_id));
        }

        if self.rep_address.trim().is_empty() {
            problems.push("rep_address cannot be empty".to_string());
        }

        if self.capacity.memory_mb == 0 {
            problems.push("capacity.memory_mb must be positive".to_string());
        }

        if self.capacity.containers == 0 {
            problems.push("capacity.containers must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(PresenceError::InvalidRecord(problems.join(", ")))
        }
    }
}

/// Encode a presence record, rejecting records that fail validation.
pub fn to_json(presence: &CellPresence) -> Result<Vec<u8>> {
    presence.validate()?;
    serde_json::to_vec(presence).map_err(PresenceError::Encode)
}

pub fn from_json(payload: &[u8]) -> Result<CellPresence> {
    serde_json::from_slice(payload).map_err(PresenceError::Decode)
}
