use crate::store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PresenceError>;

#[derive(Error, Debug)]
pub enum PresenceError {
    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Lock collision on {0}")]
    LockCollision(String),

    #[error("Lease lost for {0}")]
    LeaseLost(String),

    #[error("Failed to decode presence record: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Failed to encode presence record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Invalid presence record: {0}")]
    InvalidRecord(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PresenceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PresenceError::NotFound(_))
    }
}

impl From<StoreError> for PresenceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => PresenceError::Unavailable(reason),
            StoreError::NotFound(key) => PresenceError::NotFound(key),
            StoreError::Conflict(key) => PresenceError::LockCollision(key),
            StoreError::LeaseExpired(key) | StoreError::LeaseLost(key) => {
                PresenceError::LeaseLost(key)
            }
        }
    }
}
