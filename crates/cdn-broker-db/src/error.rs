use sea_orm::DbErr;
use thiserror::Error;

/// Route store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// No row matched the lookup
    #[error("route not found")]
    NotFound,

    /// The row changed since it was loaded
    #[error("route {instance_id} was modified concurrently (expected version {expected})")]
    Conflict { instance_id: String, expected: i32 },

    /// Save was called on a route that was never created
    #[error("route {0} has not been persisted yet")]
    NotPersisted(String),

    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}
