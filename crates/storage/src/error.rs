/// All errors that can be returned by a `PolicyStore` implementation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    /// Optimistic concurrency control conflict: the record was modified
    /// since it was read. The expected version was not found.
    #[error("concurrent conflict on {entity} {id}: expected version {expected_version}")]
    ConcurrentConflict {
        entity: &'static str,
        id: u64,
        expected_version: i64,
    },

    /// No record with the given identifier.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: u64 },

    /// The record has no identifier yet and cannot be updated.
    #[error("{entity} has not been persisted")]
    Unsaved { entity: &'static str },

    /// A backend-specific storage error (connection, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}
