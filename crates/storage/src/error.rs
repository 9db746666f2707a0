use crate::fields::Table;

/// All errors that can be returned by an `OrchestratorStorage` implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// A write payload named a field that is not in the table's catalogue.
    /// Raised locally, before anything goes over the wire.
    #[error("unknown field '{field}' for table '{}'", .table.name())]
    InvalidFieldName { table: Table, field: String },

    /// No record matched the given key.
    #[error("{} record not found: {key}", .table.name())]
    NotFound { table: Table, key: String },

    /// A record with this key already exists.
    #[error("{} record already exists: {key}", .table.name())]
    AlreadyExists { table: Table, key: String },

    /// The backend asked us to slow down (HTTP 429 or equivalent).
    #[error("rate limited by storage backend: {0}")]
    RateLimited(String),

    /// The backend failed with a server-side (5xx) error.
    #[error("storage backend unavailable ({status}): {message}")]
    Unavailable { status: u16, message: String },

    /// A single call exceeded its deadline.
    #[error("storage call '{operation}' timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// Credentials were rejected.
    #[error("not authorised by storage backend: {0}")]
    Unauthorized(String),

    /// The backend rejected the request shape (unknown field, bad formula, ...).
    #[error("storage schema error: {0}")]
    Schema(String),

    /// A record came back in a shape we could not decode.
    #[error("could not decode {} record: {message}", .table.name())]
    Decode { table: Table, message: String },

    /// Any other backend failure (connection, serialization, ...).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether the failure is worth retrying with backoff.
    ///
    /// Schema-level and authorisation errors are never transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::RateLimited(_)
                | StorageError::Unavailable { .. }
                | StorageError::Timeout { .. }
        )
    }
}
