//! Error types for `tenant-storage`.

/// Errors from a tenant database client.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The connection could not be established or used.
    #[error("tenant database unreachable: {reason}")]
    Unreachable { reason: String },

    /// An operation exceeded its deadline.
    #[error("tenant database operation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// A migration or seed batch failed and was rolled back.
    #[error("migration failed: {reason}")]
    Migration { reason: String },

    /// The connection string or client configuration was invalid.
    #[error("invalid tenant database configuration: {reason}")]
    InvalidConfig { reason: String },
}
