//! Error handling for the chatline sync engine
//!
//! All engine operations return [`Result`]. Failures are never fatal to the
//! process: a read that fails mid-session leaves the last known good state in
//! place, and a subscription that fails to establish degrades the engine to
//! bulk-loaded data only (see the engine modules for the exact semantics).

use thiserror::Error;

/// Result type for sync engine operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while synchronizing console state
///
/// # Examples
///
/// ```rust
/// use chatline_sync::SyncError;
///
/// let error = SyncError::store("connection reset");
/// assert_eq!(error.to_string(), "Store error: connection reset");
///
/// let error = SyncError::malformed_row("message row missing conversation_id");
/// assert_eq!(
///     error.to_string(),
///     "Malformed row: message row missing conversation_id"
/// );
/// ```
#[derive(Error, Debug)]
pub enum SyncError {
    /// I/O error (file system, network, etc.)
    ///
    /// Automatically converted from `std::io::Error`.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    ///
    /// Automatically converted from `serde_json::Error`.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Remote store read failure (bulk or point read)
    ///
    /// Transient by taxonomy: callers absorb it and keep prior state. The
    /// engines never schedule retries themselves.
    #[error("Store error: {0}")]
    Store(String),

    /// Live feed could not be established or was lost
    ///
    /// Degraded mode: bulk-loaded state remains correct but no further live
    /// updates arrive until the owning view re-attaches.
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// A store row did not parse into the closed Conversation/Message shape
    ///
    /// Malformed rows are rejected at the boundary rather than propagating
    /// undefined fields into engine state.
    #[error("Malformed row: {0}")]
    MalformedRow(String),
}

impl SyncError {
    /// Create a store error
    pub fn store(message: impl Into<String>) -> Self {
        SyncError::Store(message.into())
    }

    /// Create a subscription error
    pub fn subscription(message: impl Into<String>) -> Self {
        SyncError::Subscription(message.into())
    }

    /// Create a malformed-row error
    pub fn malformed_row(message: impl Into<String>) -> Self {
        SyncError::MalformedRow(message.into())
    }
}
