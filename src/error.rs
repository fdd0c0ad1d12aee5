//! Error types for agent-memory.

use thiserror::Error;

/// Result type alias using agent-memory's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during memory operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Capability violation. Always fail-closed, never retried automatically.
    #[error("Permission denied for {operation}: {reason}")]
    Permission { operation: String, reason: String },

    /// Unknown session, experience, knowledge or code entity
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Malformed input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation not allowed in the entity's current state
    #[error("Invalid state for {entity} {id}: {reason}")]
    InvalidState {
        entity: &'static str,
        id: String,
        reason: String,
    },

    /// Query traversal exceeded its cost budget
    #[error("Query cost exceeded: spent {spent} of budget {budget}")]
    QueryCostExceeded { budget: u64, spent: u64 },

    /// Query exceeded its deadline
    #[error("Query timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// Lost a lock race; safe to retry immediately
    #[error("Concurrency conflict on {key}")]
    ConcurrencyConflict { key: String },

    /// Backing store failed its integrity check
    #[error("Store corruption detected: {0}")]
    Corruption(String),

    /// Backing store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a permission error.
    pub fn permission(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permission {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(entity: &'static str, id: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            entity,
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a cost exceeded error.
    pub fn cost_exceeded(budget: u64, spent: u64) -> Self {
        Self::QueryCostExceeded { budget, spent }
    }

    /// Create a timeout error.
    pub fn timeout(elapsed_ms: u64) -> Self {
        Self::Timeout { elapsed_ms }
    }

    /// Create a concurrency conflict error.
    pub fn conflict(key: impl Into<String>) -> Self {
        Self::ConcurrencyConflict { key: key.into() }
    }

    /// Whether the caller may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// Stable label recorded in audit entries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Permission { .. } => "permission",
            Self::NotFound { .. } => "not_found",
            Self::Validation(_) => "validation",
            Self::InvalidState { .. } => "invalid_state",
            Self::QueryCostExceeded { .. } => "query_cost_exceeded",
            Self::Timeout { .. } => "timeout",
            Self::ConcurrencyConflict { .. } => "concurrency_conflict",
            Self::Corruption(_) => "corruption",
            Self::Storage(_) => "storage",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                Self::conflict(format!("backing store lock: {}", e))
            }
            Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
                Self::Corruption(e.to_string())
            }
            _ => Self::Storage(e.to_string()),
        }
    }
}
