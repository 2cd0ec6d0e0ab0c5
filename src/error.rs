use std::time::Duration;

use crate::unit_of_work::UowState;

/// Error type for unit-of-work, pool and deferred-access operations
#[derive(Debug, thiserror::Error)]
pub enum UowError {
    #[error("No connection became available within {waited:?}")]
    PoolTimeout { waited: Duration },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Cannot {operation} on a unit of work that is {state}")]
    InvalidState {
        operation: &'static str,
        state: UowState,
    },

    #[error("Deferred relationship `{relationship}` read after its unit of work was {state}")]
    DetachedAccess {
        relationship: &'static str,
        state: UowState,
    },

    #[error("Deferred relationship `{relationship}` has not been resolved; resolve it through its open unit of work")]
    Unresolved { relationship: &'static str },

    #[error("Deferred relationship `{relationship}` belongs to a different unit of work")]
    ForeignUnitOfWork { relationship: &'static str },

    /// An earlier statement in the transaction failed or was cancelled.
    #[error("Transaction aborted by an earlier failed statement; it can only be rolled back")]
    TransactionAborted,

    #[error("Lifecycle hook failed: {0}")]
    Hook(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to decode row: {0}")]
    Decode(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl UowError {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UowError::PoolTimeout { .. })
    }

    /// Errors that only a misuse of the API can produce.
    pub fn is_caller_bug(&self) -> bool {
        matches!(
            self,
            UowError::InvalidState { .. }
                | UowError::DetachedAccess { .. }
                | UowError::Unresolved { .. }
                | UowError::ForeignUnitOfWork { .. }
        )
    }
}

/// Result type for unit-of-work operations
pub type UowResult<T> = Result<T, UowError>;
