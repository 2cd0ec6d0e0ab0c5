use async_trait::async_trait;
use uuid::Uuid;

use crate::UowResult;

/// Trait for components that need to be notified of unit-of-work outcomes.
///
/// Components implementing this trait can be registered with a
/// [`UnitOfWork`](crate::UnitOfWork) to receive callbacks once its
/// transaction has been committed or rolled back. The connection has already
/// been returned to the pool when a callback runs, so callbacks must not
/// expect to issue statements in the finished transaction.
#[async_trait]
pub trait TransactionAware: Send + Sync {
    /// Called after a successful commit.
    ///
    /// Implementations should use this to publish what the transaction made
    /// durable, such as updating caches or flushing buffers.
    async fn on_commit(&self, unit_of_work: Uuid) -> UowResult<()>;

    /// Called after a rollback, explicit or implicit.
    ///
    /// Implementations should use this to revert any in-memory state changes
    /// that were made during the transaction.
    async fn on_rollback(&self, unit_of_work: Uuid) -> UowResult<()>;
}
