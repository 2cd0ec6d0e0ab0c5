use async_trait::async_trait;

use crate::{RowSet, Statement};

/// Result type of the database capability. Transport and server errors are
/// reported as [`sqlx::Error`] by every backend.
pub type DbResult<T> = Result<T, sqlx::Error>;

/// One database session.
///
/// A connection is leased to exactly one unit of work at a time; the pool
/// never hands out a connection whose [`is_alive`](Connection::is_alive)
/// returned `false`.
#[async_trait]
pub trait Connection: Send {
    async fn begin(&mut self) -> DbResult<()>;

    async fn commit(&mut self) -> DbResult<()>;

    async fn rollback(&mut self) -> DbResult<()>;

    /// Run a statement inside the current transaction.
    async fn run(&mut self, statement: &Statement) -> DbResult<RowSet>;

    /// Round-trip liveness check.
    async fn ping(&mut self) -> DbResult<()>;

    /// Last known liveness, without a round trip.
    fn is_alive(&self) -> bool;

    async fn close(self: Box<Self>) -> DbResult<()>;
}

/// Opens new connections on behalf of a pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> DbResult<Box<dyn Connection>>;
}
