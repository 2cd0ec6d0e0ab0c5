use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{PooledConnection, RowSet, ScopeToken, Statement, UowError, UowResult};

/// Executor wraps the leased connection of a unit of work.
///
/// Clones share the same connection, so repositories and entity loaders can
/// issue statements inside the unit's transaction. Once the unit releases
/// its connection every clone fails with `InvalidState`. A statement that
/// fails, or is cancelled before it completes, aborts the transaction: later
/// statements fail with `TransactionAborted` and only a rollback is possible.
#[derive(Clone, Debug)]
pub struct Executor {
    conn: Arc<Mutex<Option<PooledConnection>>>,
    scope: ScopeToken,
    aborted: Arc<AtomicBool>,
}

impl Executor {
    /// Creates a new Executor owning a connection with an open transaction.
    pub(crate) fn new(conn: PooledConnection, scope: ScopeToken) -> Self {
        Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            scope,
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn scope(&self) -> &ScopeToken {
        &self.scope
    }

    /// Run a statement on the unit's connection.
    pub async fn run(&self, statement: &Statement) -> UowResult<RowSet> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(|| self.released("execute"))?;
        // Stays set if this future is dropped mid-statement.
        if self.aborted.swap(true, Ordering::AcqRel) {
            return Err(UowError::TransactionAborted);
        }
        debug!(unit_of_work = %self.scope.id(), sql = %statement, "executing statement");
        let result = conn.run(statement).await;
        match &result {
            Ok(_) => self.aborted.store(false, Ordering::Release),
            Err(e) => warn!(unit_of_work = %self.scope.id(), error = %e, "statement failed; transaction aborted"),
        }
        Ok(result?)
    }

    /// Whether a failed or cancelled statement has aborted the transaction.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub(crate) async fn commit(&self) -> UowResult<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(|| self.released("commit"))?;
        Ok(conn.commit().await?)
    }

    pub(crate) async fn rollback(&self) -> UowResult<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(|| self.released("rollback"))?;
        Ok(conn.rollback().await?)
    }

    /// Takes ownership of the connection, leaving None in its place.
    /// This should only be called when the unit of work releases it.
    pub(crate) async fn take_connection(&self) -> Option<PooledConnection> {
        self.conn.lock().await.take()
    }

    /// Non-blocking variant of [`take_connection`](Self::take_connection) for drop paths.
    pub(crate) fn try_take_connection(&self) -> Option<PooledConnection> {
        self.conn.try_lock().ok().and_then(|mut guard| guard.take())
    }

    fn released(&self, operation: &'static str) -> UowError {
        UowError::InvalidState {
            operation,
            state: self.scope.state(),
        }
    }
}
