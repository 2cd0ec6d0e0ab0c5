use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::deferred::Loadable;
use crate::entity::PendingInsert;
use crate::{
    ConnectionPool, Deferred, Entity, Executor, RowSet, ScopeToken, Staged, Statement,
    TransactionAware, UowError, UowResult,
};

/// Lifecycle state of a [`UnitOfWork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UowState {
    Open = 0,
    Committed = 1,
    RolledBack = 2,
    Closed = 3,
}

impl UowState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => UowState::Open,
            1 => UowState::Committed,
            2 => UowState::RolledBack,
            _ => UowState::Closed,
        }
    }
}

impl fmt::Display for UowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UowState::Open => "open",
            UowState::Committed => "committed",
            UowState::RolledBack => "rolled back",
            UowState::Closed => "closed",
        })
    }
}

#[derive(Clone, Copy)]
enum Outcome {
    Commit,
    Rollback,
}

/// One transaction on one leased connection.
///
/// The unit is `Open` from [`begin`](UnitOfWork::begin) until exactly one of
/// [`commit`](UnitOfWork::commit) or [`rollback`](UnitOfWork::rollback)
/// reaches the database; either one returns the connection to the pool.
/// [`close`](UnitOfWork::close) is idempotent and rolls back an open unit.
/// Dropping an open unit schedules a rollback on the current runtime.
pub struct UnitOfWork {
    id: Uuid,
    pool: ConnectionPool,
    executor: Executor,
    scope: ScopeToken,
    staged: Vec<Box<dyn PendingInsert>>,
    flushed: Vec<Box<dyn PendingInsert>>,
    updates: Vec<Statement>,
    observers: Arc<RwLock<Vec<Arc<dyn TransactionAware>>>>,
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("staged", &self.staged.len())
            .field("updates", &self.updates.len())
            .finish()
    }
}

impl UnitOfWork {
    /// Lease a connection from `pool` and open a transaction on it.
    pub async fn begin(pool: &ConnectionPool) -> UowResult<Self> {
        let mut conn = pool.acquire().await?;
        if let Err(e) = conn.begin().await {
            warn!(error = %e, "BEGIN failed; discarding connection");
            drop(conn);
            return Err(e.into());
        }

        let id = Uuid::new_v4();
        let scope = ScopeToken::open(id);
        info!(unit_of_work = %id, "unit of work opened");

        Ok(Self {
            id,
            pool: pool.clone(),
            executor: Executor::new(conn, scope.clone()),
            scope,
            staged: Vec::new(),
            flushed: Vec::new(),
            updates: Vec::new(),
            observers: Arc::new(RwLock::new(Vec::new())),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> UowState {
        self.scope.state()
    }

    pub fn is_open(&self) -> bool {
        self.scope.is_open()
    }

    /// Token shared with every deferred field this unit hands out.
    pub fn scope(&self) -> &ScopeToken {
        &self.scope
    }

    /// Get the executor for this unit (provides access to the connection).
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Register a component that needs to be notified of transaction events.
    pub fn register_transaction_aware(&self, observer: Arc<dyn TransactionAware>) {
        self.observers.write().push(observer);
    }

    pub(crate) fn ensure_open(&self, operation: &'static str) -> UowResult<()> {
        match self.state() {
            UowState::Open => Ok(()),
            state => Err(UowError::InvalidState { operation, state }),
        }
    }

    /// Stage a new entity, and the unattached entities reachable from it,
    /// for insertion at the next flush.
    pub fn add<T: Entity>(&mut self, entity: T) -> UowResult<Staged<T>> {
        self.ensure_open("add")?;
        let staged = Staged::new(entity);
        self.staged.push(Box::new(staged.clone()));
        debug!(unit_of_work = %self.id, table = T::TABLE, "entity staged");
        Ok(staged)
    }

    /// Stage the changed plain fields of a loaded entity. Returns whether an
    /// update was staged.
    pub fn update<T: Entity>(&mut self, entity: &mut T) -> UowResult<bool> {
        self.ensure_open("update")?;
        match entity.changes() {
            Some(statement) => {
                self.updates.push(statement);
                entity.mark_clean();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run a statement inside the open transaction.
    pub async fn execute(&mut self, statement: &Statement) -> UowResult<RowSet> {
        self.ensure_open("execute")?;
        self.executor.run(statement).await
    }

    /// Write staged inserts and updates without committing. Ids are visible
    /// through the [`Staged`] handles afterwards. A failed flush rolls the
    /// unit back.
    pub async fn flush(&mut self) -> UowResult<()> {
        self.ensure_open("flush")?;
        if let Err(e) = self.flush_pending().await {
            return Err(self.fail("flush", e).await);
        }
        Ok(())
    }

    async fn flush_pending(&mut self) -> UowResult<()> {
        if self.executor.is_aborted() {
            return Err(UowError::TransactionAborted);
        }
        for pending in std::mem::take(&mut self.staged) {
            let result = pending.flush(&self.executor).await;
            self.flushed.push(pending);
            result?;
        }
        for statement in std::mem::take(&mut self.updates) {
            self.executor.run(&statement).await?;
        }
        Ok(())
    }

    /// Resolve a deferred relationship through this unit.
    ///
    /// The field must have been produced by this unit while it is still open.
    /// A field whose unit has left `Open` fails with `DetachedAccess` without
    /// touching any connection.
    pub async fn resolve<'a, T: Loadable>(&mut self, field: &'a mut Deferred<T>) -> UowResult<&'a T> {
        if let Deferred::Unloaded(load) = &*field {
            if !load.scope.is_open() {
                return Err(load.detached());
            }
            if load.scope.id() != self.id {
                return Err(UowError::ForeignUnitOfWork {
                    relationship: load.relationship.name,
                });
            }
            self.ensure_open("resolve")?;

            let statement = load.relationship.statement(load.key.clone());
            debug!(unit_of_work = %self.id, relationship = load.relationship.name, "resolving deferred relationship");
            let rows = self.executor.run(&statement).await?;
            *field = Deferred::Loaded(T::from_rows(&rows, &self.scope)?);
        }
        field.get()
    }

    /// Flush, commit and release the connection. If any step fails, or an
    /// earlier statement already aborted the transaction, it is rolled back
    /// before the connection is released and the error is returned.
    pub async fn commit(&mut self) -> UowResult<()> {
        self.ensure_open("commit")?;

        let result = match self.flush_pending().await {
            Ok(()) => self.executor.commit().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            return Err(self.fail("commit", e).await);
        }

        self.flushed.clear();
        self.scope.transition(UowState::Committed);
        self.release_connection(true).await;
        info!(unit_of_work = %self.id, "unit of work committed");

        self.notify(Outcome::Commit).await
    }

    /// Discard staged work, roll back and release the connection.
    pub async fn rollback(&mut self) -> UowResult<()> {
        self.ensure_open("rollback")?;
        let result = self.abort().await;
        info!(unit_of_work = %self.id, "unit of work rolled back");
        result?;
        self.notify(Outcome::Rollback).await
    }

    /// Idempotent. Rolls back first when the unit is still open.
    pub async fn close(&mut self) -> UowResult<()> {
        let result = if self.is_open() {
            self.rollback().await
        } else {
            Ok(())
        };
        if self.state() != UowState::Closed {
            self.scope.transition(UowState::Closed);
            debug!(unit_of_work = %self.id, "unit of work closed");
        }
        self.release_connection(true).await;
        result
    }

    // Rolls back after a failed flush or commit and tells observers; hands
    // back the error that caused it.
    async fn fail(&mut self, operation: &'static str, error: UowError) -> UowError {
        warn!(unit_of_work = %self.id, operation, error = %error, "rolling back after failure");
        self.abort().await.ok();
        if let Err(hook) = self.notify(Outcome::Rollback).await {
            warn!(unit_of_work = %self.id, error = %hook, "rollback hook failed");
        }
        error
    }

    // Leaves the unit rolled back with its connection released, whatever
    // the database answers. A connection whose rollback failed is discarded.
    async fn abort(&mut self) -> UowResult<()> {
        self.staged.clear();
        self.updates.clear();

        let result = self.executor.rollback().await;
        if let Err(e) = &result {
            warn!(unit_of_work = %self.id, error = %e, "rollback failed; discarding connection");
        }
        for pending in self.flushed.drain(..) {
            pending.forget_identity();
        }
        self.scope.transition(UowState::RolledBack);
        self.release_connection(result.is_ok()).await;
        result
    }

    async fn release_connection(&self, recycle: bool) {
        if let Some(conn) = self.executor.take_connection().await {
            if recycle {
                self.pool.release(conn).await;
            } else {
                drop(conn);
            }
            debug!(unit_of_work = %self.id, recycle, "connection released");
        }
    }

    async fn notify(&self, outcome: Outcome) -> UowResult<()> {
        let observers = self.observers.read().clone();
        for observer in observers.iter() {
            match outcome {
                Outcome::Commit => observer.on_commit(self.id).await?,
                Outcome::Rollback => observer.on_rollback(self.id).await?,
            }
        }
        Ok(())
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if !self.is_open() {
            return;
        }
        self.scope.transition(UowState::Closed);

        let Some(mut conn) = self.executor.try_take_connection() else {
            return;
        };
        warn!(unit_of_work = %self.id, "unit of work dropped while open; rolling back");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.pool.clone();
                let id = self.id;
                handle.spawn(async move {
                    match conn.rollback().await {
                        Ok(()) => pool.release(conn).await,
                        Err(e) => {
                            warn!(unit_of_work = %id, error = %e, "rollback after drop failed; discarding connection");
                        }
                    }
                });
            }
            // No runtime to roll back on: discarding the connection ends its transaction.
            Err(_) => drop(conn),
        }
    }
}
