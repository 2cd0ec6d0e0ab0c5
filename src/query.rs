//! Entity queries, including the row-locking read path.

use std::fmt;
use std::marker::PhantomData;
use tracing::debug;

use crate::statement::{LockWait, RowLock};
use crate::{Entity, Filter, Parent, Statement, UnitOfWork, UowResult, Value};

/// Criteria for reading entities of type `E`.
pub struct Query<E> {
    filter: Filter,
    lock: Option<LockWait>,
    eager: bool,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for Query<E> {
    fn clone(&self) -> Self {
        Self {
            filter: self.filter.clone(),
            lock: self.lock,
            eager: self.eager,
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> fmt::Debug for Query<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("table", &E::TABLE)
            .field("filter", &self.filter)
            .field("lock", &self.lock)
            .field("eager", &self.eager)
            .finish()
    }
}

impl<E: Entity> Query<E> {
    pub fn all() -> Self {
        Self::filter(Filter::All)
    }

    pub fn by_id(id: i64) -> Self {
        Self::filter(Filter::Eq("id", Value::Int(id)))
    }

    pub fn filter(filter: Filter) -> Self {
        Self {
            filter,
            lock: None,
            eager: false,
            _entity: PhantomData,
        }
    }

    /// Load relationships in the same call instead of deferring them.
    pub fn with_related(mut self) -> Self {
        self.eager = true;
        self
    }

    /// Lock matched rows until the transaction ends, waiting for other holders.
    pub fn for_update(mut self) -> Self {
        self.lock.get_or_insert(LockWait::Wait);
        self
    }

    pub fn nowait(mut self) -> Self {
        self.lock = Some(LockWait::NoWait);
        self
    }

    pub fn skip_locked(mut self) -> Self {
        self.lock = Some(LockWait::SkipLocked);
        self
    }

    pub fn is_locking(&self) -> bool {
        self.lock.is_some()
    }

    pub fn statement(&self) -> Statement {
        Statement::Select {
            table: E::TABLE,
            columns: E::COLUMNS.to_vec(),
            filter: self.filter.clone(),
            order_by: Some("id"),
            lock: self.lock.map(|wait| RowLock { of: E::TABLE, wait }),
        }
    }
}

impl Query<Parent> {
    pub fn where_data(data: impl Into<String>) -> Self {
        Self::filter(Filter::Eq("data", Value::Text(data.into())))
    }

    pub fn with_children(self) -> Self {
        self.with_related()
    }
}

impl UnitOfWork {
    /// Read entities. Relationships stay deferred unless the query asked for
    /// them; deferred ones can only be resolved through this unit while it
    /// is open.
    pub async fn select<E: Entity>(&mut self, query: Query<E>) -> UowResult<Vec<E>> {
        self.ensure_open("select")?;

        let statement = query.statement();
        let rows = self.executor().run(&statement).await?;
        let mut items = rows
            .iter()
            .map(|row| E::from_row(row, self.scope()))
            .collect::<UowResult<Vec<E>>>()?;

        if query.eager {
            E::load_related(&mut items, self.executor()).await?;
        }
        debug!(
            unit_of_work = %self.id(),
            table = E::TABLE,
            rows = items.len(),
            locked = query.is_locking(),
            "entities loaded"
        );
        Ok(items)
    }

    /// `SELECT ... FOR UPDATE OF <table>`: every matched row stays locked
    /// until this unit commits or rolls back. A row locked by another unit
    /// suspends the call until that unit finishes.
    pub async fn select_for_update<E: Entity>(&mut self, query: Query<E>) -> UowResult<Vec<E>> {
        self.ensure_open("select_for_update")?;
        self.select(query.for_update()).await
    }
}
