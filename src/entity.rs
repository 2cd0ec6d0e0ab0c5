//! Parent/child records and the staging handles returned by `add`.
//!
//! Plain columns are always loaded with their entity. The `children`
//! collection is a [`Deferred`] relationship: a new, unattached parent knows
//! its children, a parent read back from the database does not until the
//! collection is resolved through the unit of work that read it.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::deferred::{Loadable, Relationship};
use crate::{Deferred, Executor, Filter, Row, RowSet, ScopeToken, Statement, UowResult, Value};

/// A record type backed by one table.
#[async_trait]
pub trait Entity: Clone + Send + Sync + Sized + 'static {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];

    /// Primary key; `None` until the entity has been flushed.
    fn id(&self) -> Option<i64>;

    /// Build an entity from a row read inside the unit owning `scope`.
    fn from_row(row: Row<'_>, scope: &ScopeToken) -> UowResult<Self>;

    /// Insert this entity and every unattached entity reachable from it.
    async fn insert(&mut self, executor: &Executor) -> UowResult<()>;

    /// Clear ids assigned by a flush whose transaction was rolled back.
    fn forget_identity(&mut self);

    /// Update for plain fields changed since the entity was loaded.
    fn changes(&self) -> Option<Statement> {
        None
    }

    /// Treat the current field values as persisted.
    fn mark_clean(&mut self) {}

    /// Eagerly load relationships for a batch of freshly read entities.
    async fn load_related(_items: &mut [Self], _executor: &Executor) -> UowResult<()> {
        Ok(())
    }
}

impl<E: Entity> Loadable for Vec<E> {
    fn from_rows(rows: &RowSet, scope: &ScopeToken) -> UowResult<Self> {
        rows.iter().map(|row| E::from_row(row, scope)).collect()
    }
}

pub static CHILDREN: Relationship = Relationship {
    name: "children",
    target: Child::TABLE,
    foreign_key: "parent_id",
    columns: Child::COLUMNS,
};

#[derive(Debug, Clone)]
pub struct Parent {
    id: Option<i64>,
    pub data: Option<String>,
    children: Deferred<Vec<Child>>,
    // Value of `data` as last read from or written to the database.
    persisted: Option<Option<String>>,
}

impl Parent {
    pub fn new(data: Option<String>) -> Self {
        Self {
            id: None,
            data,
            children: Deferred::Loaded(Vec::new()),
            persisted: None,
        }
    }

    pub fn with_children(mut self, children: Vec<Child>) -> Self {
        self.children = Deferred::Loaded(children);
        self
    }

    pub fn children(&self) -> &Deferred<Vec<Child>> {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut Deferred<Vec<Child>> {
        &mut self.children
    }

    pub(crate) fn set_children(&mut self, children: Vec<Child>) {
        self.children = Deferred::Loaded(children);
    }
}

impl Default for Parent {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl Entity for Parent {
    const TABLE: &'static str = "a";
    const COLUMNS: &'static [&'static str] = &["id", "data"];

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn from_row(row: Row<'_>, scope: &ScopeToken) -> UowResult<Self> {
        let id = row.get_i64("id")?;
        let data = row.get_opt_text("data")?;
        Ok(Self {
            id: Some(id),
            persisted: Some(data.clone()),
            data,
            children: Deferred::unloaded(scope.clone(), &CHILDREN, Value::Int(id)),
        })
    }

    async fn insert(&mut self, executor: &Executor) -> UowResult<()> {
        let id = match self.id {
            Some(id) => id,
            None => {
                let rows = executor
                    .run(&Statement::Insert {
                        table: Self::TABLE,
                        values: vec![("data", Value::from(self.data.clone()))],
                        returning: "id",
                    })
                    .await?;
                let id = returned_id(&rows)?;
                self.id = Some(id);
                self.persisted = Some(self.data.clone());
                id
            }
        };

        if let Deferred::Loaded(children) = &mut self.children {
            for child in children.iter_mut().filter(|c| c.id.is_none()) {
                child.parent_id = Some(id);
                child.insert(executor).await?;
            }
        }
        Ok(())
    }

    fn forget_identity(&mut self) {
        self.id = None;
        self.persisted = None;
        if let Deferred::Loaded(children) = &mut self.children {
            for child in children.iter_mut() {
                child.forget_identity();
                child.parent_id = None;
            }
        }
    }

    fn changes(&self) -> Option<Statement> {
        let id = self.id?;
        match &self.persisted {
            Some(persisted) if persisted == &self.data => None,
            _ => Some(Statement::Update {
                table: Self::TABLE,
                assignments: vec![("data", Value::from(self.data.clone()))],
                filter: Filter::Eq("id", Value::Int(id)),
            }),
        }
    }

    fn mark_clean(&mut self) {
        if self.id.is_some() {
            self.persisted = Some(self.data.clone());
        }
    }

    /// Select-in load of `children` for every parent in the batch.
    async fn load_related(items: &mut [Self], executor: &Executor) -> UowResult<()> {
        let keys: Vec<Value> = items.iter().filter_map(|p| p.id).map(Value::Int).collect();
        if keys.is_empty() {
            return Ok(());
        }

        let mut stmt = Statement::select(Child::TABLE, Child::COLUMNS.to_vec(), Filter::In("parent_id", keys));
        if let Statement::Select { order_by, .. } = &mut stmt {
            *order_by = Some("id");
        }
        let rows = executor.run(&stmt).await?;

        let mut by_parent: HashMap<i64, Vec<Child>> = HashMap::new();
        for row in rows.iter() {
            let child = Child::from_row(row, executor.scope())?;
            if let Some(parent_id) = child.parent_id {
                by_parent.entry(parent_id).or_default().push(child);
            }
        }
        for parent in items.iter_mut() {
            let children = parent
                .id
                .and_then(|id| by_parent.remove(&id))
                .unwrap_or_default();
            parent.set_children(children);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Child {
    id: Option<i64>,
    pub parent_id: Option<i64>,
}

impl Child {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Entity for Child {
    const TABLE: &'static str = "b";
    const COLUMNS: &'static [&'static str] = &["id", "parent_id"];

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn from_row(row: Row<'_>, _scope: &ScopeToken) -> UowResult<Self> {
        Ok(Self {
            id: Some(row.get_i64("id")?),
            parent_id: row.get_opt_i64("parent_id")?,
        })
    }

    async fn insert(&mut self, executor: &Executor) -> UowResult<()> {
        if self.id.is_some() {
            return Ok(());
        }
        let rows = executor
            .run(&Statement::Insert {
                table: Self::TABLE,
                values: vec![("parent_id", Value::from(self.parent_id))],
                returning: "id",
            })
            .await?;
        self.id = Some(returned_id(&rows)?);
        Ok(())
    }

    fn forget_identity(&mut self) {
        self.id = None;
    }
}

fn returned_id(rows: &RowSet) -> UowResult<i64> {
    rows.first()
        .ok_or_else(|| crate::UowError::Decode("insert returned no row".into()))?
        .get_i64("id")
}

/// Handle to an entity staged with [`UnitOfWork::add`](crate::UnitOfWork::add).
///
/// The unit of work writes assigned ids back through the handle when it
/// flushes, so the caller can read them after commit.
pub struct Staged<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for Staged<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Entity> Staged<T> {
    pub(crate) fn new(entity: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(entity)),
        }
    }

    pub fn id(&self) -> Option<i64> {
        self.inner.lock().id()
    }

    /// Snapshot of the staged entity.
    pub fn get(&self) -> T {
        self.inner.lock().clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.lock())
    }
}

impl<T: Entity + std::fmt::Debug> std::fmt::Debug for Staged<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Staged").field(&*self.inner.lock()).finish()
    }
}

/// Object-safe view of a staged entity.
#[async_trait]
pub(crate) trait PendingInsert: Send + Sync {
    async fn flush(&self, executor: &Executor) -> UowResult<()>;

    fn forget_identity(&self);
}

#[async_trait]
impl<T: Entity> PendingInsert for Staged<T> {
    // Inserts a copy so a failed flush leaves the staged entity untouched.
    async fn flush(&self, executor: &Executor) -> UowResult<()> {
        let mut entity = self.get();
        entity.insert(executor).await?;
        *self.inner.lock() = entity;
        Ok(())
    }

    fn forget_identity(&self) {
        self.inner.lock().forget_identity();
    }
}
