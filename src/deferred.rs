//! Deferred relationship fields and the scope guard that protects them.
//!
//! A relationship that was not fetched by the query that produced its entity
//! is [`Deferred::Unloaded`]. The unloaded handle remembers the
//! [`ScopeToken`] of the unit of work that produced it. Resolution must go
//! through that unit while it is open; once the unit has committed, rolled
//! back or closed, the token never reopens and every read of the field fails
//! with [`UowError::DetachedAccess`].

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::{Filter, RowSet, Statement, UowError, UowResult, UowState, Value};

struct ScopeInner {
    id: Uuid,
    state: AtomicU8,
}

/// Shared view of a unit of work's lifecycle state.
#[derive(Clone)]
pub struct ScopeToken {
    inner: Arc<ScopeInner>,
}

impl ScopeToken {
    pub(crate) fn open(id: Uuid) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                id,
                state: AtomicU8::new(UowState::Open as u8),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn state(&self) -> UowState {
        UowState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == UowState::Open
    }

    /// Leaving `Open` is one-way; a token never transitions back to it.
    pub(crate) fn transition(&self, next: UowState) {
        debug_assert!(next != UowState::Open);
        self.inner.state.store(next as u8, Ordering::Release);
    }
}

impl fmt::Debug for ScopeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeToken")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// How to fetch the target rows of a one-to-many relationship.
#[derive(Debug, PartialEq, Eq)]
pub struct Relationship {
    pub name: &'static str,
    pub target: &'static str,
    pub foreign_key: &'static str,
    pub columns: &'static [&'static str],
}

impl Relationship {
    pub fn statement(&self, key: Value) -> Statement {
        Statement::Select {
            table: self.target,
            columns: self.columns.to_vec(),
            filter: Filter::Eq(self.foreign_key, key),
            order_by: Some("id"),
            lock: None,
        }
    }
}

/// Values a deferred relationship can be materialized into.
pub trait Loadable: Sized + Send + Sync {
    fn from_rows(rows: &RowSet, scope: &ScopeToken) -> UowResult<Self>;
}

/// Everything needed to resolve an unloaded relationship later.
#[derive(Clone)]
pub struct DeferredLoad {
    pub(crate) scope: ScopeToken,
    pub(crate) relationship: &'static Relationship,
    pub(crate) key: Value,
}

impl DeferredLoad {
    pub fn relationship(&self) -> &'static str {
        self.relationship.name
    }

    pub fn owner(&self) -> &ScopeToken {
        &self.scope
    }

    fn unavailable(&self) -> UowError {
        if self.scope.is_open() {
            UowError::Unresolved {
                relationship: self.relationship.name,
            }
        } else {
            self.detached()
        }
    }

    pub(crate) fn detached(&self) -> UowError {
        let state = self.scope.state();
        tracing::warn!(
            relationship = self.relationship.name,
            unit_of_work = %self.scope.id(),
            %state,
            "deferred relationship read outside its unit of work"
        );
        UowError::DetachedAccess {
            relationship: self.relationship.name,
            state,
        }
    }
}

/// A relationship field: either materialized, or a handle to load it.
#[derive(Clone)]
pub enum Deferred<T> {
    Unloaded(DeferredLoad),
    Loaded(T),
}

impl<T> Deferred<T> {
    pub(crate) fn unloaded(scope: ScopeToken, relationship: &'static Relationship, key: Value) -> Self {
        Deferred::Unloaded(DeferredLoad {
            scope,
            relationship,
            key,
        })
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Deferred::Loaded(_))
    }

    /// The loaded value, if any, without touching the guard.
    pub fn as_loaded(&self) -> Option<&T> {
        match self {
            Deferred::Loaded(v) => Some(v),
            Deferred::Unloaded(_) => None,
        }
    }

    /// Read the field.
    ///
    /// Fails with `DetachedAccess` when the field is unloaded and its unit of
    /// work is no longer open, and with `Unresolved` when the unit is still
    /// open but the field was never resolved through it.
    pub fn get(&self) -> UowResult<&T> {
        match self {
            Deferred::Loaded(v) => Ok(v),
            Deferred::Unloaded(load) => Err(load.unavailable()),
        }
    }

    pub fn get_mut(&mut self) -> UowResult<&mut T> {
        match self {
            Deferred::Loaded(v) => Ok(v),
            Deferred::Unloaded(load) => Err(load.unavailable()),
        }
    }

    pub fn into_loaded(self) -> UowResult<T> {
        match self {
            Deferred::Loaded(v) => Ok(v),
            Deferred::Unloaded(load) => Err(load.unavailable()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deferred::Loaded(v) => f.debug_tuple("Loaded").field(v).finish(),
            Deferred::Unloaded(load) => f
                .debug_struct("Unloaded")
                .field("relationship", &load.relationship.name)
                .field("owner", &load.scope)
                .finish(),
        }
    }
}
