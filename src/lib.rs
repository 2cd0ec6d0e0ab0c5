//! Scoped Unit of Work
//!
//! Transactional units of work over a pooled, asynchronous database
//! connection. A unit leases one connection, opens one transaction on it and
//! returns the connection exactly once, whether it commits, rolls back, fails
//! or is cancelled. Relationship fields left unloaded by a query are
//! [`Deferred`]: they can be resolved only through the unit that produced
//! them while it is open, and fail with [`UowError::DetachedAccess`] after.

pub mod config;
pub mod connection;
pub mod deferred;
pub mod entity;
pub mod error;
pub mod executor;
pub mod factory;
pub mod memory;
pub mod pool;
pub mod postgres;
pub mod query;
pub mod row;
pub mod schema;
pub mod statement;
pub mod transaction_aware;
pub mod unit_of_work;

pub use config::{DatabaseConfig, PoolOptions};
pub use connection::{Connection, Connector, DbResult};
pub use deferred::{Deferred, DeferredLoad, Loadable, Relationship, ScopeToken};
pub use entity::{Child, Entity, Parent, Staged};
pub use error::{UowError, UowResult};
pub use executor::Executor;
pub use factory::UnitOfWorkFactory;
pub use memory::{MemoryConnector, MemoryDatabase, MemoryStats};
pub use pool::{ConnectionPool, PoolStatus, PooledConnection};
pub use postgres::{PgConnector, PgSession};
pub use query::Query;
pub use row::{Row, RowSet};
pub use statement::{Filter, LockWait, RowLock, Statement, Value};
pub use transaction_aware::TransactionAware;
pub use unit_of_work::{UnitOfWork, UowState};
