use futures::future::BoxFuture;
use tracing::warn;

use crate::{ConnectionPool, UnitOfWork, UowError, UowResult};

/// Entry point for scoped units of work.
///
/// The factory separates guaranteed cleanup from transactional semantics:
/// code running inside [`scope`](UnitOfWorkFactory::scope) decides whether to
/// commit, and the factory rolls back and closes whatever is left open.
#[derive(Clone, Debug)]
pub struct UnitOfWorkFactory {
    pool: ConnectionPool,
}

impl UnitOfWorkFactory {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Begin a unit of work whose teardown is left to the caller.
    pub async fn begin(&self) -> UowResult<UnitOfWork> {
        UnitOfWork::begin(&self.pool).await
    }

    /// Run `f` inside a fresh unit of work.
    ///
    /// Once `f` finishes, successfully or not, the unit is rolled back unless
    /// `f` committed it, and then closed. If the returned future is dropped
    /// before `f` finishes, the unit's rollback runs on the current runtime.
    ///
    /// ```ignore
    /// let parents = factory
    ///     .scope(|uow| Box::pin(async move {
    ///         let parents = uow.select_for_update(Query::<Parent>::all()).await?;
    ///         uow.commit().await?;
    ///         Ok::<_, UowError>(parents)
    ///     }))
    ///     .await?;
    /// ```
    pub async fn scope<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: for<'u> FnOnce(&'u mut UnitOfWork) -> BoxFuture<'u, Result<T, E>>,
        E: From<UowError>,
    {
        let mut uow = self.begin().await?;
        let result = f(&mut uow).await;
        let teardown = uow.close().await;

        match (result, teardown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), teardown) => {
                if let Err(cleanup) = teardown {
                    warn!(unit_of_work = %uow.id(), error = %cleanup, "teardown failed after scope error");
                }
                Err(e)
            }
        }
    }
}
