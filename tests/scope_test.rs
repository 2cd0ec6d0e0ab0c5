mod common;

use common::{memory_pool, seed_parent, wait_until};
use scoped_unit_of_work::{
    Child, Parent, PoolOptions, Query, UnitOfWorkFactory, UowError, UowResult,
};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
enum TransferError {
    #[error(transparent)]
    Uow(#[from] UowError),
    #[error("transfer rejected")]
    Rejected,
}

#[tokio::test]
async fn scope_commits_when_asked() {
    let (db, pool) = memory_pool(PoolOptions::new(1)).await;
    let factory = UnitOfWorkFactory::new(pool.clone());

    let staged = factory
        .scope(|uow| {
            Box::pin(async move {
                let staged = uow.add(Parent::new(Some("kept".into())).with_children(vec![Child::new()]))?;
                uow.commit().await?;
                Ok::<_, UowError>(staged)
            })
        })
        .await
        .unwrap();

    assert!(staged.id().is_some());
    assert_eq!(db.rows("a").len(), 1);
    assert_eq!(db.rows("b").len(), 1);
    assert_eq!(pool.status().leased, 0);
}

#[tokio::test]
async fn scope_without_commit_rolls_back() {
    let (db, pool) = memory_pool(PoolOptions::new(1)).await;
    let factory = UnitOfWorkFactory::new(pool.clone());
    let rollbacks = db.stats().rollbacks;

    let id = factory
        .scope(|uow| {
            Box::pin(async move {
                let staged = uow.add(Parent::new(Some("dropped".into())))?;
                uow.flush().await?;
                Ok::<_, UowError>(staged.id())
            })
        })
        .await
        .unwrap();

    assert!(id.is_some(), "flush assigned an id inside the scope");
    assert!(db.rows("a").is_empty());
    assert_eq!(db.stats().rollbacks, rollbacks + 1);
    assert_eq!(pool.status().leased, 0);
}

#[tokio::test]
async fn scope_error_rolls_back_and_propagates() {
    let (db, pool) = memory_pool(PoolOptions::new(1)).await;
    let factory = UnitOfWorkFactory::new(pool.clone());

    let result: Result<(), TransferError> = factory
        .scope(|uow| {
            Box::pin(async move {
                uow.add(Parent::new(Some("half done".into())))?;
                uow.flush().await?;
                Err::<(), _>(TransferError::Rejected)
            })
        })
        .await;

    assert!(matches!(result, Err(TransferError::Rejected)));
    assert!(db.rows("a").is_empty());
    assert_eq!(pool.status().leased, 0);
    assert_eq!(pool.status().idle, 1);
}

#[tokio::test]
async fn scope_surfaces_begin_failures() {
    let options = PoolOptions::new(1)
        .max_overflow(0)
        .acquire_timeout(Duration::from_millis(20));
    let (_db, pool) = memory_pool(options).await;
    let factory = UnitOfWorkFactory::new(pool.clone());
    let _holder = factory.begin().await.unwrap();

    let result: Result<(), TransferError> = factory
        .scope(|_uow| Box::pin(async move { Ok::<(), TransferError>(()) }))
        .await;
    assert!(matches!(
        result,
        Err(TransferError::Uow(UowError::PoolTimeout { .. }))
    ));
}

#[tokio::test]
async fn cancelled_scope_rolls_back_and_returns_connection() {
    let (db, pool) = memory_pool(PoolOptions::new(1)).await;
    seed_parent(&pool, "locked", 0).await.unwrap();
    let factory = UnitOfWorkFactory::new(pool.clone());
    let rollbacks = db.stats().rollbacks;

    let outcome = tokio::time::timeout(
        Duration::from_millis(20),
        factory.scope(|uow| {
            Box::pin(async move {
                uow.select_for_update(Query::<Parent>::all()).await?;
                uow.add(Parent::new(Some("never committed".into())))?;
                uow.flush().await?;
                std::future::pending::<()>().await;
                uow.commit().await
            })
        }),
    )
    .await;
    assert!(outcome.is_err(), "scope should have been cancelled");

    assert!(wait_until(|| pool.status().leased == 0).await);
    assert!(wait_until(|| db.locked_rows("a").is_empty()).await);
    assert_eq!(db.rows("a").len(), 1);
    assert_eq!(db.stats().rollbacks, rollbacks + 1);
    assert_eq!(pool.status().idle, 1);
}

#[tokio::test]
async fn aborted_task_releases_its_unit() {
    let (db, pool) = memory_pool(PoolOptions::new(1)).await;
    let factory = UnitOfWorkFactory::new(pool.clone());
    let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();

    let task = tokio::spawn(async move {
        factory
            .scope(move |uow| {
                Box::pin(async move {
                    uow.add(Parent::new(Some("aborted".into())))?;
                    uow.flush().await?;
                    let _ = entered_tx.send(());
                    std::future::pending::<UowResult<()>>().await
                })
            })
            .await
    });

    entered_rx.await.unwrap();
    assert_eq!(pool.status().leased, 1);
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    assert!(wait_until(|| pool.status().leased == 0).await);
    assert!(db.rows("a").is_empty());
    let status = pool.status();
    assert_eq!(status.acquired, status.released);
}
