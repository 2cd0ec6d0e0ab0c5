mod common;

use async_trait::async_trait;
use common::memory_pool;
use parking_lot::Mutex;
use scoped_unit_of_work::{
    Connection, ConnectionPool, Connector, DbResult, MemoryDatabase, PoolOptions, RowSet,
    Statement, UnitOfWork, UnitOfWorkFactory, UowError,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn invalid_options_are_rejected() {
    let db = MemoryDatabase::new();
    let err = ConnectionPool::new(db.connector(), PoolOptions::new(0)).unwrap_err();
    assert!(matches!(err, UowError::Config(_)));
    assert_eq!(db.stats().connects, 0);
}

#[tokio::test]
async fn single_connection_serializes_units() {
    let options = PoolOptions::new(1).max_overflow(0).acquire_timeout(Duration::from_secs(2));
    let (db, pool) = memory_pool(options).await;
    let factory = UnitOfWorkFactory::new(pool.clone());
    let events = Arc::new(Mutex::new(Vec::new()));
    let (started_tx, started_rx) = tokio::sync::oneshot::channel();

    let first = tokio::spawn({
        let factory = factory.clone();
        let events = events.clone();
        async move {
            factory
                .scope(move |uow| {
                    Box::pin(async move {
                        events.lock().push("first started");
                        let _ = started_tx.send(());
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        events.lock().push("first finished");
                        uow.commit().await
                    })
                })
                .await
        }
    });

    started_rx.await.unwrap();
    let second_events = events.clone();
    factory
        .scope(move |_uow| {
            Box::pin(async move {
                second_events.lock().push("second started");
                Ok::<_, UowError>(())
            })
        })
        .await
        .expect("second unit should get the connection once the first is done");
    first.await.unwrap().unwrap();

    assert_eq!(
        *events.lock(),
        vec!["first started", "first finished", "second started"]
    );
    let status = pool.status();
    assert_eq!(status.leased, 0);
    assert_eq!(status.open, 1);
    assert_eq!(db.live_connections(), 1);
}

#[tokio::test]
async fn exhausted_pool_times_out_cleanly() {
    let timeout = Duration::from_millis(50);
    let options = PoolOptions::new(1).max_overflow(0).acquire_timeout(timeout);
    let (_db, pool) = memory_pool(options).await;

    let mut holder = UnitOfWork::begin(&pool).await.unwrap();
    let before = pool.status();

    let started = Instant::now();
    let err = UnitOfWork::begin(&pool).await.unwrap_err();
    assert!(started.elapsed() >= timeout);
    assert!(matches!(err, UowError::PoolTimeout { waited } if waited == timeout));
    assert!(err.is_retryable());
    assert_eq!(pool.status(), before, "a timed out acquire changes no counters");

    holder.close().await.unwrap();
    let mut next = UnitOfWork::begin(&pool).await.expect("slot should be free again");
    next.close().await.unwrap();
    assert_eq!(pool.status().leased, 0);
}

#[tokio::test]
async fn overflow_connections_close_on_release() {
    let options = PoolOptions::new(1)
        .max_overflow(2)
        .acquire_timeout(Duration::from_millis(50));
    let (db, pool) = memory_pool(options).await;
    let before = pool.status();

    let mut units = Vec::new();
    for _ in 0..3 {
        units.push(UnitOfWork::begin(&pool).await.unwrap());
    }
    assert_eq!(pool.status().leased, 3);
    assert_eq!(pool.status().open, 3);
    assert!(matches!(
        UnitOfWork::begin(&pool).await,
        Err(UowError::PoolTimeout { .. })
    ));

    for uow in units.iter_mut() {
        uow.close().await.unwrap();
    }
    let after = pool.status();
    assert_eq!(after.leased, 0);
    assert_eq!(after.idle, 1);
    assert_eq!(after.open, 1);
    assert_eq!(after.discarded, before.discarded + 2);
    assert_eq!(db.live_connections(), 1);
}

#[tokio::test]
async fn pre_ping_replaces_dead_idle_connections() {
    let (db, pool) = memory_pool(PoolOptions::new(1).pre_ping(true)).await;

    let pings = db.stats().pings;
    let mut uow = UnitOfWork::begin(&pool).await.unwrap();
    assert_eq!(db.stats().pings, pings + 1);
    uow.close().await.unwrap();

    db.kill_connections();
    let connects = db.stats().connects;
    let discarded = pool.status().discarded;

    let mut uow = UnitOfWork::begin(&pool).await.expect("dead idle connection should be replaced");
    uow.commit().await.unwrap();

    assert_eq!(db.stats().connects, connects + 1);
    assert_eq!(pool.status().discarded, discarded + 1);
    assert_eq!(pool.status().open, 1);
}

#[tokio::test]
async fn without_pre_ping_idle_connections_are_not_pinged() {
    let (db, pool) = memory_pool(PoolOptions::new(1).pre_ping(false)).await;

    let pings = db.stats().pings;
    let mut uow = UnitOfWork::begin(&pool).await.unwrap();
    uow.commit().await.unwrap();
    assert_eq!(db.stats().pings, pings);
}

#[tokio::test]
async fn failed_connect_frees_its_slot() {
    let options = PoolOptions::new(1)
        .max_overflow(0)
        .acquire_timeout(Duration::from_millis(100));
    let (db, pool) = memory_pool(options).await;

    db.kill_connections();
    db.set_unreachable(true);
    let err = UnitOfWork::begin(&pool).await.unwrap_err();
    assert!(matches!(err, UowError::Database(_)));
    assert_eq!(pool.status().leased, 0);
    assert_eq!(pool.status().open, 0);

    db.set_unreachable(false);
    let mut uow = UnitOfWork::begin(&pool).await.expect("slot should not leak");
    uow.close().await.unwrap();
}

#[tokio::test]
async fn dropped_lease_is_discarded() {
    let (db, pool) = memory_pool(PoolOptions::new(1)).await;
    let before = pool.status();

    let lease = pool.acquire().await.unwrap();
    assert_eq!(pool.status().leased, 1);
    drop(lease);

    let after = pool.status();
    assert_eq!(after.leased, 0);
    assert_eq!(after.idle, 0);
    assert_eq!(after.released, before.released + 1);
    assert_eq!(after.discarded, before.discarded + 1);
    assert_eq!(db.live_connections(), 0);
}

#[tokio::test]
async fn closed_pool_refuses_units() {
    let (db, pool) = memory_pool(PoolOptions::new(2)).await;
    let mut holder = UnitOfWork::begin(&pool).await.unwrap();

    pool.close().await;
    assert!(pool.is_closed());
    assert!(matches!(
        UnitOfWork::begin(&pool).await,
        Err(UowError::PoolClosed)
    ));

    // Leased connections are closed when handed back.
    holder.commit().await.unwrap();
    let status = pool.status();
    assert_eq!(status.leased, 0);
    assert_eq!(status.idle, 0);
    assert_eq!(status.open, 0);
    assert_eq!(db.live_connections(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_units_never_exceed_capacity() {
    let options = PoolOptions::new(2)
        .max_overflow(1)
        .acquire_timeout(Duration::from_secs(5));
    let (db, pool) = memory_pool(options).await;
    let factory = UnitOfWorkFactory::new(pool.clone());

    let mut handles = Vec::new();
    for i in 0..20 {
        let factory = factory.clone();
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            factory
                .scope(move |uow| {
                    Box::pin(async move {
                        assert!(pool.status().leased <= 3);
                        uow.add(scoped_unit_of_work::Parent::new(Some(format!("p{i}"))))?;
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        uow.commit().await
                    })
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(db.rows("a").len(), 20);
    let status = pool.status();
    assert_eq!(status.leased, 0);
    assert!(status.open <= 2);
    assert_eq!(status.acquired, status.released);
}

/// Connection whose liveness check never answers.
struct StalledPing;

#[async_trait]
impl Connection for StalledPing {
    async fn begin(&mut self) -> DbResult<()> {
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        Ok(())
    }

    async fn run(&mut self, _statement: &Statement) -> DbResult<RowSet> {
        Ok(RowSet::default())
    }

    async fn ping(&mut self) -> DbResult<()> {
        std::future::pending::<DbResult<()>>().await
    }

    fn is_alive(&self) -> bool {
        true
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        Ok(())
    }
}

struct StalledPingConnector;

#[async_trait]
impl Connector for StalledPingConnector {
    async fn connect(&self) -> DbResult<Box<dyn Connection>> {
        Ok(Box::new(StalledPing))
    }
}

#[tokio::test]
async fn acquire_cancelled_during_pre_ping_counts_the_discard() {
    let pool = ConnectionPool::new(StalledPingConnector, PoolOptions::new(1).pre_ping(true)).unwrap();

    // Fresh connections are not pinged; this one ends up idle.
    let lease = pool.acquire().await.unwrap();
    pool.release(lease).await;
    assert_eq!(pool.status().idle, 1);

    let cancelled = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
    assert!(cancelled.is_err());

    let status = pool.status();
    assert_eq!(status.idle, 0);
    assert_eq!(status.open, 0);
    assert_eq!(status.leased, 0);
    assert_eq!(status.discarded, 1);

    let lease = tokio::time::timeout(Duration::from_secs(1), pool.acquire())
        .await
        .expect("slot should be free after the cancelled acquire")
        .unwrap();
    assert_eq!(pool.status().open, 1);
    pool.release(lease).await;
}
