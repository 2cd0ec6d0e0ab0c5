#![allow(dead_code)]

pub mod repositories;

pub use repositories::ParentRepository;

use scoped_unit_of_work::{
    schema, Child, ConnectionPool, MemoryDatabase, Parent, PoolOptions, UnitOfWork, UowResult,
};
use std::time::Duration;

/// Install a test-writer subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fresh in-memory database with the parent/child schema, plus a pool over it.
pub async fn memory_pool(options: PoolOptions) -> (MemoryDatabase, ConnectionPool) {
    init_tracing();
    let db = MemoryDatabase::new();
    let pool = ConnectionPool::new(db.connector(), options).expect("Failed to create pool");
    schema::reset(&pool).await.expect("Failed to create schema");
    (db, pool)
}

pub fn quick_timeout(options: PoolOptions) -> PoolOptions {
    options.acquire_timeout(Duration::from_millis(200))
}

/// Commit one parent with the given number of children; returns the parent id.
pub async fn seed_parent(pool: &ConnectionPool, data: &str, children: usize) -> UowResult<i64> {
    let mut uow = UnitOfWork::begin(pool).await?;
    let staged = uow.add(
        Parent::new(Some(data.to_string())).with_children((0..children).map(|_| Child::new()).collect()),
    )?;
    uow.commit().await?;
    uow.close().await?;
    Ok(staged.id().expect("Seeded parent has no id"))
}

/// Poll `condition` until it holds or a second has passed.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
