use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use uuid::Uuid;

use scoped_unit_of_work::{
    Entity, Executor, Parent, Query, Statement, TransactionAware, UowResult, Value,
};

/// Transaction-aware Parent Repository
pub struct ParentRepository {
    executor: Executor,
    // Track operations for verification in tests
    committed: Arc<RwLock<Option<Uuid>>>,
    rolled_back: Arc<RwLock<Option<Uuid>>>,
}

impl ParentRepository {
    pub fn new(executor: Executor) -> Arc<Self> {
        Arc::new(Self {
            executor,
            committed: Arc::new(RwLock::new(None)),
            rolled_back: Arc::new(RwLock::new(None)),
        })
    }

    pub async fn create(&self, data: &str) -> UowResult<i64> {
        let rows = self
            .executor
            .run(&Statement::Insert {
                table: Parent::TABLE,
                values: vec![("data", Value::from(data))],
                returning: "id",
            })
            .await?;
        rows.first()
            .expect("Insert returned no row")
            .get_i64("id")
    }

    pub async fn find_by_id(&self, id: i64) -> UowResult<Option<Parent>> {
        let rows = self.executor.run(&Query::<Parent>::by_id(id).statement()).await?;
        rows.first()
            .map(|row| Parent::from_row(row, self.executor.scope()))
            .transpose()
    }

    pub async fn count(&self) -> UowResult<usize> {
        let rows = self.executor.run(&Query::<Parent>::all().statement()).await?;
        Ok(rows.len())
    }

    pub fn committed_in(&self) -> Option<Uuid> {
        *self.committed.read()
    }

    pub fn rolled_back_in(&self) -> Option<Uuid> {
        *self.rolled_back.read()
    }

    pub fn is_committed(&self) -> bool {
        self.committed.read().is_some()
    }

    pub fn is_rolled_back(&self) -> bool {
        self.rolled_back.read().is_some()
    }
}

#[async_trait]
impl TransactionAware for ParentRepository {
    async fn on_commit(&self, unit_of_work: Uuid) -> UowResult<()> {
        *self.committed.write() = Some(unit_of_work);
        Ok(())
    }

    async fn on_rollback(&self, unit_of_work: Uuid) -> UowResult<()> {
        *self.rolled_back.write() = Some(unit_of_work);
        Ok(())
    }
}
