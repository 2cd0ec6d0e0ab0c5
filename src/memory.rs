//! In-process database backend.
//!
//! Tables live behind a shared mutex; every connection buffers its writes in
//! a transaction overlay that is applied on commit. Locking reads take
//! per-row locks owned by the connection and wait on a [`Notify`] when a row
//! is held elsewhere. Ids come from per-table sequences that, like server
//! sequences, are not rolled back.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::connection::DbResult;
use crate::statement::{Filter, LockWait, TableDef};
use crate::{Connection, Connector, RowSet, Statement, Value};

type StoredRow = BTreeMap<&'static str, Value>;
type RowKey = (&'static str, i64);

/// Counters exposed for assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub connects: u64,
    pub closes: u64,
    pub pings: u64,
    pub begins: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub statements: u64,
    pub lock_waits: u64,
}

struct Table {
    def: TableDef,
    rows: BTreeMap<i64, StoredRow>,
    next_id: i64,
}

impl Table {
    fn primary_key(&self) -> &'static str {
        self.def
            .columns
            .iter()
            .find(|c| c.primary_key)
            .map_or("id", |c| c.name)
    }
}

#[derive(Default)]
struct Store {
    tables: BTreeMap<&'static str, Table>,
    locks: HashMap<RowKey, u64>,
}

impl Store {
    fn table(&self, name: &str) -> DbResult<&Table> {
        self.tables.get(name).ok_or_else(|| missing_relation(name))
    }

    fn table_mut(&mut self, name: &str) -> DbResult<&mut Table> {
        self.tables.get_mut(name).ok_or_else(|| missing_relation(name))
    }

    /// Rows of `table` as seen by a transaction with the given overlay.
    fn view(&self, table: &'static str, overlay: &Overlay) -> DbResult<BTreeMap<i64, StoredRow>> {
        let mut rows = self.table(table)?.rows.clone();
        for ((t, id), row) in overlay {
            if *t != table {
                continue;
            }
            match row {
                Some(row) => rows.insert(*id, row.clone()),
                None => rows.remove(id),
            };
        }
        Ok(rows)
    }

    fn release_locks(&mut self, owner: u64) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, holder| *holder != owner);
        before - self.locks.len()
    }
}

type Overlay = HashMap<RowKey, Option<StoredRow>>;

struct MemoryInner {
    store: Mutex<Store>,
    lock_released: Notify,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<u64, Arc<AtomicBool>>>,
    stats: Mutex<MemoryStats>,
    unreachable: AtomicBool,
}

impl MemoryInner {
    fn release_locks(&self, owner: u64) {
        let released = self.store.lock().release_locks(owner);
        if released > 0 {
            trace!(connection = owner, released, "row locks released");
            self.lock_released.notify_waiters();
        }
    }
}

/// Shared in-memory database. Cloning yields another handle to the same data.
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                store: Mutex::new(Store::default()),
                lock_released: Notify::new(),
                next_conn_id: AtomicU64::new(1),
                connections: Mutex::new(HashMap::new()),
                stats: Mutex::new(MemoryStats::default()),
                unreachable: AtomicBool::new(false),
            }),
        }
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { db: self.clone() }
    }

    pub fn stats(&self) -> MemoryStats {
        *self.inner.stats.lock()
    }

    /// Number of connections opened and not yet closed or dropped.
    pub fn live_connections(&self) -> usize {
        self.inner
            .connections
            .lock()
            .values()
            .filter(|alive| alive.load(Ordering::Acquire))
            .count()
    }

    /// Sever every open connection, as a server restart would. Their locks
    /// are released and their uncommitted work is lost.
    pub fn kill_connections(&self) {
        let ids: Vec<u64> = {
            let conns = self.inner.connections.lock();
            conns
                .iter()
                .map(|(id, alive)| {
                    alive.store(false, Ordering::Release);
                    *id
                })
                .collect()
        };
        debug!(count = ids.len(), "killing memory connections");
        for id in ids {
            self.inner.release_locks(id);
        }
    }

    /// Make new connection attempts fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::Release);
    }

    /// Committed rows of `table`, ordered by primary key.
    pub fn rows(&self, table: &str) -> Vec<BTreeMap<&'static str, Value>> {
        let store = self.inner.store.lock();
        store
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Primary keys of `table` currently locked by some transaction.
    pub fn locked_rows(&self, table: &str) -> Vec<i64> {
        let store = self.inner.store.lock();
        let mut ids: Vec<i64> = store
            .locks
            .keys()
            .filter(|(t, _)| *t == table)
            .map(|(_, id)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// [`Connector`] handing out [`MemoryConnection`]s.
#[derive(Clone)]
pub struct MemoryConnector {
    db: MemoryDatabase,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> DbResult<Box<dyn Connection>> {
        let inner = &self.db.inner;
        if inner.unreachable.load(Ordering::Acquire) {
            return Err(sqlx::Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "memory database is unreachable",
            )));
        }

        let id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let alive = Arc::new(AtomicBool::new(true));
        inner.connections.lock().insert(id, alive.clone());
        inner.stats.lock().connects += 1;
        trace!(connection = id, "memory connection opened");

        Ok(Box::new(MemoryConnection {
            id,
            db: inner.clone(),
            alive,
            tx: None,
        }))
    }
}

/// One session against a [`MemoryDatabase`].
pub struct MemoryConnection {
    id: u64,
    db: Arc<MemoryInner>,
    alive: Arc<AtomicBool>,
    tx: Option<Overlay>,
}

fn ensure_alive(alive: &AtomicBool) -> DbResult<()> {
    if alive.load(Ordering::Acquire) {
        Ok(())
    } else {
        Err(sqlx::Error::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "connection was terminated",
        )))
    }
}

impl MemoryConnection {
    fn ensure_alive(&self) -> DbResult<()> {
        ensure_alive(&self.alive)
    }

    fn finish(&mut self, commit: bool) {
        if let Some(overlay) = self.tx.take() {
            if commit {
                let mut store = self.db.store.lock();
                for ((table, id), row) in overlay {
                    if let Some(t) = store.tables.get_mut(table) {
                        match row {
                            Some(row) => t.rows.insert(id, row),
                            None => t.rows.remove(&id),
                        };
                    }
                }
            }
        }
        self.db.release_locks(self.id);
    }
}

/// Statement execution for one connection. Works on a borrowed overlay, so a
/// cancelled statement leaves the transaction's buffered writes in place.
struct Session<'a> {
    db: &'a MemoryInner,
    id: u64,
    alive: &'a AtomicBool,
}

impl Session<'_> {
    async fn execute(&self, statement: &Statement, overlay: &mut Overlay) -> DbResult<RowSet> {
        match statement {
            Statement::Select {
                table,
                columns,
                filter,
                order_by,
                lock,
            } => {
                let rows = match lock {
                    Some(lock) => self.lock_rows(*table, filter, lock.wait, overlay).await?,
                    None => {
                        let store = self.db.store.lock();
                        matching(store.view(*table, overlay)?, filter)
                    }
                };
                Ok(project(rows, columns, *order_by))
            }
            Statement::Insert {
                table,
                values,
                returning,
            } => {
                let mut store = self.db.store.lock();
                let references: Vec<(&'static str, &'static str, &'static str)> = store
                    .table(table)?
                    .def
                    .columns
                    .iter()
                    .filter_map(|c| c.references.map(|(t, col)| (c.name, t, col)))
                    .collect();
                for (column, target, _) in &references {
                    let Some((_, value)) = values.iter().find(|(c, _)| c == column) else {
                        continue;
                    };
                    let Some(key) = value.as_i64() else { continue };
                    if !store.view(*target, overlay)?.contains_key(&key) {
                        return Err(sqlx::Error::Protocol(format!(
                            "insert on \"{table}\" violates foreign key: {column}={key} not present in \"{target}\""
                        )));
                    }
                }

                let t = store.table_mut(table)?;
                let pk = t.primary_key();
                let mut row: StoredRow = t.def.columns.iter().map(|c| (c.name, Value::Null)).collect();
                for (column, value) in values {
                    row.insert(*column, value.clone());
                }
                let id = match row.get(pk).and_then(Value::as_i64) {
                    Some(id) => id,
                    None => {
                        t.next_id += 1;
                        t.next_id
                    }
                };
                row.insert(pk, Value::Int(id));
                let returned = row.get(returning).cloned().unwrap_or(Value::Null);
                overlay.insert((*table, id), Some(row));
                Ok(RowSet::new(vec![returning.to_string()], vec![vec![returned]]))
            }
            Statement::Update {
                table,
                assignments,
                filter,
            } => {
                let store = self.db.store.lock();
                let rows = matching(store.view(*table, overlay)?, filter);
                let affected = rows.len() as u64;
                for (id, mut row) in rows {
                    for (column, value) in assignments {
                        row.insert(*column, value.clone());
                    }
                    overlay.insert((*table, id), Some(row));
                }
                Ok(RowSet::affected(affected))
            }
            Statement::Delete { table, filter } => {
                let store = self.db.store.lock();
                let rows = matching(store.view(*table, overlay)?, filter);
                let affected = rows.len() as u64;
                for (id, _) in rows {
                    overlay.insert((*table, id), None);
                }
                Ok(RowSet::affected(affected))
            }
            Statement::CreateTable(def) => {
                let mut store = self.db.store.lock();
                if store.tables.contains_key(def.name) {
                    return Err(sqlx::Error::Protocol(format!(
                        "relation \"{}\" already exists",
                        def.name
                    )));
                }
                store.tables.insert(
                    def.name,
                    Table {
                        def: def.clone(),
                        rows: BTreeMap::new(),
                        next_id: 0,
                    },
                );
                Ok(RowSet::default())
            }
            Statement::DropTable { table } => {
                self.db.store.lock().tables.remove(table);
                overlay.retain(|(t, _), _| t != table);
                Ok(RowSet::default())
            }
            Statement::Raw(sql) => Err(sqlx::Error::Protocol(format!(
                "memory backend cannot run raw SQL: {sql}"
            ))),
        }
    }

    async fn lock_rows(
        &self,
        table: &'static str,
        filter: &Filter,
        wait: LockWait,
        overlay: &Overlay,
    ) -> DbResult<Vec<(i64, StoredRow)>> {
        let mut waited = false;
        loop {
            let released = self.db.lock_released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let granted = {
                let mut store = self.db.store.lock();
                let mut rows = matching(store.view(table, overlay)?, filter);
                let held: HashSet<i64> = rows
                    .iter()
                    .map(|(id, _)| *id)
                    .filter(|id| {
                        store
                            .locks
                            .get(&(table, *id))
                            .is_some_and(|owner| *owner != self.id)
                    })
                    .collect();

                match wait {
                    _ if held.is_empty() => {}
                    LockWait::NoWait => {
                        return Err(sqlx::Error::Protocol(format!(
                            "could not obtain lock on row in relation \"{table}\""
                        )));
                    }
                    LockWait::SkipLocked => rows.retain(|(id, _)| !held.contains(id)),
                    LockWait::Wait => {
                        trace!(connection = self.id, table, rows = ?held, "waiting for row locks");
                        rows.clear();
                    }
                }

                if held.is_empty() || wait != LockWait::Wait {
                    for (id, _) in &rows {
                        store.locks.insert((table, *id), self.id);
                    }
                    Some(rows)
                } else {
                    None
                }
            };

            match granted {
                Some(rows) => return Ok(rows),
                None => {
                    if !waited {
                        self.db.stats.lock().lock_waits += 1;
                        waited = true;
                    }
                    released.await;
                    ensure_alive(self.alive)?;
                }
            }
        }
    }
}

fn matching(rows: BTreeMap<i64, StoredRow>, filter: &Filter) -> Vec<(i64, StoredRow)> {
    rows.into_iter()
        .filter(|(_, row)| match filter {
            Filter::All => true,
            Filter::Eq(column, value) => row.get(column).unwrap_or(&Value::Null) == value,
            Filter::In(column, values) => row.get(column).is_some_and(|v| values.contains(v)),
        })
        .collect()
}

fn project(mut rows: Vec<(i64, StoredRow)>, columns: &[&'static str], order_by: Option<&'static str>) -> RowSet {
    if let Some(column) = order_by {
        rows.sort_by(|(_, a), (_, b)| a.get(column).cmp(&b.get(column)));
    }
    let values = rows
        .into_iter()
        .map(|(_, row)| {
            columns
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                .collect()
        })
        .collect();
    RowSet::new(columns.iter().map(|c| c.to_string()).collect(), values)
}

fn missing_relation(name: &str) -> sqlx::Error {
    sqlx::Error::Protocol(format!("relation \"{name}\" does not exist"))
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn begin(&mut self) -> DbResult<()> {
        self.ensure_alive()?;
        if self.tx.is_some() {
            return Err(sqlx::Error::Protocol(
                "there is already a transaction in progress".into(),
            ));
        }
        self.tx = Some(Overlay::new());
        self.db.stats.lock().begins += 1;
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.ensure_alive()?;
        self.finish(true);
        self.db.stats.lock().commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.ensure_alive()?;
        self.finish(false);
        self.db.stats.lock().rollbacks += 1;
        Ok(())
    }

    async fn run(&mut self, statement: &Statement) -> DbResult<RowSet> {
        self.ensure_alive()?;
        self.db.stats.lock().statements += 1;
        trace!(connection = self.id, sql = %statement, "memory statement");

        let session = Session {
            db: &self.db,
            id: self.id,
            alive: &self.alive,
        };
        match self.tx.as_mut() {
            Some(overlay) => session.execute(statement, overlay).await,
            // Autocommit: a statement outside a transaction is its own transaction.
            None => {
                let mut overlay = Overlay::new();
                let result = session.execute(statement, &mut overlay).await;
                self.tx = Some(overlay);
                self.finish(result.is_ok());
                result
            }
        }
    }

    async fn ping(&mut self) -> DbResult<()> {
        self.db.stats.lock().pings += 1;
        self.ensure_alive()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        // Drop does the bookkeeping.
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.tx = None;
        self.db.release_locks(self.id);
        self.alive.store(false, Ordering::Release);
        self.db.connections.lock().remove(&self.id);
        self.db.stats.lock().closes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;
    use crate::statement::RowLock;
    use std::time::Duration;

    fn insert(data: &str) -> Statement {
        Statement::Insert {
            table: "a",
            values: vec![("data", Value::from(data))],
            returning: "id",
        }
    }

    fn lock_all() -> Statement {
        Statement::Select {
            table: "a",
            columns: vec!["id"],
            filter: Filter::All,
            order_by: None,
            lock: Some(RowLock::of("a")),
        }
    }

    #[tokio::test]
    async fn cancelled_lock_wait_keeps_buffered_writes() {
        let db = MemoryDatabase::new();
        let mut setup = db.connector().connect().await.unwrap();
        schema::create_all(&mut *setup).await.unwrap();
        setup.run(&insert("locked")).await.unwrap();

        let mut holder = db.connector().connect().await.unwrap();
        holder.begin().await.unwrap();
        holder.run(&lock_all()).await.unwrap();

        let mut writer = db.connector().connect().await.unwrap();
        writer.begin().await.unwrap();
        writer.run(&insert("buffered")).await.unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(20), writer.run(&lock_all())).await;
        assert!(waited.is_err());

        holder.rollback().await.unwrap();
        writer.commit().await.unwrap();

        let data: Vec<Value> = db.rows("a").into_iter().map(|row| row["data"].clone()).collect();
        assert_eq!(data, vec![Value::from("locked"), Value::from("buffered")]);
    }

    #[tokio::test]
    async fn killed_connection_releases_its_locks() {
        let db = MemoryDatabase::new();
        let mut setup = db.connector().connect().await.unwrap();
        schema::create_all(&mut *setup).await.unwrap();
        setup.run(&insert("x")).await.unwrap();

        let mut holder = db.connector().connect().await.unwrap();
        holder.begin().await.unwrap();
        holder.run(&lock_all()).await.unwrap();
        assert_eq!(db.locked_rows("a"), vec![1]);

        db.kill_connections();
        assert!(db.locked_rows("a").is_empty());
        assert!(holder.commit().await.is_err());
        assert!(!holder.is_alive());
    }
}
