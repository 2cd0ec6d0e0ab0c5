//! PostgreSQL backend over a single sqlx [`PgConnection`] per pooled session.
//!
//! Pooling, transactions and liveness are managed by this crate, so the
//! connection is driven directly rather than through a `PgPool`.

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Connection as _, Postgres, Row, TypeInfo};
use std::str::FromStr;

use crate::connection::DbResult;
use crate::statement::SqlText;
use crate::{
    Connection, ConnectionPool, Connector, DatabaseConfig, PoolOptions, RowSet, Statement,
    UowResult, Value,
};

/// Opens PostgreSQL sessions for a [`ConnectionPool`].
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
}

impl PgConnector {
    pub fn new(options: PgConnectOptions) -> Self {
        Self { options }
    }

    pub fn from_dsn(dsn: &str) -> UowResult<Self> {
        Ok(Self::new(PgConnectOptions::from_str(dsn)?))
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self) -> DbResult<Box<dyn Connection>> {
        let conn = PgConnection::connect_with(&self.options).await?;
        Ok(Box::new(PgSession { conn, alive: true }))
    }
}

impl ConnectionPool {
    /// Lazily connecting pool for a PostgreSQL DSN.
    pub fn connect(dsn: &str, options: PoolOptions) -> UowResult<Self> {
        Self::new(PgConnector::from_dsn(dsn)?, options)
    }

    pub fn from_config(config: &DatabaseConfig) -> UowResult<Self> {
        Self::connect(&config.dsn, config.pool.clone())
    }
}

/// A leased PostgreSQL connection.
pub struct PgSession {
    conn: PgConnection,
    alive: bool,
}

impl PgSession {
    // Transport failures mean the session is gone; server errors do not.
    fn track<T>(&mut self, result: DbResult<T>) -> DbResult<T> {
        if let Err(e) = &result {
            if matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) | sqlx::Error::WorkerCrashed
            ) {
                self.alive = false;
            }
        }
        result
    }

    async fn simple(&mut self, sql: &'static str) -> DbResult<()> {
        let result = sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql(sql))
            .await
            .map(|_| ());
        self.track(result)
    }

    async fn execute(&mut self, statement: &Statement) -> DbResult<RowSet> {
        let SqlText { sql, params } = statement.to_sql();
        match statement {
            Statement::Raw(_) => {
                let rows = sqlx::Executor::fetch_all(&mut self.conn, sqlx::raw_sql(&sql)).await?;
                decode(&rows, &[])
            }
            Statement::Select { columns, .. } => {
                let rows = fetch_rows(&mut self.conn, &sql, params).await?;
                decode(&rows, columns)
            }
            Statement::Insert { returning, .. } => {
                let rows = fetch_rows(&mut self.conn, &sql, params).await?;
                decode(&rows, &[*returning])
            }
            _ => Ok(RowSet::affected(execute_sql(&mut self.conn, &sql, params).await?)),
        }
    }
}

fn bind(sql: &str, params: Vec<Value>) -> Query<'_, Postgres, PgArguments> {
    let mut query = sqlx::query::<Postgres>(sql);
    for param in params {
        query = match param {
            Value::Int(v) => query.bind(v),
            Value::Text(v) => query.bind(v),
            Value::Null => query.bind(None::<String>),
        };
    }
    query
}

// The executor methods return boxed `Send` futures; the generic
// `Query::fetch_all` cannot be proven `Send` inside `async_trait` bodies.
async fn fetch_rows(conn: &mut PgConnection, sql: &str, params: Vec<Value>) -> DbResult<Vec<PgRow>> {
    sqlx::Executor::fetch_all(conn, bind(sql, params)).await
}

async fn execute_sql(conn: &mut PgConnection, sql: &str, params: Vec<Value>) -> DbResult<u64> {
    let done = sqlx::Executor::execute(conn, bind(sql, params)).await?;
    Ok(done.rows_affected())
}

fn decode(rows: &[PgRow], expected: &[&str]) -> DbResult<RowSet> {
    let columns: Vec<String> = match rows.first() {
        Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
        None => expected.iter().map(|c| c.to_string()).collect(),
    };

    let mut values = Vec::with_capacity(rows.len());
    for row in rows {
        let mut out = Vec::with_capacity(columns.len());
        for (i, column) in row.columns().iter().enumerate() {
            let value: Value = match column.type_info().name() {
                "INT8" => row.try_get::<Option<i64>, _>(i)?.into(),
                "INT4" => row.try_get::<Option<i32>, _>(i)?.map(i64::from).into(),
                "INT2" => row.try_get::<Option<i16>, _>(i)?.map(i64::from).into(),
                "BOOL" => row.try_get::<Option<bool>, _>(i)?.map(i64::from).into(),
                "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => row.try_get::<Option<String>, _>(i)?.into(),
                other => {
                    return Err(sqlx::Error::Decode(
                        format!("unsupported column type {other} for `{}`", column.name()).into(),
                    ))
                }
            };
            out.push(value);
        }
        values.push(out);
    }
    Ok(RowSet::new(columns, values))
}

#[async_trait]
impl Connection for PgSession {
    async fn begin(&mut self) -> DbResult<()> {
        self.simple("BEGIN").await
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.simple("COMMIT").await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.simple("ROLLBACK").await
    }

    async fn run(&mut self, statement: &Statement) -> DbResult<RowSet> {
        let result = self.execute(statement).await;
        self.track(result)
    }

    async fn ping(&mut self) -> DbResult<()> {
        let result = self.conn.ping().await;
        self.track(result)
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        let session = *self;
        session.conn.close().await
    }
}
