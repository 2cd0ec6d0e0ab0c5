//! Schema bootstrap for the parent/child tables.
//!
//! Setup only: these run outside any unit of work, in autocommit.

use tracing::info;

use crate::statement::{ColumnDef, TableDef};
use crate::{Child, Connection, ConnectionPool, Entity, Parent, Statement, UowResult};

pub fn tables() -> Vec<TableDef> {
    vec![
        TableDef {
            name: Parent::TABLE,
            columns: vec![
                ColumnDef {
                    name: "id",
                    sql_type: "BIGSERIAL",
                    primary_key: true,
                    references: None,
                },
                ColumnDef {
                    name: "data",
                    sql_type: "TEXT",
                    primary_key: false,
                    references: None,
                },
            ],
        },
        TableDef {
            name: Child::TABLE,
            columns: vec![
                ColumnDef {
                    name: "id",
                    sql_type: "BIGSERIAL",
                    primary_key: true,
                    references: None,
                },
                ColumnDef {
                    name: "parent_id",
                    sql_type: "BIGINT",
                    primary_key: false,
                    references: Some((Parent::TABLE, "id")),
                },
            ],
        },
    ]
}

/// Create tables in dependency order.
pub async fn create_all(conn: &mut dyn Connection) -> UowResult<()> {
    for table in tables() {
        conn.run(&Statement::CreateTable(table)).await?;
    }
    Ok(())
}

/// Drop tables, dependents first.
pub async fn drop_all(conn: &mut dyn Connection) -> UowResult<()> {
    for table in tables().iter().rev() {
        conn.run(&Statement::DropTable { table: table.name }).await?;
    }
    Ok(())
}

/// Drop and recreate every table on a connection leased from `pool`.
pub async fn reset(pool: &ConnectionPool) -> UowResult<()> {
    let mut conn = pool.acquire().await?;
    let result = match drop_all(&mut *conn).await {
        Ok(()) => create_all(&mut *conn).await,
        Err(e) => Err(e),
    };
    pool.release(conn).await;
    info!(ok = result.is_ok(), "schema reset");
    result
}
