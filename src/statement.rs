//! Typed statements handed to a [`Connection`](crate::Connection).
//!
//! Statements render to PostgreSQL text with `$n` placeholders; backends that
//! do not speak SQL interpret the structured form directly.

use std::fmt;

/// A single column value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v:?}"),
        }
    }
}

/// Row filter for selects, updates and deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    All,
    Eq(&'static str, Value),
    In(&'static str, Vec<Value>),
}

/// What a locking read does when a matched row is already locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockWait {
    /// Suspend until the holder commits or rolls back.
    #[default]
    Wait,
    /// Fail immediately.
    NoWait,
    /// Leave locked rows out of the result.
    SkipLocked,
}

/// `FOR UPDATE OF <table>`: matched rows stay locked until the
/// surrounding transaction ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLock {
    pub of: &'static str,
    pub wait: LockWait,
}

impl RowLock {
    pub fn of(table: &'static str) -> Self {
        Self {
            of: table,
            wait: LockWait::Wait,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub sql_type: &'static str,
    pub primary_key: bool,
    pub references: Option<(&'static str, &'static str)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: Vec<ColumnDef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Select {
        table: &'static str,
        columns: Vec<&'static str>,
        filter: Filter,
        order_by: Option<&'static str>,
        lock: Option<RowLock>,
    },
    /// Inserts one row and returns the `returning` column.
    Insert {
        table: &'static str,
        values: Vec<(&'static str, Value)>,
        returning: &'static str,
    },
    Update {
        table: &'static str,
        assignments: Vec<(&'static str, Value)>,
        filter: Filter,
    },
    Delete {
        table: &'static str,
        filter: Filter,
    },
    CreateTable(TableDef),
    DropTable {
        table: &'static str,
    },
    Raw(String),
}

/// Rendered statement text plus its positional parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlText {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn select(table: &'static str, columns: Vec<&'static str>, filter: Filter) -> Self {
        Statement::Select {
            table,
            columns,
            filter,
            order_by: None,
            lock: None,
        }
    }

    pub fn is_locking(&self) -> bool {
        matches!(self, Statement::Select { lock: Some(_), .. })
    }

    pub fn to_sql(&self) -> SqlText {
        let mut params = Vec::new();
        let sql = match self {
            Statement::Select {
                table,
                columns,
                filter,
                order_by,
                lock,
            } => {
                let mut sql = format!("SELECT {} FROM {}", columns.join(", "), table);
                push_where(&mut sql, filter, &mut params);
                if let Some(col) = order_by {
                    sql.push_str(&format!(" ORDER BY {col}"));
                }
                if let Some(lock) = lock {
                    sql.push_str(&format!(" FOR UPDATE OF {}", lock.of));
                    match lock.wait {
                        LockWait::Wait => {}
                        LockWait::NoWait => sql.push_str(" NOWAIT"),
                        LockWait::SkipLocked => sql.push_str(" SKIP LOCKED"),
                    }
                }
                sql
            }
            Statement::Insert {
                table,
                values,
                returning,
            } => {
                let columns: Vec<&str> = values.iter().map(|(c, _)| *c).collect();
                let placeholders: Vec<String> = values
                    .iter()
                    .map(|(_, v)| placeholder(v, &mut params))
                    .collect();
                if values.is_empty() {
                    format!("INSERT INTO {table} DEFAULT VALUES RETURNING {returning}")
                } else {
                    format!(
                        "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
                        table,
                        columns.join(", "),
                        placeholders.join(", "),
                        returning
                    )
                }
            }
            Statement::Update {
                table,
                assignments,
                filter,
            } => {
                let sets: Vec<String> = assignments
                    .iter()
                    .map(|(c, v)| format!("{} = {}", c, placeholder(v, &mut params)))
                    .collect();
                let mut sql = format!("UPDATE {} SET {}", table, sets.join(", "));
                push_where(&mut sql, filter, &mut params);
                sql
            }
            Statement::Delete { table, filter } => {
                let mut sql = format!("DELETE FROM {table}");
                push_where(&mut sql, filter, &mut params);
                sql
            }
            Statement::CreateTable(def) => {
                let columns: Vec<String> = def
                    .columns
                    .iter()
                    .map(|c| {
                        let mut col = format!("{} {}", c.name, c.sql_type);
                        if c.primary_key {
                            col.push_str(" PRIMARY KEY");
                        }
                        if let Some((table, column)) = c.references {
                            col.push_str(&format!(" REFERENCES {table}({column})"));
                        }
                        col
                    })
                    .collect();
                format!("CREATE TABLE {} ({})", def.name, columns.join(", "))
            }
            Statement::DropTable { table } => format!("DROP TABLE IF EXISTS {table} CASCADE"),
            Statement::Raw(sql) => sql.clone(),
        };
        SqlText { sql, params }
    }
}

// NULL is written inline so the server never has to infer a parameter type for it.
fn placeholder(value: &Value, params: &mut Vec<Value>) -> String {
    if value.is_null() {
        return "NULL".to_string();
    }
    params.push(value.clone());
    format!("${}", params.len())
}

fn push_where(sql: &mut String, filter: &Filter, params: &mut Vec<Value>) {
    match filter {
        Filter::All => {}
        Filter::Eq(col, Value::Null) => sql.push_str(&format!(" WHERE {col} IS NULL")),
        Filter::Eq(col, value) => {
            let p = placeholder(value, params);
            sql.push_str(&format!(" WHERE {col} = {p}"));
        }
        Filter::In(_, values) if values.is_empty() => sql.push_str(" WHERE FALSE"),
        Filter::In(col, values) => {
            let list: Vec<String> = values.iter().map(|v| placeholder(v, params)).collect();
            sql.push_str(&format!(" WHERE {} IN ({})", col, list.join(", ")));
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql().sql)
    }
}
