use crate::{UowError, UowResult, Value};

/// Rows returned by a statement, in column order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: u64,
}

impl RowSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let rows_affected = rows.len() as u64;
        Self {
            columns,
            rows,
            rows_affected,
        }
    }

    /// Result of a write that returns no rows.
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Row<'_>> {
        self.rows.iter().map(move |values| Row { set: self, values })
    }

    pub fn first(&self) -> Option<Row<'_>> {
        self.iter().next()
    }
}

/// Borrowed view of a single row.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    set: &'a RowSet,
    values: &'a [Value],
}

impl<'a> Row<'a> {
    pub fn get(&self, column: &str) -> UowResult<&'a Value> {
        self.set
            .columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
            .ok_or_else(|| UowError::Decode(format!("missing column `{column}`")))
    }

    pub fn get_i64(&self, column: &str) -> UowResult<i64> {
        self.get(column)?
            .as_i64()
            .ok_or_else(|| UowError::Decode(format!("column `{column}` is not an integer")))
    }

    pub fn get_opt_i64(&self, column: &str) -> UowResult<Option<i64>> {
        match self.get(column)? {
            Value::Null => Ok(None),
            Value::Int(v) => Ok(Some(*v)),
            Value::Text(_) => Err(UowError::Decode(format!(
                "column `{column}` is not an integer"
            ))),
        }
    }

    pub fn get_opt_text(&self, column: &str) -> UowResult<Option<String>> {
        match self.get(column)? {
            Value::Null => Ok(None),
            Value::Text(v) => Ok(Some(v.clone())),
            Value::Int(_) => Err(UowError::Decode(format!("column `{column}` is not text"))),
        }
    }
}
