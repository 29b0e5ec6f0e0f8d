//! Driver-agnostic SQL values and rows.
//!
//! The database adapter is a consumed interface; these types let the queue
//! bind parameters and read result rows without depending on any particular
//! SQL driver.

use crate::error::{Error, Result};

/// A single SQL parameter or column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => SqlValue::Null,
        }
    }
}

/// One result row: ordered `(column, value)` pairs with typed accessors.
#[derive(Debug, Clone, Default)]
pub struct SqlRow {
    columns: Vec<(String, SqlValue)>,
}

impl SqlRow {
    /// Build a row from `(column, value)` pairs.
    pub fn new(columns: Vec<(String, SqlValue)>) -> Self {
        Self { columns }
    }

    /// Raw value by column name.
    pub fn value(&self, name: &str) -> Result<&SqlValue> {
        self.columns
            .iter()
            .find(|(c, _)| c == name)
            .map(|(_, v)| v)
            .ok_or_else(|| Error::Database(format!("missing column '{name}' in result row")))
    }

    /// Non-null TEXT column.
    pub fn text(&self, name: &str) -> Result<&str> {
        match self.value(name)? {
            SqlValue::Text(s) => Ok(s),
            other => Err(Self::type_error(name, "TEXT", other)),
        }
    }

    /// Nullable TEXT column.
    pub fn opt_text(&self, name: &str) -> Result<Option<String>> {
        match self.value(name)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(s) => Ok(Some(s.clone())),
            other => Err(Self::type_error(name, "TEXT", other)),
        }
    }

    /// Non-null INTEGER column.
    pub fn integer(&self, name: &str) -> Result<i64> {
        match self.value(name)? {
            SqlValue::Integer(i) => Ok(*i),
            other => Err(Self::type_error(name, "INTEGER", other)),
        }
    }

    /// Nullable INTEGER column.
    pub fn opt_integer(&self, name: &str) -> Result<Option<i64>> {
        match self.value(name)? {
            SqlValue::Null => Ok(None),
            SqlValue::Integer(i) => Ok(Some(*i)),
            other => Err(Self::type_error(name, "INTEGER", other)),
        }
    }

    /// INTEGER column read as a boolean (`0` = false).
    pub fn boolean(&self, name: &str) -> Result<bool> {
        Ok(self.integer(name)? != 0)
    }

    fn type_error(name: &str, expected: &str, got: &SqlValue) -> Error {
        Error::Database(format!(
            "column '{name}': expected {expected}, got {got:?}"
        ))
    }
}
