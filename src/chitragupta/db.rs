//! Prepared-statement database contract.
//!
//! Buddhi, Kartavya persistence, and bandit auto-save talk to storage
//! through the narrow [`Database`] trait; [`SqliteDatabase`] is the bundled
//! implementation. Any backend that round-trips the documented shapes is
//! conforming — callers never see rusqlite types.

use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{Connection, ToSql};
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;

/// A single bind parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
    Real(f64),
    Null,
}

impl From<&str> for SqlParam {
    fn from(s: &str) -> Self {
        SqlParam::Text(s.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(s: String) -> Self {
        SqlParam::Text(s)
    }
}

impl From<i64> for SqlParam {
    fn from(n: i64) -> Self {
        SqlParam::Int(n)
    }
}

impl From<u64> for SqlParam {
    fn from(n: u64) -> Self {
        SqlParam::Int(n as i64)
    }
}

impl From<f64> for SqlParam {
    fn from(n: f64) -> Self {
        SqlParam::Real(n)
    }
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlParam::Text(s) => ToSqlOutput::Owned(SqlValue::Text(s.clone())),
            SqlParam::Int(n) => ToSqlOutput::Owned(SqlValue::Integer(*n)),
            SqlParam::Real(n) => ToSqlOutput::Owned(SqlValue::Real(*n)),
            SqlParam::Null => ToSqlOutput::Owned(SqlValue::Null),
        })
    }
}

/// A result row: column name → JSON value.
pub type Row = HashMap<String, Value>;

/// Database failure surfaced to callers.
#[derive(Debug, Clone)]
pub enum DbError {
    /// Underlying engine error (SQL syntax, constraint violation, I/O).
    Engine(String),
    /// Schema or data did not match the documented shape.
    Corrupt(String),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::Engine(msg) => write!(f, "database error: {}", msg),
            DbError::Corrupt(msg) => write!(f, "corrupt data: {}", msg),
        }
    }
}

impl Error for DbError {}

/// Narrow prepared-statement interface.
pub trait Database: Send + Sync {
    /// Execute one or more statements with no parameters (DDL).
    fn exec(&self, sql: &str) -> Result<(), DbError>;

    /// Execute one statement; returns the number of affected rows.
    fn run(&self, sql: &str, params: &[SqlParam]) -> Result<usize, DbError>;

    /// Fetch the first matching row, if any.
    fn get(&self, sql: &str, params: &[SqlParam]) -> Result<Option<Row>, DbError>;

    /// Fetch every matching row.
    fn all(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<Row>, DbError>;
}

/// SQLite implementation with a mutex-serialized connection.
pub struct SqliteDatabase {
    conn: Mutex<Connection>,
}

impl SqliteDatabase {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let conn = Connection::open(path).map_err(|e| DbError::Engine(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database, handy for tests and ephemeral hosts.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory().map_err(|e| DbError::Engine(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_map(row: &rusqlite::Row<'_>) -> Result<Row, rusqlite::Error> {
        let mut map = HashMap::new();
        for (idx, name) in row.as_ref().column_names().iter().enumerate() {
            let value = match row.get_ref(idx)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(n) => Value::from(n),
                ValueRef::Real(n) => serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).to_string()),
                // The documented shapes never persist blobs.
                ValueRef::Blob(_) => Value::Null,
            };
            map.insert((*name).to_string(), value);
        }
        Ok(map)
    }
}

impl Database for SqliteDatabase {
    fn exec(&self, sql: &str) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(sql)
            .map_err(|e| DbError::Engine(e.to_string()))
    }

    fn run(&self, sql: &str, params: &[SqlParam]) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| DbError::Engine(e.to_string()))?;
        stmt.execute(rusqlite::params_from_iter(params.iter()))
            .map_err(|e| DbError::Engine(e.to_string()))
    }

    fn get(&self, sql: &str, params: &[SqlParam]) -> Result<Option<Row>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| DbError::Engine(e.to_string()))?;
        let mut rows = stmt
            .query(rusqlite::params_from_iter(params.iter()))
            .map_err(|e| DbError::Engine(e.to_string()))?;
        match rows.next().map_err(|e| DbError::Engine(e.to_string()))? {
            Some(row) => Ok(Some(
                Self::row_to_map(row).map_err(|e| DbError::Engine(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    fn all(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<Row>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| DbError::Engine(e.to_string()))?;
        let mut rows = stmt
            .query(rusqlite::params_from_iter(params.iter()))
            .map_err(|e| DbError::Engine(e.to_string()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| DbError::Engine(e.to_string()))? {
            out.push(Self::row_to_map(row).map_err(|e| DbError::Engine(e.to_string()))?);
        }
        Ok(out)
    }
}
