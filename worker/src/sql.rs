//! The seam between worker requests and the worker's MySQL service.
//!
//! Requests never build connections themselves; they go through a
//! [`SqlBackend`], so tests substitute an in-memory implementation and the
//! production binary wires in [`MySqlBackend`].

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::mysql::MySqlPool;
use sqlx::{Column, Row};
use std::collections::VecDeque;
use std::fmt::Debug;

/// A SQL result set rendered to strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlResultSet {
    /// Column names.
    pub columns: Vec<String>,
    /// Rows; NULLs render as empty strings.
    pub rows: Vec<Vec<String>>,
    /// Rows affected by a statement.
    pub affected: u64,
}

/// Executes SQL on behalf of worker requests.
#[async_trait]
pub trait SqlBackend: Debug + Send + Sync {
    /// Execute a statement; returns the number of affected rows.
    async fn execute(&self, sql: &str) -> Result<u64, String>;

    /// Run a query and render its result set.
    async fn query(&self, sql: &str) -> Result<SqlResultSet, String>;
}

/// The sqlx-backed [`SqlBackend`].
#[derive(Debug)]
pub struct MySqlBackend {
    pool: MySqlPool,
}

impl MySqlBackend {
    /// Wrap an existing connection pool.
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SqlBackend for MySqlBackend {
    async fn execute(&self, sql: &str) -> Result<u64, String> {
        sqlx::query(sql)
            .execute(&self.pool)
            .await
            .map(|done| done.rows_affected())
            .map_err(|e| e.to_string())
    }

    async fn query(&self, sql: &str) -> Result<SqlResultSet, String> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;

        let mut result = SqlResultSet::default();
        if let Some(first) = rows.first() {
            result.columns = first
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect();
        }
        for row in &rows {
            let mut cells = Vec::with_capacity(result.columns.len());
            for index in 0..result.columns.len() {
                // Numeric and textual columns all render as strings; a NULL
                // or an unsupported type renders empty.
                let cell = row
                    .try_get::<String, _>(index)
                    .or_else(|_| row.try_get::<i64, _>(index).map(|v| v.to_string()))
                    .or_else(|_| row.try_get::<u64, _>(index).map(|v| v.to_string()))
                    .or_else(|_| row.try_get::<f64, _>(index).map(|v| v.to_string()))
                    .unwrap_or_default();
                cells.push(cell);
            }
            result.rows.push(cells);
        }
        Ok(result)
    }
}

/// An in-memory [`SqlBackend`] for tests: records statements and serves
/// scripted results.
#[derive(Debug, Default)]
pub struct MockSqlBackend {
    /// Statements passed to [`SqlBackend::execute`], in order.
    pub executed: Mutex<Vec<String>>,
    /// Queries passed to [`SqlBackend::query`], in order.
    pub queried: Mutex<Vec<String>>,
    /// Results handed out to queries, front first; an empty script answers
    /// with an empty result set.
    pub results: Mutex<VecDeque<Result<SqlResultSet, String>>>,
}

impl MockSqlBackend {
    /// Create a mock with no scripted results.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next query.
    pub fn push_result(&self, result: Result<SqlResultSet, String>) {
        self.results.lock().push_back(result);
    }
}

#[async_trait]
impl SqlBackend for MockSqlBackend {
    async fn execute(&self, sql: &str) -> Result<u64, String> {
        self.executed.lock().push(sql.to_string());
        Ok(0)
    }

    async fn query(&self, sql: &str) -> Result<SqlResultSet, String> {
        self.queried.lock().push(sql.to_string());
        self.results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(SqlResultSet::default()))
    }
}
