//! The LOAD stage: moving a preprocessed file into the super-transaction's
//! MySQL partition.

use async_trait::async_trait;
use data_types::{CsvDialect, TransactionId};
use parking_lot::Mutex;
use sqlx::mysql::MySqlPool;
use sqlx::Row;
use std::fmt::Debug;
use std::path::PathBuf;

/// One load order.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// Target database.
    pub database: String,
    /// Base table name; the chunk and overlap flag select the actual table.
    pub table: String,
    /// Chunk number.
    pub chunk: u32,
    /// Whether the overlap table is the target.
    pub is_overlap: bool,
    /// The super-transaction whose partition receives the rows.
    pub transaction_id: TransactionId,
    /// The preprocessed input file.
    pub path: PathBuf,
    /// Character set of the input.
    pub charset: String,
    /// CSV dialect rendered into the statement.
    pub dialect: CsvDialect,
    /// Use `LOAD DATA LOCAL INFILE` (client-side file) instead of a
    /// server-side path.
    pub local: bool,
    /// Cap on the number of warnings retained.
    pub max_num_warnings: u32,
}

impl LoadRequest {
    /// The chunk table the rows land in.
    pub fn target_table(&self) -> String {
        if self.is_overlap {
            format!("{}FullOverlap_{}", self.table, self.chunk)
        } else {
            format!("{}_{}", self.table, self.chunk)
        }
    }

    /// Render the `LOAD DATA` statement.
    pub fn statement(&self) -> String {
        format!(
            "LOAD DATA {}INFILE '{}' INTO TABLE `{}`.`{}` PARTITION (p{}) CHARACTER SET '{}' {}",
            if self.local { "LOCAL " } else { "" },
            self.path.display(),
            self.database.replace('`', "``"),
            self.target_table().replace('`', "``"),
            self.transaction_id,
            self.charset.replace('\'', "''"),
            self.dialect.load_data_options_sql(),
        )
    }
}

/// The outcome of a successful load.
#[derive(Debug, Clone, Default)]
pub struct LoadOutcome {
    /// Number of warnings MySQL reported.
    pub num_warnings: u64,
    /// Retained warning messages, capped by the request.
    pub warnings: Vec<String>,
}

/// Executes load orders. The engine only talks to this seam, so tests run
/// without a database.
#[async_trait]
pub trait LoadInterface: Debug + Send + Sync {
    /// Execute one load; an `Err` carries the database's error text.
    async fn load(&self, request: &LoadRequest) -> Result<LoadOutcome, String>;
}

/// The sqlx-backed [`LoadInterface`].
#[derive(Debug)]
pub struct MySqlLoader {
    pool: MySqlPool,
}

impl MySqlLoader {
    /// Wrap an existing connection pool.
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LoadInterface for MySqlLoader {
    async fn load(&self, request: &LoadRequest) -> Result<LoadOutcome, String> {
        sqlx::query(&request.statement())
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;

        let rows = sqlx::query(&format!(
            "SHOW WARNINGS LIMIT {}",
            request.max_num_warnings
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        let count_row = sqlx::query("SHOW COUNT(*) WARNINGS")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        let num_warnings: u64 = count_row
            .try_get::<i64, _>(0)
            .map(|v| v as u64)
            .or_else(|_| count_row.try_get::<u64, _>(0))
            .unwrap_or(rows.len() as u64);

        let warnings = rows
            .iter()
            .map(|row| {
                let message: String = row.try_get("Message").unwrap_or_default();
                message
            })
            .collect();
        Ok(LoadOutcome {
            num_warnings,
            warnings,
        })
    }
}

/// An in-memory [`LoadInterface`] recording load orders and serving
/// scripted outcomes.
#[derive(Debug, Default)]
pub struct MockLoader {
    /// Every load order received, in order.
    pub requests: Mutex<Vec<LoadRequest>>,
    /// Scripted outcomes, front first; an empty script answers success.
    pub outcomes: Mutex<std::collections::VecDeque<Result<LoadOutcome, String>>>,
}

impl MockLoader {
    /// Create a mock that always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next load.
    pub fn push_outcome(&self, outcome: Result<LoadOutcome, String>) {
        self.outcomes.lock().push_back(outcome);
    }
}

#[async_trait]
impl LoadInterface for MockLoader {
    async fn load(&self, request: &LoadRequest) -> Result<LoadOutcome, String> {
        self.requests.lock().push(request.clone());
        self.outcomes
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(LoadOutcome::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_renders_partition_charset_and_dialect() {
        let request = LoadRequest {
            database: "sky".into(),
            table: "Object".into(),
            chunk: 123,
            is_overlap: false,
            transaction_id: TransactionId::new(42),
            path: "/tmp/contrib.tsv".into(),
            charset: "utf8mb4".into(),
            dialect: CsvDialect::default(),
            local: true,
            max_num_warnings: 64,
        };
        assert_eq!(
            request.statement(),
            "LOAD DATA LOCAL INFILE '/tmp/contrib.tsv' INTO TABLE `sky`.`Object_123` \
             PARTITION (p42) CHARACTER SET 'utf8mb4' \
             FIELDS TERMINATED BY '\\t' ESCAPED BY '\\\\' LINES TERMINATED BY '\\n'"
        );
    }

    #[test]
    fn overlap_targets_the_overlap_table() {
        let request = LoadRequest {
            database: "sky".into(),
            table: "Object".into(),
            chunk: 7,
            is_overlap: true,
            transaction_id: TransactionId::new(1),
            path: "/tmp/x".into(),
            charset: "latin1".into(),
            dialect: CsvDialect::default(),
            local: false,
            max_num_warnings: 0,
        };
        assert_eq!(request.target_table(), "ObjectFullOverlap_7");
        assert!(request.statement().starts_with("LOAD DATA INFILE"));
    }
}
