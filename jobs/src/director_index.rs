//! The DirectorIndex job: harvest `(object id, chunk, sub-chunk)` triples
//! from every chunk of a director table and load them into the master
//! database's director index.

use crate::common::{new_job_id, release_chunks, wait_for, Job, JobContext, JobOptions, JobOutcome};
use crate::ChunkError;
use async_trait::async_trait;
use controller::RequestOptions;
use data_types::TransactionId;
use observability_deps::tracing::info;
use parking_lot::Mutex;
use protocol::{IndexRow, ResponseBody};
use sqlx::mysql::MySqlPool;
use std::fmt::Debug;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Receives harvested index rows. The production implementation writes the
/// master database; tests collect in memory.
#[async_trait]
pub trait IndexTarget: Debug + Send + Sync {
    /// Store one chunk's worth of rows; an `Err` carries the error text.
    async fn store_rows(
        &self,
        database: &str,
        director_table: &str,
        rows: &[IndexRow],
    ) -> Result<(), String>;
}

/// The sqlx-backed [`IndexTarget`] writing `<database>__<table>` in the
/// master metadata database.
#[derive(Debug)]
pub struct MySqlIndexTarget {
    pool: MySqlPool,
    metadata_database: String,
}

impl MySqlIndexTarget {
    /// Wrap an existing connection pool.
    pub fn new(pool: MySqlPool, metadata_database: impl Into<String>) -> Self {
        Self {
            pool,
            metadata_database: metadata_database.into(),
        }
    }
}

#[async_trait]
impl IndexTarget for MySqlIndexTarget {
    async fn store_rows(
        &self,
        database: &str,
        director_table: &str,
        rows: &[IndexRow],
    ) -> Result<(), String> {
        if rows.is_empty() {
            return Ok(());
        }
        let values = rows
            .iter()
            .map(|row| format!("({},{},{})", row.object_id, row.chunk_id, row.sub_chunk_id))
            .collect::<Vec<_>>()
            .join(",");
        let statement = format!(
            "REPLACE INTO `{}`.`{}__{}` (objectId, chunkId, subChunkId) VALUES {}",
            self.metadata_database.replace('`', "``"),
            database.replace('`', "``"),
            director_table.replace('`', "``"),
            values,
        );
        sqlx::query(&statement)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// An in-memory [`IndexTarget`] collecting rows for tests.
#[derive(Debug, Default)]
pub struct MemIndexTarget {
    /// All rows stored, in arrival order.
    pub rows: Mutex<Vec<IndexRow>>,
}

#[async_trait]
impl IndexTarget for MemIndexTarget {
    async fn store_rows(
        &self,
        _database: &str,
        _director_table: &str,
        rows: &[IndexRow],
    ) -> Result<(), String> {
        self.rows.lock().extend(rows.iter().cloned());
        Ok(())
    }
}

/// Result data of a DirectorIndex job.
#[derive(Debug, Clone, Default)]
pub struct DirectorIndexResult {
    /// Rows harvested and stored.
    pub num_rows: usize,
    /// The per-chunk error table: `(worker, chunk, error)`.
    pub errors: Vec<ChunkError>,
}

/// Harvests the director index of one database, one chunk at a time,
/// optionally scoped to a super-transaction. Per-chunk errors are
/// collected rather than fatal.
#[derive(Debug)]
pub struct DirectorIndexJob {
    id: String,
    database: String,
    director_table: String,
    transaction_id: Option<TransactionId>,
    target: Arc<dyn IndexTarget>,
    options: JobOptions,
    result: Mutex<DirectorIndexResult>,
}

impl DirectorIndexJob {
    /// Create the job.
    pub fn new(
        database: impl Into<String>,
        director_table: impl Into<String>,
        transaction_id: Option<TransactionId>,
        target: Arc<dyn IndexTarget>,
        options: JobOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: new_job_id("director-index"),
            database: database.into(),
            director_table: director_table.into(),
            transaction_id,
            target,
            options,
            result: Mutex::new(DirectorIndexResult::default()),
        })
    }

    /// A snapshot of the result data.
    pub fn result(&self) -> DirectorIndexResult {
        self.result.lock().clone()
    }
}

#[async_trait]
impl Job for DirectorIndexJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "DIRECTOR_INDEX"
    }

    fn options(&self) -> JobOptions {
        self.options
    }

    async fn execute(self: Arc<Self>, ctx: JobContext, cancel: CancellationToken) -> JobOutcome {
        let config = &ctx.controller.context().config;
        let database = match config.database(&self.database) {
            Ok(database) => database,
            Err(_) => {
                release_chunks(&ctx, &self.id);
                return JobOutcome::Failed;
            }
        };

        let mut result = DirectorIndexResult::default();
        for chunk in ctx.replicas.chunks(&database.family) {
            if cancel.is_cancelled() {
                break;
            }
            // Any worker holding this database's chunk can serve the
            // extract.
            let Some(worker) = ctx
                .replicas
                .workers_with_database(&chunk, &self.database)
                .into_iter()
                .next()
            else {
                continue;
            };

            let reply = wait_for(|callback| {
                ctx.controller.index(
                    &worker,
                    &self.database,
                    &self.director_table,
                    chunk.number,
                    self.transaction_id,
                    RequestOptions {
                        job_id: Some(self.id.clone()),
                        ..Default::default()
                    },
                    callback,
                )
            })
            .await;
            let rows = match reply {
                Ok(request_result) if request_result.is_success() => {
                    match request_result.body {
                        Some(ResponseBody::Index(index)) => index.rows,
                        _ => vec![],
                    }
                }
                Ok(request_result) => {
                    result.errors.push(ChunkError {
                        chunk: chunk.clone(),
                        worker,
                        database: self.database.clone(),
                        message: format!(
                            "{:?}: {}",
                            request_result.status, request_result.message
                        ),
                    });
                    continue;
                }
                Err(message) => {
                    result.errors.push(ChunkError {
                        chunk: chunk.clone(),
                        worker,
                        database: self.database.clone(),
                        message,
                    });
                    continue;
                }
            };

            match self
                .target
                .store_rows(&self.database, &self.director_table, &rows)
                .await
            {
                Ok(()) => result.num_rows += rows.len(),
                Err(message) => result.errors.push(ChunkError {
                    chunk: chunk.clone(),
                    worker,
                    database: self.database.clone(),
                    message,
                }),
            }
        }
        info!(job_id=%self.id, database=%self.database, table=%self.director_table,
              rows=result.num_rows, errors=result.errors.len(), "director index harvested");

        let outcome = if cancel.is_cancelled() {
            JobOutcome::Cancelled
        } else if result.errors.is_empty() {
            JobOutcome::Success
        } else {
            JobOutcome::Failed
        };
        *self.result.lock() = result;
        release_chunks(&ctx, &self.id);
        outcome
    }
}
