//! The FixUp job: restore collocation within a family.
//!
//! Collocation means a worker holding a chunk holds it for every database
//! of the family. The job finds workers with partial holdings and fills in
//! the missing databases from workers that have them.

use crate::common::{new_job_id, release_chunks, Job, JobContext, JobOptions, JobOutcome};
use crate::find_all::scan_family;
use crate::replicate::execute_placements;
use crate::ChunkError;
use data_types::{Chunk, Replica};
use observability_deps::tracing::info;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result data of a FixUp job.
#[derive(Debug, Clone, Default)]
pub struct FixUpResult {
    /// Replicas created to restore collocation.
    pub created: Vec<Replica>,
    /// Per-chunk failures.
    pub errors: Vec<ChunkError>,
}

/// Restores collocation of the chunks of one family.
#[derive(Debug)]
pub struct FixUpJob {
    id: String,
    family: String,
    options: JobOptions,
    result: Mutex<FixUpResult>,
}

impl FixUpJob {
    /// Create the job.
    pub fn new(family: impl Into<String>, options: JobOptions) -> Arc<Self> {
        Arc::new(Self {
            id: new_job_id("fix-up"),
            family: family.into(),
            options,
            result: Mutex::new(FixUpResult::default()),
        })
    }

    /// A snapshot of the result data.
    pub fn result(&self) -> FixUpResult {
        self.result.lock().clone()
    }
}

#[async_trait::async_trait]
impl Job for FixUpJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "FIXUP"
    }

    fn options(&self) -> JobOptions {
        self.options
    }

    async fn execute(self: Arc<Self>, ctx: JobContext, cancel: CancellationToken) -> JobOutcome {
        let Some(scan) = scan_family(&ctx, &self.family, &self.id, &cancel).await else {
            release_chunks(&ctx, &self.id);
            return JobOutcome::Cancelled;
        };
        ctx.replicas
            .replace_family(&self.family, scan.replicas.clone());
        let mut errors = scan.errors;

        let config = &ctx.controller.context().config;
        let databases: Vec<String> = match config.databases_of_family(&self.family, true) {
            Ok(databases) => databases.into_iter().map(|db| db.name).collect(),
            Err(_) => {
                release_chunks(&ctx, &self.id);
                return JobOutcome::Failed;
            }
        };

        // A worker holding any database of a chunk must hold all of them.
        // Database-level placements are executed one source→destination
        // copy of one database at a time.
        let mut placements: Vec<(Chunk, String, String, String)> = vec![];
        let mut fatal = false;
        for chunk in ctx.replicas.chunks(&self.family) {
            let holders = ctx.replicas.workers_with(&chunk);
            for database in &databases {
                let with_database = ctx.replicas.workers_with_database(&chunk, database);
                if with_database.is_empty() && !holders.is_empty() {
                    // No worker holds this database's chunk at all, so
                    // collocation cannot be restored from within the
                    // cluster.
                    errors.push(ChunkError {
                        chunk: chunk.clone(),
                        worker: String::new(),
                        database: database.clone(),
                        message: "no source replica left anywhere".to_string(),
                    });
                    fatal = true;
                    continue;
                }
                for worker in holders.iter().filter(|w| !with_database.contains(*w)) {
                    let source = with_database
                        .iter()
                        .next()
                        .expect("non-empty source set")
                        .clone();
                    placements.push((chunk.clone(), source, worker.clone(), database.clone()));
                }
            }
        }
        if fatal {
            *self.result.lock() = FixUpResult {
                created: vec![],
                errors,
            };
            release_chunks(&ctx, &self.id);
            return JobOutcome::Failed;
        }
        info!(job_id=%self.id, family=%self.family, placements=placements.len(),
              "collocation plan computed");

        // Group per (chunk, source, destination) and run each database
        // through the shared placement executor.
        let mut created = vec![];
        for (chunk, source, destination, database) in placements {
            if cancel.is_cancelled() {
                break;
            }
            let (mut new_replicas, mut new_errors) = execute_placements(
                &ctx,
                &self.id,
                vec![(chunk, source, destination)],
                &[database],
                &cancel,
            )
            .await;
            created.append(&mut new_replicas);
            errors.append(&mut new_errors);
        }
        for replica in &created {
            ctx.replicas.add(replica.clone());
        }

        let outcome = if cancel.is_cancelled() {
            JobOutcome::Cancelled
        } else if errors.is_empty() {
            JobOutcome::Success
        } else {
            JobOutcome::Failed
        };
        *self.result.lock() = FixUpResult { created, errors };
        release_chunks(&ctx, &self.id);
        outcome
    }
}
