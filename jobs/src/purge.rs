//! The Purge job: delete surplus replicas beyond the requested level.

use crate::common::{new_job_id, release_chunks, wait_for, Job, JobContext, JobOptions, JobOutcome};
use crate::find_all::scan_family;
use crate::ChunkError;
use controller::RequestOptions;
use data_types::Chunk;
use observability_deps::tracing::info;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result data of a Purge job.
#[derive(Debug, Clone, Default)]
pub struct PurgeResult {
    /// `(chunk, worker)` replicas removed by this job.
    pub removed: Vec<(Chunk, String)>,
    /// Per-chunk failures.
    pub errors: Vec<ChunkError>,
}

/// Deletes surplus replicas, most loaded workers first, never dropping a
/// chunk below the requested level.
#[derive(Debug)]
pub struct PurgeJob {
    id: String,
    family: String,
    num_replicas: u32,
    options: JobOptions,
    result: Mutex<PurgeResult>,
}

impl PurgeJob {
    /// Create the job.
    pub fn new(family: impl Into<String>, num_replicas: u32, options: JobOptions) -> Arc<Self> {
        Arc::new(Self {
            id: new_job_id("purge"),
            family: family.into(),
            num_replicas,
            options,
            result: Mutex::new(PurgeResult::default()),
        })
    }

    /// A snapshot of the result data.
    pub fn result(&self) -> PurgeResult {
        self.result.lock().clone()
    }
}

#[async_trait::async_trait]
impl Job for PurgeJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "PURGE"
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
        let worker_names: Vec<String> = match config.active_workers() {
            Ok(workers) => workers.into_iter().map(|w| w.name).collect(),
            Err(_) => {
                release_chunks(&ctx, &self.id);
                return JobOutcome::Failed;
            }
        };
        let databases: Vec<String> = match config.databases_of_family(&self.family, true) {
            Ok(databases) => databases.into_iter().map(|db| db.name).collect(),
            Err(_) => {
                release_chunks(&ctx, &self.id);
                return JobOutcome::Failed;
            }
        };

        // Victims are picked from the most loaded workers first; counts
        // shrink as deletions are planned.
        let mut counts = ctx.replicas.chunk_counts(&self.family, &worker_names);
        let mut removed = vec![];
        let locker = &ctx.controller.context().chunk_locker;

        for chunk in ctx.replicas.chunks(&self.family) {
            if cancel.is_cancelled() {
                break;
            }
            let holders = ctx.replicas.workers_with(&chunk);
            let surplus = holders.len().saturating_sub(self.num_replicas as usize);
            if surplus == 0 {
                continue;
            }
            match locker.lock(&chunk, &self.id) {
                Ok(true) => {}
                _ => {
                    errors.push(ChunkError {
                        chunk: chunk.clone(),
                        worker: String::new(),
                        database: String::new(),
                        message: "chunk is locked by another job".to_string(),
                    });
                    continue;
                }
            }

            let mut victims: Vec<String> = holders.into_iter().collect();
            victims.sort_by_key(|w| {
                (
                    std::cmp::Reverse(counts.get(w).copied().unwrap_or(0)),
                    w.clone(),
                )
            });
            for victim in victims.into_iter().take(surplus) {
                let mut chunk_ok = true;
                for database in &databases {
                    let reply = wait_for(|callback| {
                        ctx.controller.delete_replica(
                            &victim,
                            database,
                            chunk.number,
                            RequestOptions {
                                job_id: Some(self.id.clone()),
                                ..Default::default()
                            },
                            callback,
                        )
                    })
                    .await;
                    match reply {
                        Ok(result) if result.is_success() => {
                            ctx.replicas.remove(&chunk, &victim, database);
                        }
                        Ok(result) => {
                            chunk_ok = false;
                            errors.push(ChunkError {
                                chunk: chunk.clone(),
                                worker: victim.clone(),
                                database: database.clone(),
                                message: format!("{:?}: {}", result.status, result.message),
                            });
                        }
                        Err(message) => {
                            chunk_ok = false;
                            errors.push(ChunkError {
                                chunk: chunk.clone(),
                                worker: victim.clone(),
                                database: database.clone(),
                                message,
                            });
                        }
                    }
                }
                if chunk_ok {
                    *counts.entry(victim.clone()).or_default() =
                        counts.get(&victim).copied().unwrap_or(1).saturating_sub(1);
                    removed.push((chunk.clone(), victim));
                }
            }
            locker.release(&chunk);
        }
        info!(job_id=%self.id, family=%self.family, removed=removed.len(),
              errors=errors.len(), "purge finished");

        let outcome = if cancel.is_cancelled() {
            JobOutcome::Cancelled
        } else if errors.is_empty() {
            JobOutcome::Success
        } else {
            JobOutcome::Failed
        };
        *self.result.lock() = PurgeResult { removed, errors };
        release_chunks(&ctx, &self.id);
        outcome
    }
}
