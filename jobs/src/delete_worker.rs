//! The DeleteWorker job: evacuate a worker and retire it.

use crate::common::{new_job_id, release_chunks, Job, JobContext, JobOptions, JobOutcome};
use crate::find_all::scan_family;
use crate::replicate::execute_placements;
use crate::ChunkError;
use data_types::{Chunk, Replica, WorkerState};
use observability_deps::tracing::{info, warn};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result data of a DeleteWorker job.
#[derive(Debug, Clone, Default)]
pub struct DeleteWorkerResult {
    /// Replicas created elsewhere to keep chunks at their minimum level.
    pub created: Vec<Replica>,
    /// Chunks that exist nowhere but on the retired worker and could not
    /// be copied off it. A non-empty list fails the job and leaves the
    /// worker registered.
    pub orphans: Vec<Chunk>,
    /// Per-chunk failures.
    pub errors: Vec<ChunkError>,
}

/// Re-replicates every chunk whose level would drop below the family's
/// configured minimum without `worker`, then removes (permanent) or
/// disables the worker.
#[derive(Debug)]
pub struct DeleteWorkerJob {
    id: String,
    worker: String,
    permanent: bool,
    options: JobOptions,
    result: Mutex<DeleteWorkerResult>,
}

impl DeleteWorkerJob {
    /// Create the job.
    pub fn new(worker: impl Into<String>, permanent: bool, options: JobOptions) -> Arc<Self> {
        Arc::new(Self {
            id: new_job_id("delete-worker"),
            worker: worker.into(),
            permanent,
            options,
            result: Mutex::new(DeleteWorkerResult::default()),
        })
    }

    /// A snapshot of the result data.
    pub fn result(&self) -> DeleteWorkerResult {
        self.result.lock().clone()
    }
}

#[async_trait::async_trait]
impl Job for DeleteWorkerJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "DELETE_WORKER"
    }

    fn options(&self) -> JobOptions {
        self.options
    }

    async fn execute(self: Arc<Self>, ctx: JobContext, cancel: CancellationToken) -> JobOutcome {
        let config = &ctx.controller.context().config;
        if config.worker(&self.worker).is_err() {
            warn!(job_id=%self.id, worker=%self.worker, "unknown worker");
            release_chunks(&ctx, &self.id);
            return JobOutcome::Failed;
        }
        let families = match config.families() {
            Ok(families) => families,
            Err(_) => {
                release_chunks(&ctx, &self.id);
                return JobOutcome::Failed;
            }
        };

        let mut result = DeleteWorkerResult::default();
        for family in &families {
            if cancel.is_cancelled() {
                break;
            }
            let Some(scan) = scan_family(&ctx, &family.name, &self.id, &cancel).await else {
                break;
            };
            ctx.replicas.replace_family(&family.name, scan.replicas);
            result.errors.extend(scan.errors);

            let databases: Vec<String> = match config.databases_of_family(&family.name, true) {
                Ok(databases) => databases.into_iter().map(|db| db.name).collect(),
                Err(_) => continue,
            };
            let survivors: Vec<String> = match config.active_workers() {
                Ok(workers) => workers
                    .into_iter()
                    .map(|w| w.name)
                    .filter(|name| *name != self.worker)
                    .collect(),
                Err(_) => continue,
            };
            let mut counts = ctx.replicas.chunk_counts(&family.name, &survivors);

            for chunk in ctx.replicas.chunks(&family.name) {
                let holders = ctx.replicas.workers_with(&chunk);
                if !holders.contains(&self.worker) {
                    continue;
                }
                let surviving_holders: BTreeSet<&String> =
                    holders.iter().filter(|w| **w != self.worker).collect();
                if surviving_holders.len() >= family.replication_level as usize {
                    continue;
                }

                // Prefer copying from a surviving holder; fall back to the
                // worker being retired while it is still reachable.
                let source = surviving_holders
                    .iter()
                    .next()
                    .map(|w| (*w).clone())
                    .unwrap_or_else(|| self.worker.clone());
                let Some(destination) = survivors
                    .iter()
                    .filter(|w| !holders.contains(*w))
                    .min_by_key(|w| (counts.get(*w).copied().unwrap_or(0), (*w).clone()))
                    .cloned()
                else {
                    result.orphans.push(chunk.clone());
                    continue;
                };

                let (created, errors) = execute_placements(
                    &ctx,
                    &self.id,
                    vec![(chunk.clone(), source, destination.clone())],
                    &databases,
                    &cancel,
                )
                .await;
                if created.is_empty() && surviving_holders.is_empty() {
                    result.orphans.push(chunk.clone());
                }
                if !created.is_empty() {
                    *counts.entry(destination).or_default() += 1;
                }
                for replica in &created {
                    ctx.replicas.add(replica.clone());
                }
                result.created.extend(created);
                result.errors.extend(errors);
            }
        }

        let evacuated = result.orphans.is_empty() && !cancel.is_cancelled();
        if evacuated {
            let retired = if self.permanent {
                config.remove_worker(&self.worker)
            } else {
                config.set_worker_state(&self.worker, WorkerState::Inactive)
            };
            if let Err(e) = retired {
                result.errors.push(ChunkError {
                    chunk: Chunk::new(String::new(), 0),
                    worker: self.worker.clone(),
                    database: String::new(),
                    message: e.to_string(),
                });
            } else {
                ctx.replicas.remove_worker(&self.worker);
            }
        }
        info!(job_id=%self.id, worker=%self.worker, permanent=self.permanent,
              created=result.created.len(), orphans=result.orphans.len(),
              "worker evacuation finished");

        let outcome = if cancel.is_cancelled() {
            JobOutcome::Cancelled
        } else if evacuated && result.errors.is_empty() {
            JobOutcome::Success
        } else {
            JobOutcome::Failed
        };
        *self.result.lock() = result;
        release_chunks(&ctx, &self.id);
        outcome
    }
}
