//! The Replicate job: drive every chunk of a family up to the requested
//! replication level.

use crate::common::{new_job_id, release_chunks, wait_for, Job, JobContext, JobOptions, JobOutcome};
use crate::find_all::scan_family;
use crate::ChunkError;
use controller::RequestOptions;
use data_types::{Chunk, Replica, ReplicaStatus};
use futures::future::join_all;
use observability_deps::tracing::{info, warn};
use parking_lot::Mutex;
use protocol::ResponseBody;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result data of a Replicate job.
#[derive(Debug, Clone, Default)]
pub struct ReplicateResult {
    /// Replicas created by this job.
    pub created: Vec<Replica>,
    /// Per-chunk failures; the job continues past them.
    pub errors: Vec<ChunkError>,
}

/// Creates replicas of under-replicated chunks, preferring the least
/// loaded destination workers.
#[derive(Debug)]
pub struct ReplicateJob {
    id: String,
    family: String,
    num_replicas: u32,
    options: JobOptions,
    result: Mutex<ReplicateResult>,
}

impl ReplicateJob {
    /// Create the job.
    pub fn new(family: impl Into<String>, num_replicas: u32, options: JobOptions) -> Arc<Self> {
        Arc::new(Self {
            id: new_job_id("replicate"),
            family: family.into(),
            num_replicas,
            options,
            result: Mutex::new(ReplicateResult::default()),
        })
    }

    /// A snapshot of the result data.
    pub fn result(&self) -> ReplicateResult {
        self.result.lock().clone()
    }
}

#[async_trait::async_trait]
impl Job for ReplicateJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "REPLICATE"
    }

    fn options(&self) -> JobOptions {
        self.options
    }

    async fn execute(self: Arc<Self>, ctx: JobContext, cancel: CancellationToken) -> JobOutcome {
        // Refresh the replica view first; stale placement decisions are
        // worse than the extra round trips.
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
            Err(e) => {
                warn!(job_id=%self.id, error=%e, "cannot enumerate workers");
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

        // Plan: one new placement per missing replica, least-loaded active
        // workers first. Counts are updated as placements are planned so a
        // burst of under-replicated chunks spreads out.
        let mut counts = ctx.replicas.chunk_counts(&self.family, &worker_names);
        let mut placements: Vec<(Chunk, String, String)> = vec![];
        for chunk in ctx.replicas.chunks(&self.family) {
            let holders = ctx.replicas.workers_with(&chunk);
            let missing = (self.num_replicas as usize).saturating_sub(holders.len());
            if missing == 0 {
                continue;
            }
            let Some(source) = holders.iter().next().cloned() else {
                continue;
            };
            let mut candidates: Vec<&String> = worker_names
                .iter()
                .filter(|w| !holders.contains(*w))
                .collect();
            candidates.sort_by_key(|w| (counts.get(*w).copied().unwrap_or(0), (*w).clone()));
            for destination in candidates.into_iter().take(missing) {
                *counts.entry(destination.clone()).or_default() += 1;
                placements.push((chunk.clone(), source.clone(), destination.clone()));
            }
        }
        info!(job_id=%self.id, family=%self.family, placements=placements.len(),
              "replication plan computed");

        let (created, mut placement_errors) = execute_placements(
            &ctx,
            &self.id,
            placements,
            &databases,
            &cancel,
        )
        .await;
        errors.append(&mut placement_errors);

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
        *self.result.lock() = ReplicateResult { created, errors };
        release_chunks(&ctx, &self.id);
        outcome
    }
}

/// Execute a set of `(chunk, source, destination)` placements: claim each
/// chunk, replicate every database of the family, release the claim.
///
/// Shared with the FixUp, Rebalance and DeleteWorker jobs, which compute
/// their own placements.
pub(crate) async fn execute_placements(
    ctx: &JobContext,
    job_id: &str,
    placements: Vec<(Chunk, String, String)>,
    databases: &[String],
    cancel: &CancellationToken,
) -> (Vec<Replica>, Vec<ChunkError>) {
    // Placements of the same chunk share one claim; group them.
    let mut by_chunk: BTreeMap<Chunk, Vec<(String, String)>> = BTreeMap::new();
    for (chunk, source, destination) in placements {
        by_chunk.entry(chunk).or_default().push((source, destination));
    }

    let tasks: Vec<_> = by_chunk
        .into_iter()
        .map(|(chunk, moves)| {
            let ctx = ctx.clone();
            let job_id = job_id.to_string();
            let databases = databases.to_vec();
            let cancel = cancel.clone();
            async move {
                let mut created = vec![];
                let mut errors = vec![];
                let locker = &ctx.controller.context().chunk_locker;
                match locker.lock(&chunk, &job_id) {
                    Ok(true) => {}
                    Ok(false) => {
                        errors.push(ChunkError {
                            chunk: chunk.clone(),
                            worker: String::new(),
                            database: String::new(),
                            message: format!(
                                "chunk is locked by '{}'",
                                locker.owner_of(&chunk).unwrap_or_default()
                            ),
                        });
                        return (created, errors);
                    }
                    Err(e) => {
                        errors.push(ChunkError {
                            chunk: chunk.clone(),
                            worker: String::new(),
                            database: String::new(),
                            message: e.to_string(),
                        });
                        return (created, errors);
                    }
                }

                for (source, destination) in moves {
                    for database in &databases {
                        if cancel.is_cancelled() {
                            locker.release(&chunk);
                            return (created, errors);
                        }
                        let reply = wait_for(|callback| {
                            ctx.controller.replicate(
                                &destination,
                                &source,
                                database,
                                chunk.number,
                                RequestOptions {
                                    job_id: Some(job_id.clone()),
                                    ..Default::default()
                                },
                                callback,
                            )
                        })
                        .await;
                        match reply {
                            Ok(result) if result.is_success() => {
                                let replica = match result.body {
                                    Some(ResponseBody::Replica(r)) => r
                                        .replica
                                        .map(|msg| msg.into_replica(&chunk.family)),
                                    _ => None,
                                };
                                created.push(replica.unwrap_or_else(|| Replica {
                                    chunk: chunk.clone(),
                                    database: database.clone(),
                                    worker: destination.clone(),
                                    status: ReplicaStatus::Complete,
                                    verify_time: 0,
                                    files: vec![],
                                }));
                            }
                            Ok(result) => errors.push(ChunkError {
                                chunk: chunk.clone(),
                                worker: destination.clone(),
                                database: database.clone(),
                                message: format!("{:?}: {}", result.status, result.message),
                            }),
                            Err(message) => errors.push(ChunkError {
                                chunk: chunk.clone(),
                                worker: destination.clone(),
                                database: database.clone(),
                                message,
                            }),
                        }
                    }
                }
                locker.release(&chunk);
                (created, errors)
            }
        })
        .collect();

    let mut created = vec![];
    let mut errors = vec![];
    for (mut c, mut e) in join_all(tasks).await {
        created.append(&mut c);
        errors.append(&mut e);
    }
    (created, errors)
}
