//! The FindAll job: the precursor of every other placement job.

use crate::common::{new_job_id, release_chunks, wait_for, Job, JobContext, JobOptions, JobOutcome};
use crate::ChunkError;
use controller::RequestOptions;
use data_types::{Chunk, Replica};
use futures::future::join_all;
use observability_deps::tracing::{info, warn};
use parking_lot::Mutex;
use protocol::ResponseBody;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result data of a FindAll pass.
#[derive(Debug, Clone, Default)]
pub struct FindAllResult {
    /// Every replica reported by the scanned workers.
    pub replicas: Vec<Replica>,
    /// Per-worker scan failures.
    pub errors: Vec<ChunkError>,
}

/// Scans every active worker for every READY database of a family and
/// aggregates the replies into the shared replica view.
#[derive(Debug)]
pub struct FindAllJob {
    id: String,
    family: String,
    save_replica_info: bool,
    options: JobOptions,
    result: Mutex<FindAllResult>,
}

impl FindAllJob {
    /// Create the job.
    pub fn new(family: impl Into<String>, save_replica_info: bool, options: JobOptions) -> Arc<Self> {
        Arc::new(Self {
            id: new_job_id("find-all"),
            family: family.into(),
            save_replica_info,
            options,
            result: Mutex::new(FindAllResult::default()),
        })
    }

    /// The scanned family.
    pub fn family(&self) -> &str {
        &self.family
    }

    /// A snapshot of the result data.
    pub fn result(&self) -> FindAllResult {
        self.result.lock().clone()
    }
}

#[async_trait::async_trait]
impl Job for FindAllJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "FIND_ALL"
    }

    fn options(&self) -> JobOptions {
        self.options
    }

    async fn execute(self: Arc<Self>, ctx: JobContext, cancel: CancellationToken) -> JobOutcome {
        let scan = match scan_family(&ctx, &self.family, &self.id, &cancel).await {
            Some(scan) => scan,
            None => {
                release_chunks(&ctx, &self.id);
                return JobOutcome::Cancelled;
            }
        };
        if self.save_replica_info {
            ctx.replicas
                .replace_family(&self.family, scan.replicas.clone());
        }
        info!(job_id=%self.id, family=%self.family, replicas=scan.replicas.len(),
              errors=scan.errors.len(), "replica scan finished");

        let outcome = if scan.errors.is_empty() {
            JobOutcome::Success
        } else {
            JobOutcome::Failed
        };
        *self.result.lock() = scan;
        release_chunks(&ctx, &self.id);
        outcome
    }
}

/// Scan one family: ask every active worker to enumerate its replicas of
/// every READY database. Returns `None` when cancelled mid-way.
///
/// This is the shared first phase of most placement jobs; they call it
/// directly instead of submitting a nested FindAll job.
pub(crate) async fn scan_family(
    ctx: &JobContext,
    family: &str,
    job_id: &str,
    cancel: &CancellationToken,
) -> Option<FindAllResult> {
    let config = &ctx.controller.context().config;
    let workers = match config.active_workers() {
        Ok(workers) => workers,
        Err(e) => {
            warn!(job_id, error=%e, "cannot enumerate workers");
            return Some(FindAllResult {
                replicas: vec![],
                errors: vec![ChunkError {
                    chunk: Chunk::new(family, 0),
                    worker: String::new(),
                    database: String::new(),
                    message: e.to_string(),
                }],
            });
        }
    };
    let databases = match config.databases_of_family(family, true) {
        Ok(databases) => databases,
        Err(e) => {
            return Some(FindAllResult {
                replicas: vec![],
                errors: vec![ChunkError {
                    chunk: Chunk::new(family, 0),
                    worker: String::new(),
                    database: String::new(),
                    message: e.to_string(),
                }],
            });
        }
    };

    let mut scans = vec![];
    for worker in &workers {
        for database in &databases {
            let controller = Arc::clone(&ctx.controller);
            let worker_name = worker.name.clone();
            let database_name = database.name.clone();
            let job_id = job_id.to_string();
            scans.push(async move {
                let result = wait_for(|callback| {
                    controller.find_all_replicas(
                        &worker_name,
                        &database_name,
                        RequestOptions {
                            job_id: Some(job_id),
                            ..Default::default()
                        },
                        callback,
                    )
                })
                .await;
                (worker_name, database_name, result)
            });
        }
    }

    let replies = tokio::select! {
        replies = join_all(scans) => replies,
        _ = cancel.cancelled() => return None,
    };

    let mut scan = FindAllResult::default();
    for (worker_name, database_name, reply) in replies {
        match reply {
            Ok(result) if result.is_success() => {
                if let Some(ResponseBody::FindAll(found)) = result.body {
                    scan.replicas.extend(
                        found
                            .replicas
                            .into_iter()
                            .map(|msg| msg.into_replica(family)),
                    );
                }
            }
            Ok(result) => scan.errors.push(ChunkError {
                chunk: Chunk::new(family, 0),
                worker: worker_name,
                database: database_name,
                message: format!("{:?}: {}", result.status, result.message),
            }),
            Err(message) => scan.errors.push(ChunkError {
                chunk: Chunk::new(family, 0),
                worker: worker_name,
                database: database_name,
                message,
            }),
        }
    }
    Some(scan)
}
