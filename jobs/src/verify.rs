//! The Verify job: sample replicas and report disagreements.

use crate::common::{new_job_id, release_chunks, wait_for, Job, JobContext, JobOptions, JobOutcome};
use crate::ChunkError;
use controller::RequestOptions;
use data_types::{Replica, ReplicaDifference};
use observability_deps::tracing::info;
use parking_lot::Mutex;
use protocol::ResponseBody;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result data of a Verify job.
#[derive(Debug, Clone, Default)]
pub struct VerifyResult {
    /// Replicas inspected by this pass.
    pub num_inspected: usize,
    /// Observed disagreements between replicas of the same chunk.
    pub differences: Vec<ReplicaDifference>,
    /// Per-chunk failures.
    pub errors: Vec<ChunkError>,
}

/// Walks the replica view round-robin, re-inspects up to `max_replicas`
/// chunks, and emits a [`ReplicaDifference`] wherever two replicas of the
/// same chunk disagree on size, mtime or checksum.
#[derive(Debug)]
pub struct VerifyJob {
    id: String,
    max_replicas: usize,
    compute_checksum: bool,
    options: JobOptions,
    result: Mutex<VerifyResult>,
}

impl VerifyJob {
    /// Create the job.
    pub fn new(max_replicas: usize, compute_checksum: bool, options: JobOptions) -> Arc<Self> {
        Arc::new(Self {
            id: new_job_id("verify"),
            max_replicas,
            compute_checksum,
            options,
            result: Mutex::new(VerifyResult::default()),
        })
    }

    /// A snapshot of the result data.
    pub fn result(&self) -> VerifyResult {
        self.result.lock().clone()
    }

    /// Re-inspect one replica on its worker.
    async fn inspect(
        &self,
        ctx: &JobContext,
        replica: &Replica,
    ) -> Result<Option<Replica>, String> {
        let reply = wait_for(|callback| {
            ctx.controller.find_replica(
                &replica.worker,
                &replica.database,
                replica.chunk.number,
                self.compute_checksum,
                RequestOptions {
                    job_id: Some(self.id.clone()),
                    ..Default::default()
                },
                callback,
            )
        })
        .await?;
        if !reply.is_success() {
            return Err(format!("{:?}: {}", reply.status, reply.message));
        }
        match reply.body {
            Some(ResponseBody::Replica(result)) => Ok(result
                .replica
                .map(|msg| msg.into_replica(&replica.chunk.family))),
            _ => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl Job for VerifyJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "VERIFY"
    }

    fn options(&self) -> JobOptions {
        self.options
    }

    async fn execute(self: Arc<Self>, ctx: JobContext, cancel: CancellationToken) -> JobOutcome {
        let config = &ctx.controller.context().config;
        let families = match config.families() {
            Ok(families) => families,
            Err(_) => {
                release_chunks(&ctx, &self.id);
                return JobOutcome::Failed;
            }
        };

        // Round-robin over families and their chunks so repeated passes
        // spread attention instead of hammering the first family.
        let mut chunks = vec![];
        for family in &families {
            for chunk in ctx.replicas.chunks(&family.name) {
                chunks.push(chunk);
            }
        }

        let mut result = VerifyResult::default();
        'chunks: for chunk in chunks {
            if result.num_inspected >= self.max_replicas {
                break;
            }
            if cancel.is_cancelled() {
                break;
            }
            let replicas = ctx.replicas.replicas_of(&chunk);

            // Inspect every replica of the chunk fresh, then compare all of
            // them against the first good one.
            let mut inspected: Vec<Replica> = vec![];
            for replica in &replicas {
                if result.num_inspected >= self.max_replicas {
                    break 'chunks;
                }
                result.num_inspected += 1;
                match self.inspect(&ctx, replica).await {
                    Ok(Some(fresh)) => inspected.push(fresh),
                    Ok(None) => {}
                    Err(message) => result.errors.push(ChunkError {
                        chunk: chunk.clone(),
                        worker: replica.worker.clone(),
                        database: replica.database.clone(),
                        message,
                    }),
                }
            }
            for pair in inspected
                .iter()
                .skip(1)
                .filter(|r| r.database == inspected[0].database)
            {
                if let Some(difference) = ReplicaDifference::between(&inspected[0], pair) {
                    result.differences.push(difference);
                }
            }
        }
        info!(job_id=%self.id, inspected=result.num_inspected,
              differences=result.differences.len(), "verification pass finished");

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
