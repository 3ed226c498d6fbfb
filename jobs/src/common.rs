//! Types and helpers shared by all jobs.

use crate::ReplicaView;
use controller::{Controller, RequestResult};
use data_types::Chunk;
use observability_deps::tracing::debug;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Scheduling attributes of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    /// Dispatch priority; larger runs earlier.
    pub priority: i32,
    /// An exclusive job runs alone.
    pub exclusive: bool,
    /// Whether the job tolerates being preempted. Carried and consulted by
    /// the dispatch policy, but no implicit preemption path exists.
    pub preemptable: bool,
}

impl JobOptions {
    /// Defaults of the FindAll job.
    pub fn find_all() -> Self {
        Self { priority: 0, exclusive: false, preemptable: true }
    }

    /// Defaults of the FixUp job.
    pub fn fix_up() -> Self {
        Self { priority: 2, exclusive: true, preemptable: false }
    }

    /// Defaults of the Purge job.
    pub fn purge() -> Self {
        Self { priority: -1, exclusive: false, preemptable: true }
    }

    /// Defaults of the Replicate job.
    pub fn replicate() -> Self {
        Self { priority: 1, exclusive: true, preemptable: true }
    }

    /// Defaults of the Rebalance job.
    pub fn rebalance() -> Self {
        Self { priority: 1, exclusive: true, preemptable: true }
    }

    /// Defaults of the Verify job.
    pub fn verify() -> Self {
        Self { priority: -2, exclusive: false, preemptable: true }
    }

    /// Defaults of the DeleteWorker job.
    pub fn delete_worker() -> Self {
        Self { priority: 2, exclusive: true, preemptable: false }
    }

    /// Defaults of the DirectorIndex job.
    pub fn director_index() -> Self {
        Self { priority: 1, exclusive: false, preemptable: true }
    }
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job completed its plan.
    Success,
    /// The job completed with failures, or could not complete its plan.
    Failed,
    /// The job was cancelled before completing its plan.
    Cancelled,
}

/// State of a job as tracked by the job controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Submitted, not yet dispatched.
    New,
    /// Dispatched and running.
    InProgress,
    /// Finished with the recorded outcome.
    Finished(JobOutcome),
}

/// One per-chunk failure recorded by a job. Jobs collect these and carry
/// on; only broken preconditions fail a job outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkError {
    /// The chunk the step was about.
    pub chunk: Chunk,
    /// The worker the step targeted.
    pub worker: String,
    /// The database involved, empty when not applicable.
    pub database: String,
    /// What went wrong.
    pub message: String,
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {} ({}): {}",
            self.chunk, self.worker, self.database, self.message
        )
    }
}

/// What a job needs to run.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// The request runtime.
    pub controller: Arc<Controller>,
    /// The shared replica view maintained by FindAll passes.
    pub replicas: Arc<ReplicaView>,
}

impl JobContext {
    /// Assemble a context with a fresh replica view.
    pub fn new(controller: Arc<Controller>) -> Self {
        Self {
            controller,
            replicas: Arc::new(ReplicaView::default()),
        }
    }
}

/// A placement job.
#[async_trait::async_trait]
pub trait Job: std::fmt::Debug + Send + Sync + 'static {
    /// The unique job id; doubles as the chunk lock owner string.
    fn id(&self) -> &str;

    /// The job type name.
    fn kind(&self) -> &'static str;

    /// Scheduling attributes.
    fn options(&self) -> JobOptions;

    /// Run the job to completion. Cancellation is best-effort: observe the
    /// token between steps and stop issuing new requests.
    async fn execute(self: Arc<Self>, ctx: JobContext, cancel: CancellationToken) -> JobOutcome;
}

/// A fresh job id.
pub(crate) fn new_job_id(kind: &str) -> String {
    format!("{}-{}", kind, uuid::Uuid::new_v4())
}

/// Issue one controller request and await its terminal outcome.
///
/// The register closure gets the one-shot completion callback to hand to a
/// controller factory method.
pub(crate) async fn wait_for<R>(
    register: impl FnOnce(Box<dyn FnOnce(RequestResult) + Send>) -> Result<R, controller::Error>,
) -> Result<RequestResult, String> {
    let (tx, rx) = oneshot::channel();
    register(Box::new(move |result| {
        let _ = tx.send(result);
    }))
    .map_err(|e| e.to_string())?;
    rx.await.map_err(|_| "request dropped".to_string())
}

/// Release every chunk the job still holds; called on every exit path.
pub(crate) fn release_chunks(ctx: &JobContext, job_id: &str) {
    let released = ctx
        .controller
        .context()
        .chunk_locker
        .release_owner(job_id)
        .unwrap_or_default();
    if !released.is_empty() {
        debug!(job_id, chunks = released.len(), "released leftover chunk locks");
    }
}
