//! The job controller: a single cooperative scheduler loop over three
//! queues of jobs.

use crate::common::{Job, JobContext, JobOptions, JobOutcome, JobState};
use crate::{
    DeleteWorkerJob, DirectorIndexJob, FindAllJob, FixUpJob, IndexTarget, PurgeJob, RebalanceJob,
    ReplicateJob, VerifyJob,
};
use data_types::TransactionId;
use observability_deps::tracing::{debug, info};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The completion callback of a submitted job.
pub type OnFinish = Box<dyn FnOnce(JobOutcome) + Send>;

struct QueuedJob {
    job: Arc<dyn Job>,
    on_finish: Option<OnFinish>,
    /// Submission order; the tie-breaker below priority.
    seq: u64,
}

struct RunningJob {
    job: Arc<dyn Job>,
    cancel: CancellationToken,
}

/// A completed job, kept for a bounded time for inspection.
pub struct FinishedJob {
    /// The job object, still carrying its result data.
    pub job: Arc<dyn Job>,
    /// How it ended.
    pub outcome: JobOutcome,
    finished_at: Instant,
}

impl fmt::Debug for FinishedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinishedJob")
            .field("job_id", &self.job.id())
            .field("outcome", &self.outcome)
            .finish()
    }
}

#[derive(Default)]
struct Queues {
    new: Vec<QueuedJob>,
    in_progress: Vec<RunningJob>,
    finished: Vec<FinishedJob>,
    next_seq: u64,
}

struct ScheduledEntry {
    interval: Duration,
    last_run: Instant,
    factory: Box<dyn Fn() -> Arc<dyn Job> + Send>,
}

/// The top-level scheduler.
///
/// One cooperative loop wakes up every `job_scheduler_ival` (or on
/// submissions and completions), injects due scheduled jobs, and
/// dispatches whatever the policy allows:
///
/// * jobs are considered in `(priority desc, submission asc)` order;
/// * an exclusive candidate starts only on an idle controller;
/// * while an exclusive job runs, nothing else starts;
/// * a non-preemptable candidate waits while lower-priority preemptable
///   jobs run — the scheduler never preempts implicitly.
///
/// A job id lives in exactly one of the three queues at any moment.
pub struct JobController {
    ctx: JobContext,
    queues: Mutex<Queues>,
    scheduled: Mutex<Vec<ScheduledEntry>>,
    wakeup: Notify,
    shutdown: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for JobController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (new, in_progress, finished) = self.queue_lengths();
        f.debug_struct("JobController")
            .field("new", &new)
            .field("in_progress", &in_progress)
            .field("finished", &finished)
            .finish()
    }
}

impl JobController {
    /// Create a controller around the given context.
    pub fn new(ctx: JobContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            queues: Mutex::new(Queues::default()),
            scheduled: Mutex::new(vec![]),
            wakeup: Notify::new(),
            shutdown: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        })
    }

    /// The context jobs run with.
    pub fn ctx(&self) -> &JobContext {
        &self.ctx
    }

    /// Start the scheduler loop.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.loop_handle.lock();
        if handle.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            let ival = this
                .ctx
                .controller
                .context()
                .config
                .params()
                .job_scheduler_ival;
            info!("job scheduler started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(ival) => {}
                    _ = this.wakeup.notified() => {}
                    _ = this.shutdown.cancelled() => {
                        this.cancel_all();
                        info!("job scheduler stopped");
                        return;
                    }
                }
                this.run_scheduled();
                this.run_queued();
            }
        }));
    }

    /// Request shutdown (cancelling in-progress jobs) and wait for the
    /// loop to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Submit a job. The callback fires exactly once, after the job left
    /// the in-progress queue.
    pub fn submit(
        self: &Arc<Self>,
        job: Arc<dyn Job>,
        on_finish: impl FnOnce(JobOutcome) + Send + 'static,
    ) {
        {
            let mut queues = self.queues.lock();
            let seq = queues.next_seq;
            queues.next_seq += 1;
            debug!(job_id=%job.id(), kind=%job.kind(), seq, "job submitted");
            queues.new.push(QueuedJob {
                job,
                on_finish: Some(Box::new(on_finish)),
                seq,
            });
        }
        self.run_queued();
        self.wakeup.notify_one();
    }

    /// Register a job to be injected periodically.
    pub fn schedule(
        &self,
        interval: Duration,
        factory: impl Fn() -> Arc<dyn Job> + Send + 'static,
    ) {
        self.scheduled.lock().push(ScheduledEntry {
            interval,
            last_run: Instant::now(),
            factory: Box::new(factory),
        });
    }

    // ---- typed submission helpers ----

    /// Submit a FindAll job.
    pub fn find_all(
        self: &Arc<Self>,
        family: &str,
        save_replica_info: bool,
        on_finish: impl FnOnce(JobOutcome) + Send + 'static,
        options: JobOptions,
    ) -> Arc<FindAllJob> {
        let job = FindAllJob::new(family, save_replica_info, options);
        self.submit(Arc::clone(&job) as _, on_finish);
        job
    }

    /// Submit a FixUp job.
    pub fn fix_up(
        self: &Arc<Self>,
        family: &str,
        on_finish: impl FnOnce(JobOutcome) + Send + 'static,
        options: JobOptions,
    ) -> Arc<FixUpJob> {
        let job = FixUpJob::new(family, options);
        self.submit(Arc::clone(&job) as _, on_finish);
        job
    }

    /// Submit a Replicate job.
    pub fn replicate(
        self: &Arc<Self>,
        family: &str,
        num_replicas: u32,
        on_finish: impl FnOnce(JobOutcome) + Send + 'static,
        options: JobOptions,
    ) -> Arc<ReplicateJob> {
        let job = ReplicateJob::new(family, num_replicas, options);
        self.submit(Arc::clone(&job) as _, on_finish);
        job
    }

    /// Submit a Purge job.
    pub fn purge(
        self: &Arc<Self>,
        family: &str,
        num_replicas: u32,
        on_finish: impl FnOnce(JobOutcome) + Send + 'static,
        options: JobOptions,
    ) -> Arc<PurgeJob> {
        let job = PurgeJob::new(family, num_replicas, options);
        self.submit(Arc::clone(&job) as _, on_finish);
        job
    }

    /// Submit a Rebalance job.
    pub fn rebalance(
        self: &Arc<Self>,
        family: &str,
        estimate_only: bool,
        on_finish: impl FnOnce(JobOutcome) + Send + 'static,
        options: JobOptions,
    ) -> Arc<RebalanceJob> {
        let job = RebalanceJob::new(family, estimate_only, options);
        self.submit(Arc::clone(&job) as _, on_finish);
        job
    }

    /// Submit a Verify job.
    pub fn verify(
        self: &Arc<Self>,
        max_replicas: usize,
        compute_checksum: bool,
        on_finish: impl FnOnce(JobOutcome) + Send + 'static,
        options: JobOptions,
    ) -> Arc<VerifyJob> {
        let job = VerifyJob::new(max_replicas, compute_checksum, options);
        self.submit(Arc::clone(&job) as _, on_finish);
        job
    }

    /// Submit a DeleteWorker job.
    pub fn delete_worker(
        self: &Arc<Self>,
        worker: &str,
        permanent: bool,
        on_finish: impl FnOnce(JobOutcome) + Send + 'static,
        options: JobOptions,
    ) -> Arc<DeleteWorkerJob> {
        let job = DeleteWorkerJob::new(worker, permanent, options);
        self.submit(Arc::clone(&job) as _, on_finish);
        job
    }

    /// Submit a DirectorIndex job.
    #[allow(clippy::too_many_arguments)]
    pub fn director_index(
        self: &Arc<Self>,
        database: &str,
        director_table: &str,
        transaction_id: Option<TransactionId>,
        target: Arc<dyn IndexTarget>,
        on_finish: impl FnOnce(JobOutcome) + Send + 'static,
        options: JobOptions,
    ) -> Arc<DirectorIndexJob> {
        let job = DirectorIndexJob::new(database, director_table, transaction_id, target, options);
        self.submit(Arc::clone(&job) as _, on_finish);
        job
    }

    // ---- introspection ----

    /// Sizes of the three queues: `(new, in progress, finished)`.
    pub fn queue_lengths(&self) -> (usize, usize, usize) {
        let queues = self.queues.lock();
        (
            queues.new.len(),
            queues.in_progress.len(),
            queues.finished.len(),
        )
    }

    /// Which queue the job id currently lives in.
    pub fn state_of(&self, job_id: &str) -> Option<JobState> {
        let queues = self.queues.lock();
        if queues.new.iter().any(|j| j.job.id() == job_id) {
            return Some(JobState::New);
        }
        if queues.in_progress.iter().any(|j| j.job.id() == job_id) {
            return Some(JobState::InProgress);
        }
        queues
            .finished
            .iter()
            .find(|j| j.job.id() == job_id)
            .map(|j| JobState::Finished(j.outcome))
    }

    /// Ask every in-progress job to cancel. Marks and returns; it never
    /// waits for the jobs to acknowledge.
    pub fn cancel_all(&self) {
        let tokens: Vec<CancellationToken> = {
            let queues = self.queues.lock();
            queues
                .in_progress
                .iter()
                .map(|j| j.cancel.clone())
                .collect()
        };
        for token in tokens {
            token.cancel();
        }
    }

    /// Cancel one job: a queued job is withdrawn (its callback fires with
    /// `Cancelled`), a running one is asked to stop. Returns whether the
    /// id was found in either queue.
    pub fn cancel(&self, job_id: &str) -> bool {
        let withdrawn = {
            let mut queues = self.queues.lock();
            match queues.new.iter().position(|j| j.job.id() == job_id) {
                Some(index) => {
                    let mut queued = queues.new.remove(index);
                    queues.finished.push(FinishedJob {
                        job: Arc::clone(&queued.job),
                        outcome: JobOutcome::Cancelled,
                        finished_at: Instant::now(),
                    });
                    queued.on_finish.take()
                }
                None => None,
            }
        };
        if let Some(on_finish) = withdrawn {
            on_finish(JobOutcome::Cancelled);
            return true;
        }

        let token = {
            let queues = self.queues.lock();
            queues
                .in_progress
                .iter()
                .find(|j| j.job.id() == job_id)
                .map(|j| j.cancel.clone())
        };
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    // ---- the dispatch machinery ----

    /// Inject scheduled jobs that are due.
    fn run_scheduled(self: &Arc<Self>) {
        let due: Vec<Arc<dyn Job>> = {
            let mut scheduled = self.scheduled.lock();
            let mut due = vec![];
            for entry in scheduled.iter_mut() {
                if entry.last_run.elapsed() >= entry.interval {
                    entry.last_run = Instant::now();
                    due.push((entry.factory)());
                }
            }
            due
        };
        for job in due {
            debug!(job_id=%job.id(), kind=%job.kind(), "scheduled job injected");
            self.submit(job, |_| {});
        }
    }

    /// Dispatch whatever the policy allows, highest priority first.
    fn run_queued(self: &Arc<Self>) {
        loop {
            let started = {
                let mut queues = self.queues.lock();
                self.prune_finished(&mut queues);

                if queues.in_progress.iter().any(|j| j.job.options().exclusive) {
                    break;
                }
                let Some(best) = queues
                    .new
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, j)| (j.job.options().priority, std::cmp::Reverse(j.seq)))
                    .map(|(index, _)| index)
                else {
                    break;
                };
                let candidate = &queues.new[best];
                let options = candidate.job.options();
                if options.exclusive && !queues.in_progress.is_empty() {
                    break;
                }
                // The best candidate waits rather than preempting; nothing
                // below it may jump the queue either.
                if !options.preemptable
                    && queues.in_progress.iter().any(|j| {
                        let running = j.job.options();
                        running.preemptable && running.priority < options.priority
                    })
                {
                    break;
                }

                let mut queued = queues.new.remove(best);
                let cancel = CancellationToken::new();
                queues.in_progress.push(RunningJob {
                    job: Arc::clone(&queued.job),
                    cancel: cancel.clone(),
                });
                (queued.job, queued.on_finish.take(), cancel)
            };

            let (job, on_finish, cancel) = started;
            debug!(job_id=%job.id(), kind=%job.kind(), "job started");
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let outcome = Arc::clone(&job).execute(this.ctx.clone(), cancel).await;

                // Completion: move the job between queues under the mutex,
                // release it, re-run dispatch, then notify the subscriber.
                {
                    let mut queues = this.queues.lock();
                    queues.in_progress.retain(|j| j.job.id() != job.id());
                    queues.finished.push(FinishedJob {
                        job: Arc::clone(&job),
                        outcome,
                        finished_at: Instant::now(),
                    });
                }
                info!(job_id=%job.id(), kind=%job.kind(), ?outcome, "job finished");
                this.run_queued();
                if let Some(on_finish) = on_finish {
                    on_finish(outcome);
                }
                this.wakeup.notify_one();
            });
        }
    }

    fn prune_finished(&self, queues: &mut Queues) {
        let retention = self
            .ctx
            .controller
            .context()
            .config
            .params()
            .finished_jobs_retention;
        queues
            .finished
            .retain(|j| j.finished_at.elapsed() < retention);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixture::idle_job_context;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    /// A job that parks until told to finish, recording when it started.
    #[derive(Debug)]
    struct GateJob {
        id: String,
        options: JobOptions,
        release: Mutex<Option<oneshot::Receiver<()>>>,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        start_order: Arc<Mutex<Vec<String>>>,
    }

    impl GateJob {
        fn new(
            name: &str,
            options: JobOptions,
            running: Arc<AtomicUsize>,
            peak: Arc<AtomicUsize>,
            start_order: Arc<Mutex<Vec<String>>>,
        ) -> (Arc<Self>, oneshot::Sender<()>) {
            let (tx, rx) = oneshot::channel();
            (
                Arc::new(Self {
                    id: name.to_string(),
                    options,
                    release: Mutex::new(Some(rx)),
                    running,
                    peak,
                    start_order,
                }),
                tx,
            )
        }
    }

    #[async_trait::async_trait]
    impl Job for GateJob {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> &'static str {
            "GATE"
        }

        fn options(&self) -> JobOptions {
            self.options
        }

        async fn execute(
            self: Arc<Self>,
            _ctx: JobContext,
            cancel: CancellationToken,
        ) -> JobOutcome {
            self.start_order.lock().push(self.id.clone());
            let concurrent = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(concurrent, Ordering::SeqCst);
            let release = self.release.lock().take().expect("started once");
            let outcome = tokio::select! {
                _ = release => JobOutcome::Success,
                _ = cancel.cancelled() => JobOutcome::Cancelled,
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    fn options(priority: i32, exclusive: bool, preemptable: bool) -> JobOptions {
        JobOptions {
            priority,
            exclusive,
            preemptable,
        }
    }

    async fn wait_until(mut predicate: impl FnMut() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    /// Shared counters handed to every [`GateJob`] of one test.
    #[derive(Default)]
    struct Gates {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        start_order: Arc<Mutex<Vec<String>>>,
    }

    impl Gates {
        fn gate(&self, name: &str, options: JobOptions) -> (Arc<GateJob>, oneshot::Sender<()>) {
            GateJob::new(
                name,
                options,
                Arc::clone(&self.running),
                Arc::clone(&self.peak),
                Arc::clone(&self.start_order),
            )
        }
    }

    #[tokio::test]
    async fn exclusive_jobs_run_alone() {
        let controller = JobController::new(idle_job_context().await);
        let gates = Gates::default();

        let (a, release_a) = gates.gate("a", options(0, false, true));
        let (b, release_b) = gates.gate("b", options(5, true, true));
        let (c, release_c) = gates.gate("c", options(1, false, true));

        controller.submit(Arc::clone(&a) as _, |_| {});
        wait_until(|| controller.state_of("a") == Some(JobState::InProgress)).await;

        // The exclusive job outprioritizes "c" but must wait for an idle
        // controller; "c" must not start ahead of it either.
        controller.submit(Arc::clone(&b) as _, |_| {});
        controller.submit(Arc::clone(&c) as _, |_| {});
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(controller.state_of("b"), Some(JobState::New));
        assert_eq!(controller.state_of("c"), Some(JobState::New));

        release_a.send(()).unwrap();
        wait_until(|| controller.state_of("b") == Some(JobState::InProgress)).await;
        // While the exclusive job runs, nothing else starts.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(controller.state_of("c"), Some(JobState::New));

        release_b.send(()).unwrap();
        wait_until(|| controller.state_of("c") == Some(JobState::InProgress)).await;
        release_c.send(()).unwrap();
        wait_until(|| {
            matches!(controller.state_of("c"), Some(JobState::Finished(_)))
        })
        .await;

        // Nothing ever ran concurrently.
        assert_eq!(gates.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn job_id_lives_in_exactly_one_queue() {
        let controller = JobController::new(idle_job_context().await);
        let gates = Gates::default();
        let (job, release) = gates.gate("solo", options(0, false, true));

        let (tx, rx) = oneshot::channel();
        controller.submit(Arc::clone(&job) as _, move |outcome| {
            tx.send(outcome).unwrap();
        });
        wait_until(|| controller.state_of("solo") == Some(JobState::InProgress)).await;

        let (new, in_progress, finished) = controller.queue_lengths();
        assert_eq!((new, in_progress, finished), (0, 1, 0));

        release.send(()).unwrap();
        assert_eq!(rx.await.unwrap(), JobOutcome::Success);

        // The callback fires after the job moved to the finished queue.
        let (new, in_progress, finished) = controller.queue_lengths();
        assert_eq!((new, in_progress, finished), (0, 0, 1));
        assert_eq!(
            controller.state_of("solo"),
            Some(JobState::Finished(JobOutcome::Success))
        );
    }

    #[tokio::test]
    async fn priority_orders_dispatch_and_submission_breaks_ties() {
        let controller = JobController::new(idle_job_context().await);
        let gates = Gates::default();

        // An exclusive gate keeps the queue from draining while we stack
        // candidates behind it; the candidates are exclusive too, so their
        // start order is the dispatch order.
        let (gate, release_gate) = gates.gate("gate", options(10, true, true));
        controller.submit(Arc::clone(&gate) as _, |_| {});
        wait_until(|| controller.state_of("gate") == Some(JobState::InProgress)).await;

        for (name, priority) in [("low", -1), ("high", 3), ("high-later", 3)] {
            let (job, release) = gates.gate(name, options(priority, true, true));
            // Finish instantly once started.
            release.send(()).unwrap();
            controller.submit(Arc::clone(&job) as _, |_| {});
        }

        release_gate.send(()).unwrap();
        wait_until(|| gates.start_order.lock().len() == 4).await;
        assert_eq!(
            *gates.start_order.lock(),
            vec!["gate", "high", "high-later", "low"]
        );
    }

    #[tokio::test]
    async fn cancel_all_marks_without_blocking() {
        let controller = JobController::new(idle_job_context().await);
        let gates = Gates::default();
        let (job, _release) = gates.gate("long", options(0, false, true));

        let (tx, rx) = oneshot::channel();
        controller.submit(Arc::clone(&job) as _, move |outcome| {
            tx.send(outcome).unwrap();
        });
        wait_until(|| controller.state_of("long") == Some(JobState::InProgress)).await;

        controller.cancel_all();
        assert_eq!(rx.await.unwrap(), JobOutcome::Cancelled);
    }
}
