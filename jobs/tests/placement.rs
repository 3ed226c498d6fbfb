//! End-to-end placement tests: real workers (request server + file server)
//! on loopback sockets, a real controller, real jobs.

use catalog::{Configuration, MemKv, ServiceParams};
use controller::{Controller, ServiceContext};
use data_types::{
    Chunk, Database, DatabaseFamily, DatabaseStatus, PartitionedTableParams, StripingParams,
    Table, TablePartitioning, WorkerState,
};
use jobs::{
    DeleteWorkerJob, DirectorIndexJob, FindAllJob, FixUpJob, Job, JobContext, JobController,
    JobOptions, JobOutcome, MemIndexTarget, PurgeJob, RebalanceJob, ReplicateJob, VerifyJob,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use worker::{
    chunk_file_name, FileServer, MockSqlBackend, SqlResultSet, WorkerContext, WorkerServer,
};

const INSTANCE_ID: &str = "itest-instance";
const FAMILY: &str = "production";

struct TestWorker {
    name: String,
    data_dir: PathBuf,
    sql: Arc<MockSqlBackend>,
}

struct TestCluster {
    ctx: JobContext,
    config: Configuration,
    workers: Vec<TestWorker>,
    shutdown: CancellationToken,
    _dirs: Vec<test_helpers::TempDir>,
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn partitioned_table(name: &str, database: &str) -> Table {
    Table {
        name: name.into(),
        schema: "(id BIGINT, ra DOUBLE, dec DOUBLE)".into(),
        partitioning: TablePartitioning::Partitioned(PartitionedTableParams {
            dir_db: database.into(),
            dir_table: name.into(),
            dir_col: "id".into(),
            lon_col: "ra".into(),
            lat_col: "dec".into(),
            overlap: 0.01667,
            sub_chunks: true,
        }),
    }
}

/// Boot `num_workers` workers serving `databases` of one family.
async fn cluster(num_workers: usize, databases: &[&str]) -> TestCluster {
    test_helpers::maybe_start_logging();

    let kv = Arc::new(MemKv::new());
    let config = Configuration::bootstrap(
        kv,
        ServiceParams {
            instance_id: INSTANCE_ID.to_string(),
            fs_buf_size: 64 * 1024,
            job_scheduler_ival: std::time::Duration::from_millis(20),
            ..Default::default()
        },
    )
    .unwrap();
    config
        .add_family(&DatabaseFamily {
            name: FAMILY.into(),
            replication_level: 2,
            striping: StripingParams {
                stripes: 340,
                sub_stripes: 3,
                overlap: 0.01667,
                partitioning_id: 1,
            },
        })
        .unwrap();
    for database in databases {
        config
            .add_database(&Database {
                name: (*database).into(),
                family: FAMILY.into(),
                status: DatabaseStatus::Ready,
                tables: vec![partitioned_table("Object", database)],
            })
            .unwrap();
    }

    let shutdown = CancellationToken::new();
    let mut workers = vec![];
    let mut dirs = vec![];
    for index in 0..num_workers {
        let name = format!("w{}", index + 1);
        let dir = test_helpers::tmp_dir().unwrap();
        let data_dir = dir.path().to_path_buf();
        dirs.push(dir);

        // Register with placeholder ports first; the worker context only
        // needs the data directory, and the real ports are recorded once
        // the listeners are bound.
        config
            .add_worker(&data_types::WorkerNode {
                name: name.clone(),
                host: "127.0.0.1".into(),
                svc_port: 0,
                fs_port: 0,
                data_dir: data_dir.display().to_string(),
                state: WorkerState::Active,
            })
            .unwrap();

        let sql = Arc::new(MockSqlBackend::new());
        let context = WorkerContext::new(config.clone(), &name, Arc::clone(&sql) as _).unwrap();
        let request_server = WorkerServer::bind(context.clone(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let file_server = FileServer::bind(context, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        config
            .add_worker(&data_types::WorkerNode {
                name: name.clone(),
                host: "127.0.0.1".into(),
                svc_port: request_server.local_addr().port(),
                fs_port: file_server.local_addr().port(),
                data_dir: data_dir.display().to_string(),
                state: WorkerState::Active,
            })
            .unwrap();

        tokio::spawn(request_server.run(shutdown.clone()));
        tokio::spawn(file_server.run(shutdown.clone()));
        workers.push(TestWorker {
            name,
            data_dir,
            sql,
        });
    }

    let controller = Controller::new(ServiceContext::new(config.clone()));
    TestCluster {
        ctx: JobContext::new(controller),
        config,
        workers,
        shutdown,
        _dirs: dirs,
    }
}

impl TestCluster {
    fn worker(&self, name: &str) -> &TestWorker {
        self.workers.iter().find(|w| w.name == name).unwrap()
    }

    /// Put chunk files of one database chunk onto a worker.
    async fn seed_chunk(&self, worker: &str, database: &str, chunk: u32, content: &str) {
        let dir = self.worker(worker).data_dir.join(database);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        for overlap in [false, true] {
            let name = chunk_file_name("Object", chunk, overlap);
            tokio::fs::write(dir.join(name), content).await.unwrap();
        }
    }

    async fn has_chunk(&self, worker: &str, database: &str, chunk: u32) -> bool {
        let dir = self.worker(worker).data_dir.join(database);
        tokio::fs::try_exists(dir.join(chunk_file_name("Object", chunk, false)))
            .await
            .unwrap_or(false)
    }

    async fn run_job<J: Job>(&self, job: Arc<J>) -> JobOutcome {
        let cancel = CancellationToken::new();
        job.execute(self.ctx.clone(), cancel).await
    }
}

#[tokio::test]
async fn find_all_populates_the_replica_view() {
    let cluster = cluster(2, &["sky"]).await;
    cluster.seed_chunk("w1", "sky", 1, "a\n").await;
    cluster.seed_chunk("w1", "sky", 2, "b\n").await;
    cluster.seed_chunk("w2", "sky", 2, "b\n").await;

    let job = FindAllJob::new(FAMILY, true, JobOptions::find_all());
    let outcome = cluster.run_job(Arc::clone(&job)).await;
    assert_eq!(outcome, JobOutcome::Success);

    let result = job.result();
    assert_eq!(result.errors.len(), 0);
    assert_eq!(result.replicas.len(), 3);

    let view = &cluster.ctx.replicas;
    assert_eq!(
        view.chunks(FAMILY),
        vec![Chunk::new(FAMILY, 1), Chunk::new(FAMILY, 2)]
    );
    assert_eq!(
        view.workers_with(&Chunk::new(FAMILY, 2)),
        ["w1".to_string(), "w2".to_string()].into_iter().collect()
    );
}

#[tokio::test]
async fn replicate_reaches_the_requested_level() {
    let cluster = cluster(3, &["sky"]).await;
    // Chunks {1,2,3} on w1:[1,2], w2:[2,3], w3:[1,3].
    cluster.seed_chunk("w1", "sky", 1, "c1\n").await;
    cluster.seed_chunk("w1", "sky", 2, "c2\n").await;
    cluster.seed_chunk("w2", "sky", 2, "c2\n").await;
    cluster.seed_chunk("w2", "sky", 3, "c3\n").await;
    cluster.seed_chunk("w3", "sky", 1, "c1\n").await;
    cluster.seed_chunk("w3", "sky", 3, "c3\n").await;

    let job = ReplicateJob::new(FAMILY, 3, JobOptions::replicate());
    let outcome = cluster.run_job(Arc::clone(&job)).await;
    assert_eq!(outcome, JobOutcome::Success);

    // One new replica per chunk; every chunk now lives on every worker.
    let result = job.result();
    assert_eq!(result.errors.len(), 0);
    assert_eq!(result.created.len(), 3);
    for worker in ["w1", "w2", "w3"] {
        for chunk in [1, 2, 3] {
            assert!(
                cluster.has_chunk(worker, "sky", chunk).await,
                "chunk {} missing on {}",
                chunk,
                worker
            );
        }
    }

    // No chunks are left claimed in the locker.
    assert!(cluster
        .ctx
        .controller
        .context()
        .chunk_locker
        .locked(None)
        .is_empty());
}

#[tokio::test]
async fn purge_deletes_surplus_replicas() {
    let cluster = cluster(3, &["sky"]).await;
    for worker in ["w1", "w2", "w3"] {
        cluster.seed_chunk(worker, "sky", 1, "c1\n").await;
    }

    let job = PurgeJob::new(FAMILY, 2, JobOptions::purge());
    let outcome = cluster.run_job(Arc::clone(&job)).await;
    assert_eq!(outcome, JobOutcome::Success);

    let result = job.result();
    assert_eq!(result.removed.len(), 1);

    let mut holders = 0;
    for worker in ["w1", "w2", "w3"] {
        if cluster.has_chunk(worker, "sky", 1).await {
            holders += 1;
        }
    }
    assert_eq!(holders, 2);
}

#[tokio::test]
async fn fix_up_restores_collocation() {
    let cluster = cluster(2, &["sky", "calib"]).await;
    // w2 holds chunk 1 of "sky" only; collocation needs "calib" there too.
    cluster.seed_chunk("w1", "sky", 1, "c1\n").await;
    cluster.seed_chunk("w1", "calib", 1, "c1\n").await;
    cluster.seed_chunk("w2", "sky", 1, "c1\n").await;

    let job = FixUpJob::new(FAMILY, JobOptions::fix_up());
    let outcome = cluster.run_job(Arc::clone(&job)).await;
    assert_eq!(outcome, JobOutcome::Success);

    assert!(cluster.has_chunk("w2", "calib", 1).await);
    let result = job.result();
    assert_eq!(result.created.len(), 1);
    assert_eq!(result.created[0].worker, "w2");
    assert_eq!(result.created[0].database, "calib");
}

#[tokio::test]
async fn rebalance_moves_chunks_toward_the_average() {
    let cluster = cluster(2, &["sky"]).await;
    for chunk in 1..=4 {
        cluster.seed_chunk("w1", "sky", chunk, "x\n").await;
    }

    // Estimate first: a plan, no movement.
    let estimate = RebalanceJob::new(FAMILY, true, JobOptions::rebalance());
    assert_eq!(
        cluster.run_job(Arc::clone(&estimate)).await,
        JobOutcome::Success
    );
    let planned = estimate.result();
    assert_eq!(planned.plan.len(), 2);
    assert!(planned.moved.is_empty());
    assert!(cluster.has_chunk("w1", "sky", 1).await);

    // Then execute for real.
    let job = RebalanceJob::new(FAMILY, false, JobOptions::rebalance());
    assert_eq!(cluster.run_job(Arc::clone(&job)).await, JobOutcome::Success);
    let result = job.result();
    assert_eq!(result.moved.len(), 2);

    let mut on_w1 = 0;
    let mut on_w2 = 0;
    for chunk in 1..=4 {
        if cluster.has_chunk("w1", "sky", chunk).await {
            on_w1 += 1;
        }
        if cluster.has_chunk("w2", "sky", chunk).await {
            on_w2 += 1;
        }
    }
    assert_eq!((on_w1, on_w2), (2, 2));
}

#[tokio::test]
async fn verify_reports_disagreeing_replicas() {
    let cluster = cluster(2, &["sky"]).await;
    cluster.seed_chunk("w1", "sky", 1, "same\n").await;
    cluster.seed_chunk("w2", "sky", 1, "different content\n").await;

    // Verification samples from the replica view, so scan first.
    let scan = FindAllJob::new(FAMILY, true, JobOptions::find_all());
    assert_eq!(cluster.run_job(scan).await, JobOutcome::Success);

    let job = VerifyJob::new(16, true, JobOptions::verify());
    let outcome = cluster.run_job(Arc::clone(&job)).await;
    assert_eq!(outcome, JobOutcome::Success);

    let result = job.result();
    assert!(result.num_inspected >= 2);
    assert_eq!(result.differences.len(), 1);
    let difference = &result.differences[0];
    assert!(!difference.reasons.is_empty());
}

#[tokio::test]
async fn delete_worker_evacuates_and_disables() {
    let cluster = cluster(3, &["sky"]).await;
    // Chunk 1 lives on w1 and w2 (level 2); chunk 2 only on w1.
    cluster.seed_chunk("w1", "sky", 1, "c1\n").await;
    cluster.seed_chunk("w2", "sky", 1, "c1\n").await;
    cluster.seed_chunk("w1", "sky", 2, "c2\n").await;

    let job = DeleteWorkerJob::new("w1", false, JobOptions::delete_worker());
    let outcome = cluster.run_job(Arc::clone(&job)).await;
    assert_eq!(outcome, JobOutcome::Success);

    let result = job.result();
    assert!(result.orphans.is_empty());
    // Both chunks kept their replication level without w1.
    let mut survivors_with_1 = 0;
    let mut survivors_with_2 = 0;
    for worker in ["w2", "w3"] {
        if cluster.has_chunk(worker, "sky", 1).await {
            survivors_with_1 += 1;
        }
        if cluster.has_chunk(worker, "sky", 2).await {
            survivors_with_2 += 1;
        }
    }
    assert!(survivors_with_1 >= 1);
    assert!(survivors_with_2 >= 1);

    // The worker was disabled, not removed.
    let node = cluster.config.worker("w1").unwrap();
    assert_eq!(node.state, WorkerState::Inactive);
}

#[tokio::test]
async fn director_index_collects_rows_and_errors_per_chunk() {
    let cluster = cluster(2, &["sky"]).await;
    cluster.seed_chunk("w1", "sky", 1, "c1\n").await;
    cluster.seed_chunk("w2", "sky", 2, "c2\n").await;

    let scan = FindAllJob::new(FAMILY, true, JobOptions::find_all());
    assert_eq!(cluster.run_job(scan).await, JobOutcome::Success);

    // w1 answers with two rows, w2 with a SQL failure.
    cluster.worker("w1").sql.push_result(Ok(SqlResultSet {
        columns: vec!["id".into(), "subChunkId".into()],
        rows: vec![
            vec!["9001".into(), "3".into()],
            vec!["9002".into(), "4".into()],
        ],
        affected: 0,
    }));
    cluster
        .worker("w2")
        .sql
        .push_result(Err("Table 'sky.Object_2' doesn't exist".into()));

    let target = Arc::new(MemIndexTarget::default());
    let job = DirectorIndexJob::new(
        "sky",
        "Object",
        None,
        Arc::clone(&target) as _,
        JobOptions::director_index(),
    );
    let outcome = cluster.run_job(Arc::clone(&job)).await;
    assert_eq!(outcome, JobOutcome::Failed);

    let result = job.result();
    assert_eq!(result.num_rows, 2);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].chunk, Chunk::new(FAMILY, 2));
    assert!(result.errors[0].message.contains("doesn't exist"));
    assert_eq!(target.rows.lock().len(), 2);
}

#[tokio::test]
async fn job_controller_runs_a_submitted_job_end_to_end() {
    let cluster = cluster(2, &["sky"]).await;
    cluster.seed_chunk("w1", "sky", 1, "c1\n").await;

    let job_controller = JobController::new(cluster.ctx.clone());
    job_controller.start();

    let (tx, rx) = tokio::sync::oneshot::channel();
    let job = job_controller.find_all(
        FAMILY,
        true,
        move |outcome| {
            tx.send(outcome).unwrap();
        },
        JobOptions::find_all(),
    );

    assert_eq!(rx.await.unwrap(), JobOutcome::Success);
    assert_eq!(job.result().replicas.len(), 1);
    job_controller.stop().await;
}
