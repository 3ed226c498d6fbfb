//! The [`Controller`] and its per-request-type factory methods.

use crate::link::{Dispatch, LinkFactory, TcpLinkFactory, TransportError};
use crate::request::{Callback, RequestHandle, RequestOptions, RequestResult};
use crate::{Error, Result, ServiceContext};
use data_types::{TransactionId, WorkerNode};
use metric::U64Counter;
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use protocol::{
    DeleteBody, DisposeBody, EchoBody, FindAllBody, FindBody, IndexBody, ReplicateBody,
    RequestBody, RequestEnvelope, ResponseEnvelope, ServiceAction, ServiceBody, SqlBody, SqlKind,
    StatusBody, StopBody,
};
use snafu::ensure;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// The identity a controller stamps on its log lines and diagnostics.
#[derive(Debug, Clone)]
pub struct ControllerIdentity {
    /// Unique id of this controller instance.
    pub id: String,
    /// Host the controller runs on.
    pub host: String,
    /// Process id.
    pub pid: u32,
    /// Start time, seconds since the UNIX epoch.
    pub start_time: i64,
}

impl fmt::Display for ControllerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.id, self.host, self.pid)
    }
}

/// An in-flight registry entry. The callback lives in a one-shot slot that
/// is taken before invocation, so completion fires at most once and the
/// closure cannot keep the entry alive.
struct InFlight {
    worker: String,
    callback: Option<Callback>,
    accepted_at: std::time::Instant,
}

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlight")
            .field("worker", &self.worker)
            .field("armed", &self.callback.is_some())
            .finish()
    }
}

/// The cluster-wide outbound request runtime.
///
/// Owns the in-flight registry and one logical connection per worker. A
/// request accepted by a factory method is guaranteed exactly one terminal
/// notification: worker response, transport failure or expiration,
/// whichever happens first. Callbacks never run under the controller's
/// locks.
#[derive(Debug)]
pub struct Controller {
    identity: ControllerIdentity,
    context: ServiceContext,
    link_factory: Box<dyn LinkFactory>,
    links: Mutex<HashMap<String, mpsc::Sender<Dispatch>>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    requests_accepted: U64Counter,
    requests_completed: U64Counter,
    request_latency: histogram::RollingHistogram,
}

impl Controller {
    /// Create a controller speaking TCP to its workers.
    pub fn new(context: ServiceContext) -> Arc<Self> {
        Self::new_with_link_factory(context, Box::<TcpLinkFactory>::default())
    }

    /// Create a controller with a custom transport, for tests.
    pub fn new_with_link_factory(
        context: ServiceContext,
        link_factory: Box<dyn LinkFactory>,
    ) -> Arc<Self> {
        let identity = ControllerIdentity {
            id: uuid::Uuid::new_v4().to_string(),
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            pid: std::process::id(),
            start_time: context.time_provider.now().timestamp(),
        };
        let accepted = context
            .metrics
            .register_metric::<U64Counter>("controller_requests", "requests by terminal outcome");
        Arc::new(Self {
            identity,
            context,
            link_factory,
            links: Default::default(),
            in_flight: Default::default(),
            requests_accepted: accepted.recorder(&[("outcome", "accepted")]),
            requests_completed: accepted.recorder(&[("outcome", "completed")]),
            request_latency: histogram::RollingHistogram::new(
                "ControllerRequestLatency",
                &[0.01, 0.1, 1.0, 10.0],
                Duration::from_secs(3600),
                1000,
            ),
        })
    }

    /// This controller's identity.
    pub fn identity(&self) -> &ControllerIdentity {
        &self.identity
    }

    /// The service context the controller was built around.
    pub fn context(&self) -> &ServiceContext {
        &self.context
    }

    /// Number of requests currently awaiting their terminal notification.
    pub fn num_in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// The rolling histogram of request round-trip times, seconds.
    pub fn request_latency(&self) -> &histogram::RollingHistogram {
        &self.request_latency
    }

    /// Whether the request id is still in the registry.
    pub fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight.lock().contains_key(id)
    }

    // ---- replica requests ----

    /// Ask `worker_name` to create a replica by pulling chunk files from
    /// `source_worker_name`.
    pub fn replicate(
        self: &Arc<Self>,
        worker_name: &str,
        source_worker_name: &str,
        database: &str,
        chunk: u32,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        ensure!(
            worker_name != source_worker_name,
            crate::InvalidArgumentSnafu {
                reason: format!(
                    "source and destination must differ, got '{}' twice",
                    worker_name
                ),
            }
        );
        let worker = self.worker(worker_name)?;
        let source = self.worker(source_worker_name)?;
        self.known_database(database)?;

        Ok(self.submit(
            &worker,
            RequestBody::Replicate(ReplicateBody {
                database: database.to_string(),
                chunk,
                source_worker: source.name.clone(),
                source_host: source.host.clone(),
                source_fs_port: source.fs_port as u32,
            }),
            options,
            Box::new(on_finish),
        ))
    }

    /// Ask `worker_name` to delete its replica of a chunk.
    pub fn delete_replica(
        self: &Arc<Self>,
        worker_name: &str,
        database: &str,
        chunk: u32,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        let worker = self.worker(worker_name)?;
        self.known_database(database)?;
        Ok(self.submit(
            &worker,
            RequestBody::Delete(DeleteBody {
                database: database.to_string(),
                chunk,
            }),
            options,
            Box::new(on_finish),
        ))
    }

    /// Ask `worker_name` to inspect its replica of a chunk.
    pub fn find_replica(
        self: &Arc<Self>,
        worker_name: &str,
        database: &str,
        chunk: u32,
        compute_checksum: bool,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        let worker = self.worker(worker_name)?;
        self.known_database(database)?;
        Ok(self.submit(
            &worker,
            RequestBody::Find(FindBody {
                database: database.to_string(),
                chunk,
                compute_checksum,
            }),
            options,
            Box::new(on_finish),
        ))
    }

    /// Ask `worker_name` to enumerate all replicas of a database it holds.
    pub fn find_all_replicas(
        self: &Arc<Self>,
        worker_name: &str,
        database: &str,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        let worker = self.worker(worker_name)?;
        self.known_database(database)?;
        Ok(self.submit(
            &worker,
            RequestBody::FindAll(FindAllBody {
                database: database.to_string(),
            }),
            options,
            Box::new(on_finish),
        ))
    }

    // ---- probes and extracts ----

    /// Probe worker liveness; the worker echoes `data` after `delay`.
    pub fn echo(
        self: &Arc<Self>,
        worker_name: &str,
        data: &str,
        delay: Duration,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        let worker = self.worker(worker_name)?;
        Ok(self.submit(
            &worker,
            RequestBody::Echo(EchoBody {
                data: data.to_string(),
                delay_ms: delay.as_millis() as u64,
            }),
            options,
            Box::new(on_finish),
        ))
    }

    /// Ask `worker_name` for a director-index extract of one chunk,
    /// optionally scoped to a super-transaction.
    pub fn index(
        self: &Arc<Self>,
        worker_name: &str,
        database: &str,
        director_table: &str,
        chunk: u32,
        transaction_id: Option<TransactionId>,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        let worker = self.worker(worker_name)?;
        self.known_database(database)?;
        Ok(self.submit(
            &worker,
            RequestBody::Index(IndexBody {
                database: database.to_string(),
                director_table: director_table.to_string(),
                chunk,
                has_transaction: transaction_id.is_some(),
                transaction_id: transaction_id.map(|t| t.get()).unwrap_or_default(),
            }),
            options,
            Box::new(on_finish),
        ))
    }

    // ---- SQL family ----

    /// Run a free-form query on the worker's database service.
    pub fn sql_query(
        self: &Arc<Self>,
        worker_name: &str,
        query: &str,
        user: &str,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        ensure!(
            !query.is_empty(),
            crate::InvalidArgumentSnafu {
                reason: "query must not be empty".to_string(),
            }
        );
        self.sql(
            worker_name,
            SqlBody {
                kind: SqlKind::Query as i32,
                database: String::new(),
                tables: vec![],
                query: query.to_string(),
                user: user.to_string(),
                spec: String::new(),
            },
            options,
            Box::new(on_finish),
        )
    }

    /// Create a database on the worker.
    pub fn sql_create_database(
        self: &Arc<Self>,
        worker_name: &str,
        database: &str,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        self.sql_db_request(worker_name, SqlKind::CreateDatabase, database, options, on_finish)
    }

    /// Drop a database from the worker.
    pub fn sql_delete_database(
        self: &Arc<Self>,
        worker_name: &str,
        database: &str,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        self.sql_db_request(worker_name, SqlKind::DeleteDatabase, database, options, on_finish)
    }

    /// Allow user queries against a database on the worker.
    pub fn sql_enable_database(
        self: &Arc<Self>,
        worker_name: &str,
        database: &str,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        self.sql_db_request(worker_name, SqlKind::EnableDatabase, database, options, on_finish)
    }

    /// Withdraw a database from user queries on the worker.
    pub fn sql_disable_database(
        self: &Arc<Self>,
        worker_name: &str,
        database: &str,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        self.sql_db_request(worker_name, SqlKind::DisableDatabase, database, options, on_finish)
    }

    /// Grant a user access to a database on the worker.
    pub fn sql_grant_access(
        self: &Arc<Self>,
        worker_name: &str,
        database: &str,
        user: &str,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        self.known_database(database)?;
        self.sql(
            worker_name,
            SqlBody {
                kind: SqlKind::GrantAccess as i32,
                database: database.to_string(),
                tables: vec![],
                query: String::new(),
                user: user.to_string(),
                spec: String::new(),
            },
            options,
            Box::new(on_finish),
        )
    }

    /// Create tables on the worker; `spec` carries the column list.
    pub fn sql_create_table(
        self: &Arc<Self>,
        worker_name: &str,
        database: &str,
        table: &str,
        spec: &str,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        self.sql_table_request(
            worker_name,
            SqlKind::CreateTable,
            database,
            vec![table.to_string()],
            spec,
            options,
            on_finish,
        )
    }

    /// Drop a table from the worker.
    pub fn sql_delete_table(
        self: &Arc<Self>,
        worker_name: &str,
        database: &str,
        table: &str,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        self.sql_table_request(
            worker_name,
            SqlKind::DeleteTable,
            database,
            vec![table.to_string()],
            "",
            options,
            on_finish,
        )
    }

    /// Apply an `ALTER TABLE` specification to tables on the worker.
    pub fn sql_alter_tables(
        self: &Arc<Self>,
        worker_name: &str,
        database: &str,
        tables: Vec<String>,
        alter_spec: &str,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        self.sql_table_request(
            worker_name,
            SqlKind::AlterTables,
            database,
            tables,
            alter_spec,
            options,
            on_finish,
        )
    }

    /// Create indexes on tables on the worker; `spec` carries the index
    /// definition.
    pub fn sql_create_table_indexes(
        self: &Arc<Self>,
        worker_name: &str,
        database: &str,
        tables: Vec<String>,
        spec: &str,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        self.sql_table_request(
            worker_name,
            SqlKind::CreateIndexes,
            database,
            tables,
            spec,
            options,
            on_finish,
        )
    }

    /// Drop indexes from tables on the worker; `spec` names the index.
    pub fn sql_drop_table_indexes(
        self: &Arc<Self>,
        worker_name: &str,
        database: &str,
        tables: Vec<String>,
        spec: &str,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        self.sql_table_request(
            worker_name,
            SqlKind::DropIndexes,
            database,
            tables,
            spec,
            options,
            on_finish,
        )
    }

    /// Remove a committed or aborted super-transaction's partitions from
    /// tables on the worker.
    pub fn sql_remove_table_partitions(
        self: &Arc<Self>,
        worker_name: &str,
        database: &str,
        tables: Vec<String>,
        transaction_id: TransactionId,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        self.sql_table_request(
            worker_name,
            SqlKind::RemoveTablePartitions,
            database,
            tables,
            &transaction_id.to_string(),
            options,
            on_finish,
        )
    }

    // ---- service management and request control ----

    /// Report the state of the worker's request service.
    pub fn service_status(
        self: &Arc<Self>,
        worker_name: &str,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        self.service(worker_name, ServiceAction::Status, options, on_finish)
    }

    /// Suspend request execution on the worker.
    pub fn service_suspend(
        self: &Arc<Self>,
        worker_name: &str,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        self.service(worker_name, ServiceAction::Suspend, options, on_finish)
    }

    /// Resume request execution on the worker.
    pub fn service_resume(
        self: &Arc<Self>,
        worker_name: &str,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        self.service(worker_name, ServiceAction::Resume, options, on_finish)
    }

    /// Drop all queued requests on the worker.
    pub fn service_drain(
        self: &Arc<Self>,
        worker_name: &str,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        self.service(worker_name, ServiceAction::Drain, options, on_finish)
    }

    /// Stop an in-progress request on the worker. Stopping an unknown
    /// request succeeds with a not-found extended status.
    pub fn stop_by_id(
        self: &Arc<Self>,
        worker_name: &str,
        target_id: &str,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        let worker = self.worker(worker_name)?;
        Ok(self.submit(
            &worker,
            RequestBody::Stop(StopBody {
                target_id: target_id.to_string(),
            }),
            options,
            Box::new(on_finish),
        ))
    }

    /// Inquire about a request on the worker.
    pub fn status_by_id(
        self: &Arc<Self>,
        worker_name: &str,
        target_id: &str,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        let worker = self.worker(worker_name)?;
        Ok(self.submit(
            &worker,
            RequestBody::Status(StatusBody {
                target_id: target_id.to_string(),
            }),
            options,
            Box::new(on_finish),
        ))
    }

    /// Drop completed requests from the worker's registry.
    pub fn dispose(
        self: &Arc<Self>,
        worker_name: &str,
        target_ids: Vec<String>,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        let worker = self.worker(worker_name)?;
        Ok(self.submit(
            &worker,
            RequestBody::Dispose(DisposeBody { target_ids }),
            options,
            Box::new(on_finish),
        ))
    }

    // ---- internals ----

    fn worker(&self, name: &str) -> Result<WorkerNode> {
        self.context
            .config
            .worker(name)
            .map_err(|_| Error::UnknownWorker {
                name: name.to_string(),
            })
    }

    fn known_database(&self, name: &str) -> Result<()> {
        ensure!(
            self.context.config.is_known_database(name),
            crate::UnknownDatabaseSnafu { name }
        );
        Ok(())
    }

    fn sql_db_request(
        self: &Arc<Self>,
        worker_name: &str,
        kind: SqlKind,
        database: &str,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        ensure!(
            !database.is_empty(),
            crate::InvalidArgumentSnafu {
                reason: "database must not be empty".to_string(),
            }
        );
        self.sql(
            worker_name,
            SqlBody {
                kind: kind as i32,
                database: database.to_string(),
                tables: vec![],
                query: String::new(),
                user: String::new(),
                spec: String::new(),
            },
            options,
            Box::new(on_finish),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn sql_table_request(
        self: &Arc<Self>,
        worker_name: &str,
        kind: SqlKind,
        database: &str,
        tables: Vec<String>,
        spec: &str,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        self.known_database(database)?;
        ensure!(
            !tables.is_empty(),
            crate::InvalidArgumentSnafu {
                reason: "at least one table is required".to_string(),
            }
        );
        self.sql(
            worker_name,
            SqlBody {
                kind: kind as i32,
                database: database.to_string(),
                tables,
                query: String::new(),
                user: String::new(),
                spec: spec.to_string(),
            },
            options,
            Box::new(on_finish),
        )
    }

    fn sql(
        self: &Arc<Self>,
        worker_name: &str,
        body: SqlBody,
        options: RequestOptions,
        on_finish: Callback,
    ) -> Result<RequestHandle> {
        let worker = self.worker(worker_name)?;
        Ok(self.submit(&worker, RequestBody::Sql(body), options, on_finish))
    }

    fn service(
        self: &Arc<Self>,
        worker_name: &str,
        action: ServiceAction,
        options: RequestOptions,
        on_finish: impl FnOnce(RequestResult) + Send + 'static,
    ) -> Result<RequestHandle> {
        let worker = self.worker(worker_name)?;
        Ok(self.submit(
            &worker,
            RequestBody::Service(ServiceBody {
                action: action as i32,
            }),
            options,
            Box::new(on_finish),
        ))
    }

    /// Register the request and start driving it. This is the single path
    /// every factory method funnels into.
    fn submit(
        self: &Arc<Self>,
        worker: &WorkerNode,
        body: RequestBody,
        options: RequestOptions,
        on_finish: Callback,
    ) -> RequestHandle {
        let id = uuid::Uuid::new_v4().to_string();
        let expiration = options
            .expiration
            .unwrap_or(self.context.config.params().request_expiration);

        let envelope = RequestEnvelope {
            id: id.clone(),
            instance_id: self.context.config.instance_id().to_string(),
            priority: options.priority,
            job_id: options.job_id.unwrap_or_default(),
            expiration_ival_secs: expiration.as_secs() as u32,
            body: Some(body),
        };

        self.in_flight.lock().insert(
            id.clone(),
            InFlight {
                worker: worker.name.clone(),
                callback: Some(on_finish),
                accepted_at: std::time::Instant::now(),
            },
        );
        self.requests_accepted.inc(1);

        let handle = RequestHandle {
            id,
            worker: worker.name.clone(),
        };
        tokio::spawn(Arc::clone(self).drive(handle.clone(), envelope, expiration));
        handle
    }

    async fn drive(
        self: Arc<Self>,
        handle: RequestHandle,
        envelope: RequestEnvelope,
        expiration: Duration,
    ) {
        let result = match self.dispatch(&handle.worker, envelope).await {
            Err(e) => RequestResult::transport_failure(&handle.id, &handle.worker, e.to_string()),
            Ok(mut reply_rx) => {
                if expiration.is_zero() {
                    Self::map_reply(&handle, reply_rx.await)
                } else {
                    tokio::select! {
                        reply = &mut reply_rx => Self::map_reply(&handle, reply),
                        _ = tokio::time::sleep(expiration) => {
                            RequestResult::expired(&handle.id, &handle.worker)
                        }
                    }
                }
            }
        };
        self.complete(result);
    }

    fn map_reply(
        handle: &RequestHandle,
        reply: Result<Result<ResponseEnvelope, TransportError>, oneshot::error::RecvError>,
    ) -> RequestResult {
        match reply {
            Ok(Ok(response)) => RequestResult::from_response(&handle.worker, response),
            Ok(Err(e)) => RequestResult::transport_failure(&handle.id, &handle.worker, e.to_string()),
            Err(_) => RequestResult::transport_failure(
                &handle.id,
                &handle.worker,
                "worker connection lost",
            ),
        }
    }

    /// Hand the envelope to the worker's link, re-dialing a stale link once.
    async fn dispatch(
        &self,
        worker_name: &str,
        envelope: RequestEnvelope,
    ) -> Result<oneshot::Receiver<Result<ResponseEnvelope, TransportError>>, TransportError> {
        for _ in 0..2 {
            let sender = self.link(worker_name)?;
            let (reply_tx, reply_rx) = oneshot::channel();
            match sender
                .send(Dispatch {
                    envelope: envelope.clone(),
                    reply: reply_tx,
                })
                .await
            {
                Ok(()) => return Ok(reply_rx),
                Err(_) => {
                    // The link task is gone; drop it and re-dial.
                    self.links.lock().remove(worker_name);
                }
            }
        }
        Err(TransportError(format!(
            "link to worker '{}' unavailable",
            worker_name
        )))
    }

    fn link(&self, worker_name: &str) -> Result<mpsc::Sender<Dispatch>, TransportError> {
        let mut links = self.links.lock();
        if let Some(sender) = links.get(worker_name) {
            if !sender.is_closed() {
                return Ok(sender.clone());
            }
            links.remove(worker_name);
        }
        let node = self
            .context
            .config
            .worker(worker_name)
            .map_err(|e| TransportError(e.to_string()))?;
        let sender = self
            .link_factory
            .connect(&node.name, &node.host, node.svc_port);
        links.insert(worker_name.to_string(), sender.clone());
        Ok(sender)
    }

    /// Deliver a terminal outcome: pull the entry, then fire its callback
    /// with no lock held. A second completion for the same id finds no
    /// entry and is a no-op.
    fn complete(&self, result: RequestResult) {
        let entry = self.in_flight.lock().remove(&result.id);
        let Some(mut entry) = entry else {
            return;
        };
        debug!(id=%result.id, worker=%entry.worker, status=?result.status, "request finished");
        self.requests_completed.inc(1);
        self.request_latency
            .add_entry(entry.accepted_at.elapsed().as_secs_f64());
        if let Some(callback) = entry.callback.take() {
            callback(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use catalog::{Configuration, MemKv, ServiceParams};
    use data_types::{
        Database, DatabaseFamily, DatabaseStatus, StripingParams, WorkerState,
    };
    use protocol::{EchoResult, ResponseBody, Status};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// What a scripted link does with each dispatch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum MockBehavior {
        /// Answer success, echoing request data where applicable.
        Reply,
        /// Keep the reply channel open and never answer.
        Hold,
        /// Answer with a transport error.
        FailTransport,
    }

    #[derive(Debug)]
    struct MockLinkFactory {
        behavior: MockBehavior,
    }

    impl LinkFactory for MockLinkFactory {
        fn connect(&self, _worker: &str, _host: &str, _port: u16) -> mpsc::Sender<Dispatch> {
            let behavior = self.behavior;
            let (tx, mut rx) = mpsc::channel::<Dispatch>(16);
            tokio::spawn(async move {
                let mut held = vec![];
                while let Some(dispatch) = rx.recv().await {
                    match behavior {
                        MockBehavior::Reply => {
                            let body = match &dispatch.envelope.body {
                                Some(RequestBody::Echo(echo)) => {
                                    Some(ResponseBody::Echo(EchoResult {
                                        data: echo.data.clone(),
                                    }))
                                }
                                _ => None,
                            };
                            let response =
                                ResponseEnvelope::success(dispatch.envelope.id.clone(), body);
                            let _ = dispatch.reply.send(Ok(response));
                        }
                        MockBehavior::Hold => held.push(dispatch.reply),
                        MockBehavior::FailTransport => {
                            let _ = dispatch
                                .reply
                                .send(Err(TransportError("connection reset".to_string())));
                        }
                    }
                }
            });
            tx
        }
    }

    fn test_context() -> ServiceContext {
        let kv = std::sync::Arc::new(MemKv::new());
        let config = Configuration::bootstrap(
            kv,
            ServiceParams {
                instance_id: "test-instance".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        config
            .add_family(&DatabaseFamily {
                name: "production".into(),
                replication_level: 2,
                striping: StripingParams {
                    stripes: 340,
                    sub_stripes: 3,
                    overlap: 0.01667,
                    partitioning_id: 1,
                },
            })
            .unwrap();
        config
            .add_database(&Database {
                name: "sky".into(),
                family: "production".into(),
                status: DatabaseStatus::Ready,
                tables: vec![],
            })
            .unwrap();
        for name in ["w1", "w2"] {
            config
                .add_worker(&data_types::WorkerNode {
                    name: name.into(),
                    host: "127.0.0.1".into(),
                    svc_port: 0,
                    fs_port: 0,
                    data_dir: "/tmp".into(),
                    state: WorkerState::Active,
                })
                .unwrap();
        }
        ServiceContext::new(config)
    }

    fn controller_with(behavior: MockBehavior) -> Arc<Controller> {
        Controller::new_with_link_factory(
            test_context(),
            Box::new(MockLinkFactory { behavior }),
        )
    }

    #[tokio::test]
    async fn callback_fires_exactly_once_and_registry_empties() {
        let controller = controller_with(MockBehavior::Reply);
        let fired = Arc::new(AtomicUsize::new(0));

        let (tx, rx) = oneshot::channel();
        let fired_captured = Arc::clone(&fired);
        let handle = controller
            .echo(
                "w1",
                "hello",
                Duration::ZERO,
                RequestOptions::default(),
                move |result| {
                    fired_captured.fetch_add(1, Ordering::SeqCst);
                    tx.send(result).unwrap();
                },
            )
            .unwrap();
        assert!(controller.is_in_flight(&handle.id));

        let result = rx.await.unwrap();
        assert_eq!(result.status, Status::Success);
        assert_matches!(result.body, Some(ResponseBody::Echo(ref e)) if e.data == "hello");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!controller.is_in_flight(&handle.id));
        assert_eq!(controller.num_in_flight(), 0);
        assert_eq!(controller.request_latency().size(), 1);
    }

    #[tokio::test]
    async fn unanswered_request_expires() {
        let controller = controller_with(MockBehavior::Hold);

        let (tx, rx) = oneshot::channel();
        controller
            .echo(
                "w1",
                "ping",
                Duration::ZERO,
                RequestOptions {
                    expiration: Some(Duration::from_millis(20)),
                    ..Default::default()
                },
                move |result| {
                    tx.send(result).unwrap();
                },
            )
            .unwrap();

        let result = rx.await.unwrap();
        assert_eq!(result.status, Status::Expired);
        assert_eq!(controller.num_in_flight(), 0);
    }

    #[tokio::test]
    async fn transport_failure_completes_the_request() {
        let controller = controller_with(MockBehavior::FailTransport);

        let (tx, rx) = oneshot::channel();
        controller
            .find_all_replicas("w1", "sky", RequestOptions::default(), move |result| {
                tx.send(result).unwrap();
            })
            .unwrap();

        let result = rx.await.unwrap();
        assert_eq!(result.status, Status::Failed);
        assert!(result.message.contains("connection reset"));
        assert_eq!(controller.num_in_flight(), 0);
    }

    #[tokio::test]
    async fn invalid_inputs_are_rejected_before_acceptance() {
        let controller = controller_with(MockBehavior::Reply);

        assert_matches!(
            controller.echo("nope", "x", Duration::ZERO, Default::default(), |_| {}),
            Err(Error::UnknownWorker { .. })
        );
        assert_matches!(
            controller.find_all_replicas("w1", "nope", Default::default(), |_| {}),
            Err(Error::UnknownDatabase { .. })
        );
        assert_matches!(
            controller.replicate("w1", "w1", "sky", 1, Default::default(), |_| {}),
            Err(Error::InvalidArgument { .. })
        );
        assert_eq!(controller.num_in_flight(), 0);
    }
}
