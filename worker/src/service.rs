//! The per-worker request server.
//!
//! One connection-handling task per accepted connection; each framed
//! request is processed by its own task and answered whenever it finishes,
//! so responses may interleave freely on the connection (the controller
//! routes them by request id). A registry of request slots supports the
//! Stop/Status/Dispose control requests and the service-management family.

use crate::{chunk_file_name, fetch_file, scan_database_dir, WorkerContext};
use data_types::{Database, TablePartitioning};
use observability_deps::tracing::{debug, error, info, warn};
use parking_lot::Mutex;
use protocol::{
    read_frame, write_frame, DeleteBody, DisposeBody, EchoBody, EchoResult, ExtendedStatus,
    FileInfoMsg, FindAllBody, FindAllResult, FindBody, IndexBody, IndexResult, IndexRow,
    ReplicaInfoMsg, ReplicaResult, ReplicaState, ReplicateBody, RequestBody, RequestEnvelope,
    ResponseBody, ResponseEnvelope, ServiceAction, ServiceBody, ServiceResult, ServiceState,
    SqlBody, SqlKind, SqlResult, SqlRow, Status, StatusBody, StatusResult, StopBody,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// One tracked request on the worker.
#[derive(Debug)]
struct RequestSlot {
    status: Status,
    cancel: CancellationToken,
}

/// State shared by every connection of one worker service.
#[derive(Debug)]
struct Shared {
    registry: Mutex<HashMap<String, RequestSlot>>,
    suspended: watch::Sender<bool>,
    num_queued: AtomicU32,
}

impl Shared {
    fn new() -> Self {
        let (suspended, _) = watch::channel(false);
        Self {
            registry: Mutex::new(HashMap::new()),
            suspended,
            num_queued: AtomicU32::new(0),
        }
    }

    fn counts(&self) -> (u32, u32, u32) {
        let registry = self.registry.lock();
        let in_progress = registry
            .values()
            .filter(|slot| slot.status == Status::InProgress)
            .count() as u32;
        let finished = registry.len() as u32 - in_progress;
        (self.num_queued.load(Ordering::Relaxed), in_progress, finished)
    }
}

/// The worker request server.
#[derive(Debug)]
pub struct WorkerServer {
    context: WorkerContext,
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl WorkerServer {
    /// Bind the server.
    pub async fn bind(context: WorkerContext, address: SocketAddr) -> crate::Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| crate::Error::FileIo {
                path: std::path::PathBuf::from(address.to_string()),
                source: e,
            })?;
        Ok(Self {
            context,
            listener,
            shared: Arc::new(Shared::new()),
        })
    }

    /// The address the server actually listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("bound listener")
    }

    /// Accept and serve connections until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(worker=%self.context.worker_name, addr=%self.local_addr(), "request server started");
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.cancelled() => {
                    info!(worker=%self.context.worker_name, "request server shutdown");
                    return;
                }
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "request connection accepted");
                    let context = self.context.clone();
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(serve_connection(context, shared, stream));
                }
                Err(e) => {
                    error!(error=%e, "request server accept failed");
                }
            }
        }
    }
}

async fn serve_connection(context: WorkerContext, shared: Arc<Shared>, stream: TcpStream) {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));
    let limit = context.config.params().request_buf_size;

    loop {
        let envelope: RequestEnvelope = match read_frame(&mut reader, limit).await {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error=%e, "request connection closed");
                return;
            }
        };
        let context = context.clone();
        let shared = Arc::clone(&shared);
        let writer = Arc::clone(&writer);
        tokio::spawn(async move {
            let response = process(context, shared, envelope).await;
            let mut writer = writer.lock().await;
            if let Err(e) = write_frame(&mut *writer, &response).await {
                warn!(id=%response.id, error=%e, "response send failed");
            }
        });
    }
}

/// Validate, register, execute, settle the slot, and build the response.
async fn process(
    context: WorkerContext,
    shared: Arc<Shared>,
    envelope: RequestEnvelope,
) -> ResponseEnvelope {
    let id = envelope.id.clone();

    if envelope.instance_id != context.instance_id() {
        return ResponseEnvelope::error(
            id,
            Status::Bad,
            ExtendedStatus::ForeignInstance,
            format!(
                "request from instance '{}', this worker belongs to '{}'",
                envelope.instance_id,
                context.instance_id()
            ),
        );
    }
    let Some(body) = envelope.body else {
        return ResponseEnvelope::error(
            id,
            Status::Bad,
            ExtendedStatus::InvalidParam,
            "request body missing",
        );
    };

    // Control requests bypass the suspension gate and the registry.
    let body = match body {
        RequestBody::Service(service) => return handle_service(&shared, &id, service),
        RequestBody::Stop(stop) => return handle_stop(&shared, &id, stop),
        RequestBody::Status(status) => return handle_status(&shared, &id, status),
        RequestBody::Dispose(dispose) => return handle_dispose(&shared, &id, dispose),
        work => work,
    };

    // Work requests wait while the service is suspended.
    let mut suspended = shared.suspended.subscribe();
    if *suspended.borrow() {
        shared.num_queued.fetch_add(1, Ordering::Relaxed);
        while *suspended.borrow() {
            if suspended.changed().await.is_err() {
                break;
            }
        }
        shared.num_queued.fetch_sub(1, Ordering::Relaxed);
    }

    let cancel = CancellationToken::new();
    shared.registry.lock().insert(
        id.clone(),
        RequestSlot {
            status: Status::InProgress,
            cancel: cancel.clone(),
        },
    );

    let response = match body {
        RequestBody::Echo(echo) => handle_echo(&id, echo, &cancel).await,
        RequestBody::FindAll(find_all) => handle_find_all(&context, &id, find_all).await,
        RequestBody::Find(find) => handle_find(&context, &id, find).await,
        RequestBody::Replicate(replicate) => {
            handle_replicate(&context, &id, replicate, &cancel).await
        }
        RequestBody::Delete(delete) => handle_delete(&context, &id, delete).await,
        RequestBody::Index(index) => handle_index(&context, &id, index).await,
        RequestBody::Sql(sql) => handle_sql(&context, &id, sql).await,
        RequestBody::Service(_)
        | RequestBody::Stop(_)
        | RequestBody::Status(_)
        | RequestBody::Dispose(_) => unreachable!("control requests are handled above"),
    };

    if let Some(slot) = shared.registry.lock().get_mut(&id) {
        slot.status = response.status();
    }
    response
}

// ---- control requests ----

fn handle_service(shared: &Shared, id: &str, service: ServiceBody) -> ResponseEnvelope {
    match ServiceAction::from_i32(service.action) {
        Some(ServiceAction::Status) => {}
        Some(ServiceAction::Suspend) => {
            // send_replace updates the value even while no work request is
            // subscribed.
            shared.suspended.send_replace(true);
        }
        Some(ServiceAction::Resume) => {
            shared.suspended.send_replace(false);
        }
        Some(ServiceAction::Drain) => {
            for slot in shared.registry.lock().values() {
                if slot.status == Status::InProgress {
                    slot.cancel.cancel();
                }
            }
        }
        None => {
            return ResponseEnvelope::error(
                id,
                Status::Bad,
                ExtendedStatus::InvalidParam,
                "unknown service action",
            )
        }
    }
    let (num_queued, num_in_progress, num_finished) = shared.counts();
    let state = if *shared.suspended.borrow() {
        ServiceState::Suspended
    } else {
        ServiceState::Running
    };
    ResponseEnvelope::success(
        id,
        Some(ResponseBody::Service(ServiceResult {
            state: state as i32,
            num_queued,
            num_in_progress,
            num_finished,
        })),
    )
}

fn handle_stop(shared: &Shared, id: &str, stop: StopBody) -> ResponseEnvelope {
    let registry = shared.registry.lock();
    match registry.get(&stop.target_id) {
        Some(slot) => {
            if slot.status == Status::InProgress {
                slot.cancel.cancel();
            }
            ResponseEnvelope::success(id, None)
        }
        // Stopping an unknown request deliberately succeeds with a
        // not-found extended status.
        None => {
            let mut response = ResponseEnvelope::success(id, None);
            response.extended_status = ExtendedStatus::NotFound as i32;
            response
        }
    }
}

fn handle_status(shared: &Shared, id: &str, status: StatusBody) -> ResponseEnvelope {
    let registry = shared.registry.lock();
    match registry.get(&status.target_id) {
        Some(slot) => ResponseEnvelope::success(
            id,
            Some(ResponseBody::Status(StatusResult {
                found: true,
                target_status: slot.status as i32,
            })),
        ),
        None => {
            let mut response = ResponseEnvelope::success(
                id,
                Some(ResponseBody::Status(StatusResult {
                    found: false,
                    target_status: Status::NotFound as i32,
                })),
            );
            response.extended_status = ExtendedStatus::NotFound as i32;
            response
        }
    }
}

fn handle_dispose(shared: &Shared, id: &str, dispose: DisposeBody) -> ResponseEnvelope {
    let mut registry = shared.registry.lock();
    for target in &dispose.target_ids {
        if let Some(slot) = registry.get(target) {
            if slot.status != Status::InProgress {
                registry.remove(target);
            }
        }
    }
    ResponseEnvelope::success(id, None)
}

// ---- work requests ----

async fn handle_echo(id: &str, echo: EchoBody, cancel: &CancellationToken) -> ResponseEnvelope {
    if echo.delay_ms > 0 {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(echo.delay_ms)) => {}
            _ = cancel.cancelled() => {
                return ResponseEnvelope::error(
                    id,
                    Status::Failed,
                    ExtendedStatus::Cancelled,
                    "request stopped",
                );
            }
        }
    }
    ResponseEnvelope::success(id, Some(ResponseBody::Echo(EchoResult { data: echo.data })))
}

/// Look up the database record, or answer the standard rejection.
fn known_database(context: &WorkerContext, id: &str, database: &str) -> Result<Database, ResponseEnvelope> {
    context.config.database(database).map_err(|_| {
        ResponseEnvelope::error(
            id,
            Status::Bad,
            ExtendedStatus::UnknownDatabase,
            format!("unknown database '{}'", database),
        )
    })
}

fn replica_msg(
    context: &WorkerContext,
    database: &str,
    chunk: u32,
    complete: bool,
    files: Vec<data_types::FileInfo>,
    verify_time: i64,
) -> ReplicaInfoMsg {
    ReplicaInfoMsg {
        database: database.to_string(),
        chunk,
        worker: context.worker_name.clone(),
        state: if complete {
            ReplicaState::Complete as i32
        } else {
            ReplicaState::Incomplete as i32
        },
        verify_time,
        files: files
            .into_iter()
            .map(|f| FileInfoMsg {
                name: f.name,
                size: f.size,
                mtime: f.mtime,
                has_checksum: f.checksum.is_some(),
                checksum: f.checksum.unwrap_or_default(),
            })
            .collect(),
    }
}

/// Whether a chunk's file set covers every partitioned table of the database.
fn is_complete(database: &Database, files: &[data_types::FileInfo]) -> bool {
    database
        .tables
        .iter()
        .filter(|t| t.is_partitioned())
        .all(|t| {
            files
                .iter()
                .any(|f| crate::parse_chunk_file(&f.name).map(|(table, _, overlap)| table == t.name && !overlap).unwrap_or(false))
        })
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

async fn handle_find_all(
    context: &WorkerContext,
    id: &str,
    body: FindAllBody,
) -> ResponseEnvelope {
    let database = match known_database(context, id, &body.database) {
        Ok(database) => database,
        Err(response) => return response,
    };
    let dir = context.database_dir(&body.database);
    match scan_database_dir(&dir, false).await {
        Ok(chunks) => {
            let verify_time = now_secs();
            let replicas = chunks
                .into_iter()
                .map(|(chunk, files)| {
                    let complete = is_complete(&database, &files);
                    replica_msg(context, &body.database, chunk, complete, files, verify_time)
                })
                .collect();
            ResponseEnvelope::success(
                id,
                Some(ResponseBody::FindAll(FindAllResult { replicas })),
            )
        }
        Err(e) => ResponseEnvelope::error(id, Status::Failed, ExtendedStatus::None, e.to_string()),
    }
}

async fn handle_find(context: &WorkerContext, id: &str, body: FindBody) -> ResponseEnvelope {
    let database = match known_database(context, id, &body.database) {
        Ok(database) => database,
        Err(response) => return response,
    };
    let dir = context.database_dir(&body.database);
    let chunks = match scan_database_dir(&dir, body.compute_checksum).await {
        Ok(chunks) => chunks,
        Err(e) => {
            return ResponseEnvelope::error(id, Status::Failed, ExtendedStatus::None, e.to_string())
        }
    };
    match chunks.into_iter().find(|(chunk, _)| *chunk == body.chunk) {
        None => ResponseEnvelope::error(
            id,
            Status::NotFound,
            ExtendedStatus::FileNotFound,
            format!("no replica of chunk {} here", body.chunk),
        ),
        Some((chunk, files)) => {
            let complete = is_complete(&database, &files);
            let replica =
                replica_msg(context, &body.database, chunk, complete, files, now_secs());
            ResponseEnvelope::success(
                id,
                Some(ResponseBody::Replica(ReplicaResult {
                    replica: Some(replica),
                })),
            )
        }
    }
}

async fn handle_replicate(
    context: &WorkerContext,
    id: &str,
    body: ReplicateBody,
    cancel: &CancellationToken,
) -> ResponseEnvelope {
    let database = match known_database(context, id, &body.database) {
        Ok(database) => database,
        Err(response) => return response,
    };
    let dir = context.database_dir(&body.database);
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        return ResponseEnvelope::error(id, Status::Failed, ExtendedStatus::None, e.to_string());
    }
    let source = format!("{}:{}", body.source_host, body.source_fs_port);
    let instance_id = context.instance_id();

    let mut files = vec![];
    for table in database.tables.iter().filter(|t| t.is_partitioned()) {
        // Overlap files are optional on the source; main files are not.
        let wanted = match &table.partitioning {
            TablePartitioning::Partitioned(_) => vec![false, true],
            _ => vec![false],
        };
        for overlap in wanted {
            let name = chunk_file_name(&table.name, body.chunk, overlap);
            let dest = dir.join(&name);
            let fetched = tokio::select! {
                fetched = fetch_file(&source, instance_id, &body.database, &name, &dest) => fetched,
                _ = cancel.cancelled() => {
                    return ResponseEnvelope::error(
                        id,
                        Status::Failed,
                        ExtendedStatus::Cancelled,
                        "replication stopped",
                    );
                }
            };
            match fetched {
                Ok(Some(file)) => files.push(data_types::FileInfo {
                    name,
                    size: file.size,
                    mtime: file.mtime,
                    checksum: None,
                }),
                Ok(None) if overlap => {}
                Ok(None) => {
                    return ResponseEnvelope::error(
                        id,
                        Status::Failed,
                        ExtendedStatus::FileNotFound,
                        format!("source worker '{}' has no file '{}'", body.source_worker, name),
                    );
                }
                Err(e) => {
                    return ResponseEnvelope::error(
                        id,
                        Status::Failed,
                        ExtendedStatus::None,
                        e.to_string(),
                    );
                }
            }
        }
    }

    let complete = is_complete(&database, &files);
    let replica = replica_msg(context, &body.database, body.chunk, complete, files, now_secs());
    ResponseEnvelope::success(
        id,
        Some(ResponseBody::Replica(ReplicaResult {
            replica: Some(replica),
        })),
    )
}

async fn handle_delete(context: &WorkerContext, id: &str, body: DeleteBody) -> ResponseEnvelope {
    if let Err(response) = known_database(context, id, &body.database) {
        return response;
    }
    let dir = context.database_dir(&body.database);
    let chunks = match scan_database_dir(&dir, false).await {
        Ok(chunks) => chunks,
        Err(e) => {
            return ResponseEnvelope::error(id, Status::Failed, ExtendedStatus::None, e.to_string())
        }
    };
    let Some(files) = chunks.get(&body.chunk) else {
        return ResponseEnvelope::error(
            id,
            Status::NotFound,
            ExtendedStatus::FileNotFound,
            format!("no replica of chunk {} here", body.chunk),
        );
    };
    for file in files {
        if let Err(e) = tokio::fs::remove_file(dir.join(&file.name)).await {
            return ResponseEnvelope::error(id, Status::Failed, ExtendedStatus::None, e.to_string());
        }
    }
    ResponseEnvelope::success(id, None)
}

async fn handle_index(context: &WorkerContext, id: &str, body: IndexBody) -> ResponseEnvelope {
    let database = match known_database(context, id, &body.database) {
        Ok(database) => database,
        Err(response) => return response,
    };
    let Some(table) = database.table(&body.director_table) else {
        return ResponseEnvelope::error(
            id,
            Status::Bad,
            ExtendedStatus::InvalidParam,
            format!("unknown table '{}'", body.director_table),
        );
    };
    let TablePartitioning::Partitioned(params) = &table.partitioning else {
        return ResponseEnvelope::error(
            id,
            Status::Bad,
            ExtendedStatus::InvalidParam,
            format!("table '{}' is not partitioned", body.director_table),
        );
    };

    let mut sql = format!(
        "SELECT {}, subChunkId FROM {}.{}",
        quote_id(&params.dir_col),
        quote_id(&body.database),
        quote_id(&format!("{}_{}", body.director_table, body.chunk)),
    );
    if body.has_transaction {
        sql.push_str(&format!(" WHERE qserv_trans_id = {}", body.transaction_id));
    }

    match context.sql.query(&sql).await {
        Err(e) => ResponseEnvelope::error(id, Status::Failed, ExtendedStatus::SqlError, e),
        Ok(result) => {
            let rows = result
                .rows
                .iter()
                .filter_map(|cells| {
                    let object_id = cells.first()?.parse::<u64>().ok()?;
                    let sub_chunk_id = cells.get(1)?.parse::<u32>().ok()?;
                    Some(IndexRow {
                        object_id,
                        chunk_id: body.chunk,
                        sub_chunk_id,
                    })
                })
                .collect();
            ResponseEnvelope::success(id, Some(ResponseBody::Index(IndexResult { rows })))
        }
    }
}

async fn handle_sql(context: &WorkerContext, id: &str, body: SqlBody) -> ResponseEnvelope {
    let statements = match build_sql_statements(&body) {
        Ok(statements) => statements,
        Err(reason) => {
            return ResponseEnvelope::error(id, Status::Bad, ExtendedStatus::InvalidParam, reason)
        }
    };

    if SqlKind::from_i32(body.kind) == Some(SqlKind::Query) {
        return match context.sql.query(&body.query).await {
            Err(e) => ResponseEnvelope::error(id, Status::Failed, ExtendedStatus::SqlError, e),
            Ok(result) => ResponseEnvelope::success(
                id,
                Some(ResponseBody::Sql(SqlResult {
                    columns: result.columns,
                    rows: result
                        .rows
                        .into_iter()
                        .map(|cells| SqlRow { cells })
                        .collect(),
                    affected: result.affected,
                })),
            ),
        };
    }

    let mut affected = 0;
    for statement in &statements {
        match context.sql.execute(statement).await {
            Ok(n) => affected += n,
            Err(e) => {
                return ResponseEnvelope::error(id, Status::Failed, ExtendedStatus::SqlError, e)
            }
        }
    }
    ResponseEnvelope::success(
        id,
        Some(ResponseBody::Sql(SqlResult {
            columns: vec![],
            rows: vec![],
            affected,
        })),
    )
}

/// Render the statements of a SQL-family request.
fn build_sql_statements(body: &SqlBody) -> Result<Vec<String>, String> {
    let db = || quote_id(&body.database);
    let per_table = |f: &dyn Fn(&str) -> String| -> Vec<String> {
        body.tables.iter().map(|t| f(t)).collect()
    };

    let statements = match SqlKind::from_i32(body.kind) {
        Some(SqlKind::Query) => vec![],
        Some(SqlKind::CreateDatabase) => {
            vec![format!("CREATE DATABASE IF NOT EXISTS {}", db())]
        }
        Some(SqlKind::DeleteDatabase) => {
            vec![format!("DROP DATABASE IF EXISTS {}", db())]
        }
        // The worker inventory table advertises which databases user
        // queries may touch.
        Some(SqlKind::EnableDatabase) => vec![format!(
            "INSERT IGNORE INTO qservw_worker.Dbs (db) VALUES ('{}')",
            body.database.replace('\'', "''")
        )],
        Some(SqlKind::DisableDatabase) => vec![format!(
            "DELETE FROM qservw_worker.Dbs WHERE db = '{}'",
            body.database.replace('\'', "''")
        )],
        Some(SqlKind::GrantAccess) => vec![format!(
            "GRANT ALL ON {}.* TO '{}'@'%'",
            db(),
            body.user.replace('\'', "''")
        )],
        Some(SqlKind::CreateTable) => per_table(&|t| {
            format!("CREATE TABLE IF NOT EXISTS {}.{} {}", db(), quote_id(t), body.spec)
        }),
        Some(SqlKind::DeleteTable) => {
            per_table(&|t| format!("DROP TABLE IF EXISTS {}.{}", db(), quote_id(t)))
        }
        Some(SqlKind::AlterTables) => {
            per_table(&|t| format!("ALTER TABLE {}.{} {}", db(), quote_id(t), body.spec))
        }
        Some(SqlKind::CreateIndexes) => {
            per_table(&|t| format!("ALTER TABLE {}.{} ADD INDEX {}", db(), quote_id(t), body.spec))
        }
        Some(SqlKind::DropIndexes) => {
            per_table(&|t| format!("ALTER TABLE {}.{} DROP INDEX {}", db(), quote_id(t), body.spec))
        }
        Some(SqlKind::RemoveTablePartitions) => per_table(&|t| {
            format!("ALTER TABLE {}.{} DROP PARTITION p{}", db(), quote_id(t), body.spec)
        }),
        None => return Err("unknown SQL request kind".to_string()),
    };
    Ok(statements)
}

/// Backtick-quote a SQL identifier.
fn quote_id(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}
