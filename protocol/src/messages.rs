//! Protocol message definitions.
//!
//! The field tags are part of the wire contract; changing them breaks
//! interoperability between controller and worker builds.

use data_types::{Chunk, FileInfo, Replica, ReplicaStatus};

/// Terminal (or in-flight) status of a worker request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Status {
    /// The request completed successfully.
    Success = 0,
    /// The request was malformed or not applicable.
    Bad = 1,
    /// The worker failed to execute the request.
    Failed = 2,
    /// The request exceeded its expiration interval.
    Expired = 3,
    /// The request is still being executed.
    InProgress = 4,
    /// The targeted entity does not exist.
    NotFound = 5,
}

/// Finer-grained failure detail accompanying [`Status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ExtendedStatus {
    /// Nothing to add.
    None = 0,
    /// A request parameter failed validation on the worker.
    InvalidParam = 1,
    /// The database named by the request is not known to the worker.
    UnknownDatabase = 2,
    /// The request carries the instance id of a different deployment.
    ForeignInstance = 3,
    /// A requested file does not exist or cannot be read.
    FileNotFound = 4,
    /// The targeted request id is not (or no longer) known.
    NotFound = 5,
    /// The targeted request was cancelled.
    Cancelled = 6,
    /// A SQL statement failed on the worker.
    SqlError = 7,
}

/// State of a worker service as reported by service-management requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ServiceState {
    /// Accepting and executing requests.
    Running = 0,
    /// Holding new requests in the queue without executing them.
    Suspended = 1,
}

/// Kinds of service-management requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ServiceAction {
    /// Report the service state and queue sizes.
    Status = 0,
    /// Stop executing queued requests.
    Suspend = 1,
    /// Resume executing queued requests.
    Resume = 2,
    /// Drop all queued requests.
    Drain = 3,
}

/// Kinds of SQL requests executed against the worker's database service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SqlKind {
    /// Run a free-form query and return the result set.
    Query = 0,
    /// Create a database.
    CreateDatabase = 1,
    /// Drop a database.
    DeleteDatabase = 2,
    /// Allow user queries against a database.
    EnableDatabase = 3,
    /// Withdraw a database from user queries.
    DisableDatabase = 4,
    /// Grant access to a database to a user.
    GrantAccess = 5,
    /// Create one or many tables.
    CreateTable = 6,
    /// Drop a table.
    DeleteTable = 7,
    /// Apply an `ALTER TABLE` specification to tables.
    AlterTables = 8,
    /// Create indexes on tables.
    CreateIndexes = 9,
    /// Drop indexes from tables.
    DropIndexes = 10,
    /// Remove super-transaction partitions from tables.
    RemoveTablePartitions = 11,
}

/// Replica completeness on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ReplicaState {
    /// All files present.
    Complete = 0,
    /// Files missing or partial.
    Incomplete = 1,
}

/// One file of a replica.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileInfoMsg {
    /// File name relative to the database directory.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Size in bytes.
    #[prost(uint64, tag = "2")]
    pub size: u64,
    /// Modification time, seconds since the UNIX epoch.
    #[prost(int64, tag = "3")]
    pub mtime: i64,
    /// Whether `checksum` was computed.
    #[prost(bool, tag = "4")]
    pub has_checksum: bool,
    /// Control sum over the file content.
    #[prost(uint64, tag = "5")]
    pub checksum: u64,
}

/// One replica as reported by a worker.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplicaInfoMsg {
    /// Database the files belong to.
    #[prost(string, tag = "1")]
    pub database: String,
    /// Chunk number.
    #[prost(uint32, tag = "2")]
    pub chunk: u32,
    /// Worker holding the files.
    #[prost(string, tag = "3")]
    pub worker: String,
    /// Completeness.
    #[prost(enumeration = "ReplicaState", tag = "4")]
    pub state: i32,
    /// When the replica was last verified.
    #[prost(int64, tag = "5")]
    pub verify_time: i64,
    /// Per-file details.
    #[prost(message, repeated, tag = "6")]
    pub files: Vec<FileInfoMsg>,
}

impl ReplicaInfoMsg {
    /// Convert into the catalog representation; the owning family is known
    /// to the caller, not to the worker.
    pub fn into_replica(self, family: &str) -> Replica {
        Replica {
            chunk: Chunk::new(family, self.chunk),
            database: self.database,
            worker: self.worker,
            status: if self.state == ReplicaState::Complete as i32 {
                ReplicaStatus::Complete
            } else {
                ReplicaStatus::Incomplete
            },
            verify_time: self.verify_time,
            files: self
                .files
                .into_iter()
                .map(|f| FileInfo {
                    name: f.name,
                    size: f.size,
                    mtime: f.mtime,
                    checksum: f.has_checksum.then_some(f.checksum),
                })
                .collect(),
        }
    }

    /// Build the wire representation of a replica.
    pub fn from_replica(replica: &Replica) -> Self {
        Self {
            database: replica.database.clone(),
            chunk: replica.chunk.number,
            worker: replica.worker.clone(),
            state: match replica.status {
                ReplicaStatus::Complete => ReplicaState::Complete as i32,
                ReplicaStatus::Incomplete => ReplicaState::Incomplete as i32,
            },
            verify_time: replica.verify_time,
            files: replica
                .files
                .iter()
                .map(|f| FileInfoMsg {
                    name: f.name.clone(),
                    size: f.size,
                    mtime: f.mtime,
                    has_checksum: f.checksum.is_some(),
                    checksum: f.checksum.unwrap_or_default(),
                })
                .collect(),
        }
    }
}

/// Create a replica of a chunk by pulling its files from a source worker.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplicateBody {
    /// Target database.
    #[prost(string, tag = "1")]
    pub database: String,
    /// Chunk number.
    #[prost(uint32, tag = "2")]
    pub chunk: u32,
    /// Name of the worker to pull from.
    #[prost(string, tag = "3")]
    pub source_worker: String,
    /// Host of the source worker's file server.
    #[prost(string, tag = "4")]
    pub source_host: String,
    /// Port of the source worker's file server.
    #[prost(uint32, tag = "5")]
    pub source_fs_port: u32,
}

/// Delete a replica of a chunk.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteBody {
    /// Target database.
    #[prost(string, tag = "1")]
    pub database: String,
    /// Chunk number.
    #[prost(uint32, tag = "2")]
    pub chunk: u32,
}

/// Inspect one replica of a chunk.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindBody {
    /// Target database.
    #[prost(string, tag = "1")]
    pub database: String,
    /// Chunk number.
    #[prost(uint32, tag = "2")]
    pub chunk: u32,
    /// Whether to compute file checksums (slow).
    #[prost(bool, tag = "3")]
    pub compute_checksum: bool,
}

/// Enumerate all replicas of a database held by the worker.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindAllBody {
    /// Target database.
    #[prost(string, tag = "1")]
    pub database: String,
}

/// Liveness probe: the worker echoes `data` back after `delay_ms`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EchoBody {
    /// Payload to echo.
    #[prost(string, tag = "1")]
    pub data: String,
    /// Artificial processing delay, milliseconds.
    #[prost(uint64, tag = "2")]
    pub delay_ms: u64,
}

/// Extract director-index triples from a chunk of a director table.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IndexBody {
    /// Target database.
    #[prost(string, tag = "1")]
    pub database: String,
    /// The director table to extract from.
    #[prost(string, tag = "2")]
    pub director_table: String,
    /// Chunk number.
    #[prost(uint32, tag = "3")]
    pub chunk: u32,
    /// Whether `transaction_id` restricts the extract.
    #[prost(bool, tag = "4")]
    pub has_transaction: bool,
    /// Super-transaction scope.
    #[prost(uint32, tag = "5")]
    pub transaction_id: u32,
}

/// Execute a SQL-family request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SqlBody {
    /// What to execute.
    #[prost(enumeration = "SqlKind", tag = "1")]
    pub kind: i32,
    /// Target database, where applicable.
    #[prost(string, tag = "2")]
    pub database: String,
    /// Target tables, where applicable.
    #[prost(string, repeated, tag = "3")]
    pub tables: Vec<String>,
    /// The query text for [`SqlKind::Query`].
    #[prost(string, tag = "4")]
    pub query: String,
    /// User for `GRANT` and query execution.
    #[prost(string, tag = "5")]
    pub user: String,
    /// Specification string (ALTER clause, index definition, partition id)
    /// interpreted per kind.
    #[prost(string, tag = "6")]
    pub spec: String,
}

/// Manage the worker's request-processing service.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceBody {
    /// The management action to apply.
    #[prost(enumeration = "ServiceAction", tag = "1")]
    pub action: i32,
}

/// Stop an in-progress request on the worker.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopBody {
    /// Identifier of the targeted request.
    #[prost(string, tag = "1")]
    pub target_id: String,
}

/// Inquire about a request on the worker.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusBody {
    /// Identifier of the targeted request.
    #[prost(string, tag = "1")]
    pub target_id: String,
}

/// Drop completed requests from the worker's registry.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DisposeBody {
    /// Identifiers of the targeted requests.
    #[prost(string, repeated, tag = "1")]
    pub target_ids: Vec<String>,
}

/// The request envelope: common attributes plus one typed body.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestEnvelope {
    /// Unique request identifier assigned by the controller.
    #[prost(string, tag = "1")]
    pub id: String,
    /// Instance id of the issuing deployment.
    #[prost(string, tag = "2")]
    pub instance_id: String,
    /// Scheduling priority on the worker.
    #[prost(int32, tag = "3")]
    pub priority: i32,
    /// Identifier of the job the request belongs to, if any.
    #[prost(string, tag = "4")]
    pub job_id: String,
    /// Expiration interval, seconds; zero means no expiration.
    #[prost(uint32, tag = "5")]
    pub expiration_ival_secs: u32,
    /// The typed request body.
    #[prost(
        oneof = "RequestBody",
        tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20"
    )]
    pub body: Option<RequestBody>,
}

/// The typed request bodies.
#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum RequestBody {
    /// Create a replica.
    #[prost(message, tag = "10")]
    Replicate(ReplicateBody),
    /// Delete a replica.
    #[prost(message, tag = "11")]
    Delete(DeleteBody),
    /// Inspect a replica.
    #[prost(message, tag = "12")]
    Find(FindBody),
    /// Enumerate replicas.
    #[prost(message, tag = "13")]
    FindAll(FindAllBody),
    /// Liveness probe.
    #[prost(message, tag = "14")]
    Echo(EchoBody),
    /// Director-index extract.
    #[prost(message, tag = "15")]
    Index(IndexBody),
    /// SQL-family request.
    #[prost(message, tag = "16")]
    Sql(SqlBody),
    /// Service management.
    #[prost(message, tag = "17")]
    Service(ServiceBody),
    /// Stop a request.
    #[prost(message, tag = "18")]
    Stop(StopBody),
    /// Request status inquiry.
    #[prost(message, tag = "19")]
    Status(StatusBody),
    /// Dispose completed requests.
    #[prost(message, tag = "20")]
    Dispose(DisposeBody),
}

/// One `(object id, chunk, sub-chunk)` row of a director-index extract.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IndexRow {
    /// Object identifier.
    #[prost(uint64, tag = "1")]
    pub object_id: u64,
    /// Home chunk of the object.
    #[prost(uint32, tag = "2")]
    pub chunk_id: u32,
    /// Home sub-chunk of the object.
    #[prost(uint32, tag = "3")]
    pub sub_chunk_id: u32,
}

/// One row of a SQL result set.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SqlRow {
    /// Cell values rendered as strings; NULLs as empty strings.
    #[prost(string, repeated, tag = "1")]
    pub cells: Vec<String>,
}

/// Result payload of a replica mutation or inspection.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplicaResult {
    /// The replica after the operation.
    #[prost(message, optional, tag = "1")]
    pub replica: Option<ReplicaInfoMsg>,
}

/// Result payload of a FindAll request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindAllResult {
    /// All replicas of the requested database on the worker.
    #[prost(message, repeated, tag = "1")]
    pub replicas: Vec<ReplicaInfoMsg>,
}

/// Result payload of an Echo request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EchoResult {
    /// The echoed payload.
    #[prost(string, tag = "1")]
    pub data: String,
}

/// Result payload of an Index request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IndexResult {
    /// The extracted rows.
    #[prost(message, repeated, tag = "1")]
    pub rows: Vec<IndexRow>,
}

/// Result payload of a SQL request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SqlResult {
    /// Column names of the result set.
    #[prost(string, repeated, tag = "1")]
    pub columns: Vec<String>,
    /// Rows of the result set.
    #[prost(message, repeated, tag = "2")]
    pub rows: Vec<SqlRow>,
    /// Rows affected by a statement.
    #[prost(uint64, tag = "3")]
    pub affected: u64,
}

/// Result payload of a service-management request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceResult {
    /// The service state after the action.
    #[prost(enumeration = "ServiceState", tag = "1")]
    pub state: i32,
    /// Requests waiting in the queue.
    #[prost(uint32, tag = "2")]
    pub num_queued: u32,
    /// Requests being executed.
    #[prost(uint32, tag = "3")]
    pub num_in_progress: u32,
    /// Completed requests still held for status inquiries.
    #[prost(uint32, tag = "4")]
    pub num_finished: u32,
}

/// Result payload of a status inquiry.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusResult {
    /// Whether the targeted request was found.
    #[prost(bool, tag = "1")]
    pub found: bool,
    /// The state of the targeted request, when found.
    #[prost(enumeration = "Status", tag = "2")]
    pub target_status: i32,
}

/// The response envelope: outcome plus an optional typed payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseEnvelope {
    /// Identifier of the request being answered.
    #[prost(string, tag = "1")]
    pub id: String,
    /// Outcome.
    #[prost(int32, tag = "2")]
    pub status: i32,
    /// Failure detail.
    #[prost(int32, tag = "3")]
    pub extended_status: i32,
    /// Human-readable error context, empty on success.
    #[prost(string, tag = "4")]
    pub message: String,
    /// The typed result.
    #[prost(oneof = "ResponseBody", tags = "10, 11, 12, 13, 14, 15, 16")]
    pub body: Option<ResponseBody>,
}

/// The typed response bodies.
#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum ResponseBody {
    /// Replica mutation or inspection result.
    #[prost(message, tag = "10")]
    Replica(ReplicaResult),
    /// FindAll result.
    #[prost(message, tag = "11")]
    FindAll(FindAllResult),
    /// Echo result.
    #[prost(message, tag = "12")]
    Echo(EchoResult),
    /// Index result.
    #[prost(message, tag = "13")]
    Index(IndexResult),
    /// SQL result.
    #[prost(message, tag = "14")]
    Sql(SqlResult),
    /// Service-management result.
    #[prost(message, tag = "15")]
    Service(ServiceResult),
    /// Status-inquiry result.
    #[prost(message, tag = "16")]
    Status(StatusResult),
}

impl ResponseEnvelope {
    /// A success response carrying `body`.
    pub fn success(id: impl Into<String>, body: Option<ResponseBody>) -> Self {
        Self {
            id: id.into(),
            status: Status::Success as i32,
            extended_status: ExtendedStatus::None as i32,
            message: String::new(),
            body,
        }
    }

    /// An error response.
    pub fn error(
        id: impl Into<String>,
        status: Status,
        extended_status: ExtendedStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            status: status as i32,
            extended_status: extended_status as i32,
            message: message.into(),
            body: None,
        }
    }

    /// The decoded status.
    pub fn status(&self) -> Status {
        Status::from_i32(self.status).unwrap_or(Status::Failed)
    }

    /// The decoded extended status.
    pub fn extended_status(&self) -> ExtendedStatus {
        ExtendedStatus::from_i32(self.extended_status).unwrap_or(ExtendedStatus::None)
    }
}

/// Ask a file server for one file of a database.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileRequest {
    /// Database the file belongs to.
    #[prost(string, tag = "1")]
    pub database: String,
    /// File name relative to the database directory.
    #[prost(string, tag = "2")]
    pub file: String,
    /// Whether the raw content should follow the response.
    #[prost(bool, tag = "3")]
    pub send_content: bool,
    /// Instance id of the requesting deployment.
    #[prost(string, tag = "4")]
    pub instance_id: String,
}

/// A file server's answer; raw bytes follow if `available` and the request
/// asked for content.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileResponse {
    /// Whether the file exists and is readable.
    #[prost(bool, tag = "1")]
    pub available: bool,
    /// File size in bytes.
    #[prost(uint64, tag = "2")]
    pub size: u64,
    /// Modification time, seconds since the UNIX epoch.
    #[prost(int64, tag = "3")]
    pub mtime: i64,
    /// Set when the request carried a foreign instance id.
    #[prost(bool, tag = "4")]
    pub foreign_instance: bool,
}
