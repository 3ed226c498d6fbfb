//! Per-worker services: the framed-protobuf request server, the
//! file-streaming server, and the chunk file layout they both operate on.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod chunks;
mod file_client;
mod file_server;
mod service;
mod sql;
mod stream_buffer;

pub use chunks::*;
pub use file_client::*;
pub use file_server::*;
pub use service::*;
pub use sql::*;
pub use stream_buffer::*;

use catalog::Configuration;
use snafu::Snafu;
use std::path::PathBuf;
use std::sync::Arc;

/// Errors of the worker services.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("I/O error on '{}': {}", path.display(), source))]
    FileIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("transport error: {}", source))]
    Transport { source: protocol::FrameError },

    #[snafu(display("file server rejected the request: {}", reason))]
    FileRejected { reason: String },

    #[snafu(display("worker '{}' is not known to the configuration", name))]
    UnknownWorker { name: String },
}

/// Convenience result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything a worker-side service needs.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    /// The typed configuration view.
    pub config: Configuration,
    /// This worker's name in the configuration.
    pub worker_name: String,
    /// The directory chunk files live under, one subdirectory per database.
    pub data_dir: PathBuf,
    /// The SQL service the SQL-family and index requests execute against.
    pub sql: Arc<dyn SqlBackend>,
}

impl WorkerContext {
    /// Build the context of one worker; the data directory comes from the
    /// worker's configuration record.
    pub fn new(
        config: Configuration,
        worker_name: impl Into<String>,
        sql: Arc<dyn SqlBackend>,
    ) -> Result<Self> {
        let worker_name = worker_name.into();
        let node = config
            .worker(&worker_name)
            .map_err(|_| Error::UnknownWorker {
                name: worker_name.clone(),
            })?;
        Ok(Self {
            config,
            worker_name,
            data_dir: PathBuf::from(node.data_dir),
            sql,
        })
    }

    /// The instance id of this deployment.
    pub fn instance_id(&self) -> &str {
        self.config.instance_id()
    }

    /// The directory holding one database's chunk files.
    pub fn database_dir(&self, database: &str) -> PathBuf {
        self.data_dir.join(database)
    }
}
