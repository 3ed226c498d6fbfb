//! Concurrency primitives shared by the placement and ingest layers: the
//! [`ChunkLocker`] serializing chunk mutations across jobs, and a registry
//! of [named mutexes](named_mutex) serializing per-target ingest loads.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod chunk_locker;
mod named_mutex;

pub use chunk_locker::*;
pub use named_mutex::*;

use snafu::Snafu;

/// Errors of this crate.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("owner must not be empty"))]
    EmptyOwner,

    #[snafu(display("mutex name must not be empty"))]
    EmptyName,
}

/// Convenience result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
