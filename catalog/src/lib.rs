//! The catalog: a slash-separated key-value tree holding cluster metadata,
//! and a typed configuration view over it.
//!
//! The tree is the authority for databases, tables, partitioning parameters
//! and worker nodes. Some subtrees are stored packed as a single JSON blob;
//! readers merge packed and unpacked children transparently.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod config;
mod kv;

pub use config::*;
pub use kv::*;

use snafu::Snafu;

/// The catalog schema version this reader is built for. A tree reporting a
/// different `/css_meta/version` cannot be interpreted.
pub const CATALOG_VERSION: i32 = 15;

/// Errors of catalog access.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("key '{}' does not exist", key))]
    KeyNotFound { key: String },

    #[snafu(display("key '{}' already exists", key))]
    KeyExists { key: String },

    #[snafu(display("the catalog was opened read-only; cannot modify key '{}'", key))]
    ReadOnly { key: String },

    #[snafu(display(
        "catalog version mismatch: reader supports {}, tree reports '{}'",
        expected,
        actual
    ))]
    VersionMismatch { expected: i32, actual: String },

    #[snafu(display("malformed value at key '{}': {}", key, source))]
    MalformedValue {
        key: String,
        source: serde_json::Error,
    },

    #[snafu(display("worker '{}' is not known", name))]
    UnknownWorker { name: String },

    #[snafu(display("database '{}' is not known", name))]
    UnknownDatabase { name: String },

    #[snafu(display("database family '{}' is not known", name))]
    UnknownFamily { name: String },
}

/// Convenience result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
