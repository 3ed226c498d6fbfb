//! The controller: the cluster-wide outbound side of the worker request
//! protocol.
//!
//! One process-wide [`Controller`] owns a registry of in-flight requests and
//! one logical connection per worker. Every factory method follows the same
//! contract: validate, register the request under a fresh unique id, send
//! asynchronously, and deliver the terminal outcome through a one-shot
//! callback exactly once, outside any internal lock.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod context;
mod controller;
mod link;
mod request;

pub use crate::context::*;
pub use crate::controller::*;
pub use crate::link::*;
pub use crate::request::*;

use snafu::Snafu;

/// Errors raised by factory methods before a request is accepted. Once a
/// request has been accepted, all outcomes travel through its callback.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("worker '{}' is not known", name))]
    UnknownWorker { name: String },

    #[snafu(display("database '{}' is not known", name))]
    UnknownDatabase { name: String },

    #[snafu(display("{}", reason))]
    InvalidArgument { reason: String },
}

/// Convenience result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
