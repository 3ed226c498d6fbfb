//! Shared value types of the replica management and ingest plane.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod chunk;
mod contribution;
mod csv;
mod database;
mod replica;
mod transaction;
mod url;
mod worker;

pub use crate::chunk::*;
pub use crate::contribution::*;
pub use crate::csv::*;
pub use crate::database::*;
pub use crate::replica::*;
pub use crate::transaction::*;
pub use crate::url::*;
pub use crate::worker::*;
