//! The ingest request engine.
//!
//! A contribution is one input file or URL loaded into one `(table, chunk)`
//! of one super-transaction. Each contribution runs a small state machine:
//! VALIDATE the transaction and descriptor, READ the source into a
//! temporary file while applying the CSV dialect, LOAD the file into the
//! transaction's MySQL partition under a named mutex, FINISH by settling
//! the persistent descriptor exactly once. READ failures are retried
//! within the contribution's budget; LOAD failures and cancellations are
//! terminal.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod http;
mod loader;
mod reader;
mod request;
mod service;
mod store;

pub use crate::http::*;
pub use crate::loader::*;
pub use crate::reader::*;
pub use crate::request::*;
pub use crate::service::*;
pub use crate::store::*;

use data_types::{ContributionId, ContributionState, TransactionId, TransactionState};
use snafu::Snafu;

/// Errors refusing an ingest request before (or outside of) processing.
/// Once processing has begun, failures settle into one of the terminal
/// [`ContributionState`]s instead.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("bad source url: {}", source))]
    BadUrl { source: data_types::UrlError },

    #[snafu(display("bad CSV dialect: {}", source))]
    BadDialect { source: data_types::CsvError },

    #[snafu(display("transaction {} does not exist", id))]
    TransactionNotFound { id: TransactionId },

    #[snafu(display("transaction {} is in state {:?}, not STARTED", id, state))]
    TransactionNotStarted {
        id: TransactionId,
        state: TransactionState,
    },

    #[snafu(display("contribution {} does not exist", id))]
    ContributionNotFound { id: ContributionId },

    #[snafu(display(
        "contribution {} already advanced to {:?}; it cannot be processed again",
        id,
        state
    ))]
    AlreadyAdvanced {
        id: ContributionId,
        state: ContributionState,
    },

    #[snafu(display("contribution {} is already being processed", id))]
    AlreadyProcessing { id: ContributionId },

    #[snafu(display(
        "contribution {} has no retries left ({} of {} used)",
        id,
        used,
        budget
    ))]
    RetryBudgetSpent {
        id: ContributionId,
        used: u32,
        budget: u32,
    },

    #[snafu(display("persistent store failure: {}", message))]
    Store { message: String },

    #[snafu(display("named mutex failure: {}", source))]
    Lock { source: locking::Error },
}

/// Convenience result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
