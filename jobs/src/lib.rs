//! High-level replica management: the job controller (a cooperative
//! scheduler) and the placement jobs it runs.
//!
//! Every job is a state machine over many worker requests issued through
//! the [`controller::Controller`]: it reads the current replica view,
//! computes a plan, fans the plan out as requests, folds the completions
//! back in, and settles with a per-chunk result table. Chunks being mutated
//! are claimed in the cluster-wide [`locking::ChunkLocker`] for the
//! duration of the mutation.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod common;
mod controller_loop;
mod delete_worker;
mod director_index;
mod find_all;
mod fix_up;
mod purge;
mod rebalance;
mod replica_view;
mod replicate;
mod verify;

#[cfg(test)]
pub(crate) mod test_fixture;

pub use crate::common::*;
pub use crate::controller_loop::*;
pub use crate::delete_worker::*;
pub use crate::director_index::*;
pub use crate::find_all::*;
pub use crate::fix_up::*;
pub use crate::purge::*;
pub use crate::rebalance::*;
pub use crate::replica_view::*;
pub use crate::replicate::*;
pub use crate::verify::*;
