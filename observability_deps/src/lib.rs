//! This crate exists to coordinate versions of `tracing` and friends so that
//! the rest of the workspace depends on one consistent set of observability
//! crates.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub use tracing;
