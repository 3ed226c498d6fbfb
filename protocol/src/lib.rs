//! The wire protocol between the controller, workers and file servers.
//!
//! Every message travels as a 32-bit big-endian length prefix followed by
//! that many bytes of protobuf. The message definitions are maintained by
//! hand in [`messages`] (prost derive macros, no schema compilation step);
//! [`framing`] implements the length-prefixed transport.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod framing;
pub mod messages;

pub use framing::*;
pub use messages::*;
