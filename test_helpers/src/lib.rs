//! Shared helpers for tests across the workspace.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(clippy::explicit_iter_loop, clippy::use_self, clippy::clone_on_ref_ptr)]

use observability_deps::tracing;
use parking_lot::Once;
use std::io::Write;

static LOG_SETUP: Once = Once::new();

/// Enables debug logging if the RUST_LOG environment variable is set.
/// Safe to call from every test; initialization happens once.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Enables debug logging regardless of the RUST_LOG environment variable.
pub fn start_logging() {
    LOG_SETUP.call_once(|| {
        tracing_log::LogTracer::init().expect("log tracer init");
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("subscriber setup");
    });
}

/// A temporary file pre-filled with `contents`, removed on drop.
pub fn make_temp_file<C: AsRef<[u8]>>(contents: C) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("creating temp file");
    file.write_all(contents.as_ref()).expect("writing temp file");
    file.flush().expect("flushing temp file");
    file
}

pub use tempfile::TempDir;

/// A temporary directory removed on drop.
pub fn tmp_dir() -> std::io::Result<TempDir> {
    let _ = std::fs::create_dir_all("/tmp");
    tempfile::Builder::new().prefix("replica").tempdir()
}
