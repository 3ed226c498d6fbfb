//! The explicit service context threaded through constructors.

use catalog::Configuration;
use clock::TimeProvider;
use locking::{ChunkLocker, NamedMutexRegistry};
use std::sync::Arc;

/// Everything a controller-side component needs, carried explicitly instead
/// of living in process-wide singletons.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    /// The typed configuration view.
    pub config: Configuration,
    /// Cross-job chunk ownership.
    pub chunk_locker: Arc<ChunkLocker>,
    /// Per-target load serialization for the ingest engine.
    pub named_mutexes: Arc<NamedMutexRegistry>,
    /// The clock.
    pub time_provider: Arc<dyn TimeProvider>,
    /// Metric registry.
    pub metrics: Arc<metric::Registry>,
}

impl ServiceContext {
    /// Assemble a context around a configuration with fresh ancillary state
    /// and the system clock.
    pub fn new(config: Configuration) -> Self {
        Self {
            config,
            chunk_locker: Arc::new(ChunkLocker::new()),
            named_mutexes: Arc::new(NamedMutexRegistry::new()),
            time_provider: Arc::new(clock::SystemProvider::new()),
            metrics: Arc::new(metric::Registry::new()),
        }
    }

    /// Replace the clock, for tests.
    pub fn with_time_provider(mut self, time_provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = time_provider;
        self
    }
}
