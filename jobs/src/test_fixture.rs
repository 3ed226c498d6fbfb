//! Shared fixtures for the scheduler unit tests.

use crate::JobContext;
use catalog::{Configuration, MemKv, ServiceParams};
use controller::{Controller, ServiceContext};
use std::sync::Arc;
use std::time::Duration;

/// A job context whose controller never talks to any worker; good enough
/// for jobs that issue no requests (scheduler tests).
pub(crate) async fn idle_job_context() -> JobContext {
    let kv = Arc::new(MemKv::new());
    let config = Configuration::bootstrap(
        kv,
        ServiceParams {
            instance_id: "test-instance".to_string(),
            job_scheduler_ival: Duration::from_millis(20),
            ..Default::default()
        },
    )
    .expect("bootstrapping test configuration");
    let controller = Controller::new(ServiceContext::new(config));
    JobContext::new(controller)
}
