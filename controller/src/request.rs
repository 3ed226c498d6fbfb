//! In-flight request bookkeeping and terminal outcomes.

use protocol::{ExtendedStatus, ResponseBody, ResponseEnvelope, Status};
use std::time::Duration;

/// Per-request send options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Scheduling priority on the worker.
    pub priority: i32,
    /// Identifier of the owning job, carried for diagnostics and worker-side
    /// bookkeeping.
    pub job_id: Option<String>,
    /// Bound on the request lifetime; `None` applies the configured default,
    /// `Some(Duration::ZERO)` disables expiration.
    pub expiration: Option<Duration>,
}

/// The terminal outcome of a request, delivered through its callback.
#[derive(Debug)]
pub struct RequestResult {
    /// The request id the outcome belongs to.
    pub id: String,
    /// The worker the request was sent to.
    pub worker: String,
    /// Terminal status.
    pub status: Status,
    /// Failure detail reported by the worker.
    pub extended_status: ExtendedStatus,
    /// Error context, empty on success.
    pub message: String,
    /// The typed response payload, if the worker sent one.
    pub body: Option<ResponseBody>,
}

impl RequestResult {
    /// Whether the request succeeded.
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub(crate) fn from_response(worker: &str, response: ResponseEnvelope) -> Self {
        Self {
            id: response.id.clone(),
            worker: worker.to_string(),
            status: response.status(),
            extended_status: response.extended_status(),
            message: response.message,
            body: response.body,
        }
    }

    pub(crate) fn transport_failure(id: &str, worker: &str, message: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            worker: worker.to_string(),
            status: Status::Failed,
            extended_status: ExtendedStatus::None,
            message: message.into(),
            body: None,
        }
    }

    pub(crate) fn expired(id: &str, worker: &str) -> Self {
        Self {
            id: id.to_string(),
            worker: worker.to_string(),
            status: Status::Expired,
            extended_status: ExtendedStatus::None,
            message: "request expiration interval elapsed".to_string(),
            body: None,
        }
    }
}

/// The callback slot of an in-flight request. Taken out (moved) before
/// invocation, so a callback can fire at most once and no cycle between the
/// registry and the closure survives completion.
pub(crate) type Callback = Box<dyn FnOnce(RequestResult) + Send>;

/// A lightweight handle identifying an accepted request.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    /// The unique request id.
    pub id: String,
    /// The worker the request was sent to.
    pub worker: String,
}
