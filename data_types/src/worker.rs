//! Worker node metadata.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Availability of a worker from the placement layer's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// The worker participates in placement and serves requests.
    Active,
    /// The worker is known but excluded from placement.
    Inactive,
    /// Any other state reported by an operator or an external tool.
    Other(String),
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Inactive => write!(f, "INACTIVE"),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

/// A worker node of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerNode {
    /// Unique worker name.
    pub name: String,
    /// Host the worker services listen on.
    pub host: String,
    /// Port of the request service.
    pub svc_port: u16,
    /// Port of the file service.
    pub fs_port: u16,
    /// Directory the worker serves chunk files from.
    pub data_dir: String,
    /// Current availability.
    pub state: WorkerState,
}

impl WorkerNode {
    /// Whether the worker may receive placement work.
    pub fn is_active(&self) -> bool {
        self.state == WorkerState::Active
    }
}
