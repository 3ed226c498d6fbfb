//! Ingest contribution descriptors.

use crate::csv::CsvDialect;
use crate::transaction::TransactionId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an ingest contribution.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ContributionId(u64);

impl ContributionId {
    /// Wrap a raw identifier.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw identifier.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContributionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Processing state of a contribution.
///
/// `InProgress` is left exactly once; all other states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContributionState {
    /// Accepted and being processed (or queued for a retry).
    InProgress,
    /// Reading or preprocessing the input failed and the retry budget is spent.
    ReadFailed,
    /// Loading into MySQL failed. Never retried.
    LoadFailed,
    /// Cancelled by the client before reaching a terminal state.
    Cancelled,
    /// Loaded successfully.
    Finished,
}

impl ContributionState {
    /// Whether the state can never change again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// HTTP method used to pull a remote contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        };
        write!(f, "{}", s)
    }
}

/// One input file (or URL) loaded into one `(table, chunk)` within one
/// super-transaction.
///
/// The authoritative copy of this descriptor lives in the catalog database;
/// the in-memory copy held by the ingest engine is kept in lock-step with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestContribution {
    /// Contribution identifier.
    pub id: ContributionId,
    /// The super-transaction the contribution belongs to.
    pub transaction_id: TransactionId,
    /// Target database.
    pub database: String,
    /// Target table.
    pub table: String,
    /// Target chunk number.
    pub chunk: u32,
    /// Whether the overlap table of the chunk is the target.
    pub is_overlap: bool,
    /// Source location (`file://`, `http://` or `https://`).
    pub url: String,
    /// Character set the rows are encoded in.
    pub charset: String,
    /// CSV dialect of the input.
    pub dialect: CsvDialect,
    /// HTTP method for remote sources.
    pub http_method: HttpMethod,
    /// Optional HTTP request body for remote sources.
    pub http_data: Option<String>,
    /// Extra HTTP headers for remote sources.
    pub http_headers: Vec<(String, String)>,
    /// Cap on the number of MySQL warnings retained.
    pub max_num_warnings: u32,
    /// Retry budget for READ-stage failures.
    pub max_retries: u32,

    /// Processing state.
    pub state: ContributionState,
    /// MySQL warnings observed by the load.
    pub num_warnings: u64,
    /// Rows read from the input.
    pub num_rows: u64,
    /// Bytes read from the input.
    pub num_bytes: u64,
    /// READ-stage retries performed so far.
    pub num_retries: u32,
    /// Error message of the last failure, if any.
    pub error: Option<String>,
}

impl IngestContribution {
    /// Whether another READ-stage retry is allowed.
    pub fn can_retry(&self) -> bool {
        self.num_retries < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!ContributionState::InProgress.is_terminal());
        for state in [
            ContributionState::ReadFailed,
            ContributionState::LoadFailed,
            ContributionState::Cancelled,
            ContributionState::Finished,
        ] {
            assert!(state.is_terminal());
        }
    }
}
