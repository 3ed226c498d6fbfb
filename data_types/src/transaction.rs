//! Super-transactions scoping ingest contributions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a super-transaction.
///
/// The value doubles as the MySQL partition name suffix (`p<id>`) isolating
/// the transaction's in-progress rows.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TransactionId(u32);

impl TransactionId {
    /// Wrap a raw identifier.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// The raw identifier.
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a super-transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    /// Open; contributions are accepted.
    Started,
    /// Committed; the partition was merged into the table.
    Finished,
    /// Aborted; the partition was dropped.
    Aborted,
}

/// A long-lived ingest transaction over one database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperTransaction {
    /// Transaction identifier.
    pub id: TransactionId,
    /// The database all contributions of this transaction target.
    pub database: String,
    /// Current state.
    pub state: TransactionState,
}

impl SuperTransaction {
    /// The MySQL partition isolating this transaction's rows.
    pub fn partition_name(&self) -> String {
        format!("p{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_name_embeds_the_id() {
        let txn = SuperTransaction {
            id: TransactionId::new(417),
            database: "sky".into(),
            state: TransactionState::Started,
        };
        assert_eq!(txn.partition_name(), "p417");
    }
}
