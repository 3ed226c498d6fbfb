//! The persistent side of transactions and contributions.
//!
//! The catalog database owns the authoritative rows; the engine keeps its
//! in-memory descriptors in lock-step through this interface.

use crate::{Error, Result};
use async_trait::async_trait;
use data_types::{
    ContributionId, IngestContribution, SuperTransaction, TransactionId, TransactionState,
};
use parking_lot::Mutex;
use sqlx::mysql::MySqlPool;
use sqlx::Row;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// CRUD over transactions and contributions.
#[async_trait]
pub trait IngestStore: Debug + Send + Sync {
    /// Look up a super-transaction.
    async fn transaction(&self, id: TransactionId) -> Result<SuperTransaction>;

    /// Register a super-transaction (operator workflows and tests).
    async fn add_transaction(&self, transaction: SuperTransaction) -> Result<()>;

    /// Change the state of a super-transaction.
    async fn update_transaction(&self, id: TransactionId, state: TransactionState) -> Result<()>;

    /// Persist a new contribution row and hand out its id.
    async fn add_contribution(&self, contribution: &IngestContribution) -> Result<()>;

    /// Allocate the next contribution id.
    async fn next_contribution_id(&self) -> Result<ContributionId>;

    /// Look up a contribution row.
    async fn contribution(&self, id: ContributionId) -> Result<IngestContribution>;

    /// Write back a contribution row.
    async fn update_contribution(&self, contribution: &IngestContribution) -> Result<()>;
}

/// An in-memory [`IngestStore`] for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemIngestStore {
    state: Mutex<MemState>,
}

#[derive(Debug, Default)]
struct MemState {
    transactions: BTreeMap<TransactionId, SuperTransaction>,
    contributions: BTreeMap<ContributionId, IngestContribution>,
    next_contribution_id: u64,
}

impl MemIngestStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IngestStore for MemIngestStore {
    async fn transaction(&self, id: TransactionId) -> Result<SuperTransaction> {
        self.state
            .lock()
            .transactions
            .get(&id)
            .cloned()
            .ok_or(Error::TransactionNotFound { id })
    }

    async fn add_transaction(&self, transaction: SuperTransaction) -> Result<()> {
        self.state
            .lock()
            .transactions
            .insert(transaction.id, transaction);
        Ok(())
    }

    async fn update_transaction(&self, id: TransactionId, state: TransactionState) -> Result<()> {
        let mut guard = self.state.lock();
        let transaction = guard
            .transactions
            .get_mut(&id)
            .ok_or(Error::TransactionNotFound { id })?;
        transaction.state = state;
        Ok(())
    }

    async fn add_contribution(&self, contribution: &IngestContribution) -> Result<()> {
        self.state
            .lock()
            .contributions
            .insert(contribution.id, contribution.clone());
        Ok(())
    }

    async fn next_contribution_id(&self) -> Result<ContributionId> {
        let mut guard = self.state.lock();
        guard.next_contribution_id += 1;
        Ok(ContributionId::new(guard.next_contribution_id))
    }

    async fn contribution(&self, id: ContributionId) -> Result<IngestContribution> {
        self.state
            .lock()
            .contributions
            .get(&id)
            .cloned()
            .ok_or(Error::ContributionNotFound { id })
    }

    async fn update_contribution(&self, contribution: &IngestContribution) -> Result<()> {
        let mut guard = self.state.lock();
        let id = contribution.id;
        let Some(row) = guard.contributions.get_mut(&id) else {
            return Err(Error::ContributionNotFound { id });
        };
        *row = contribution.clone();
        Ok(())
    }
}

/// The MySQL-backed [`IngestStore`].
///
/// The descriptor's structured pieces (dialect, headers) are stored as JSON
/// text; everything the placement and status surfaces filter on is a
/// dedicated column.
#[derive(Debug)]
pub struct MySqlIngestStore {
    pool: MySqlPool,
}

impl MySqlIngestStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    fn store_error(e: sqlx::Error) -> Error {
        Error::Store {
            message: e.to_string(),
        }
    }
}

fn transaction_state_to_str(state: TransactionState) -> &'static str {
    match state {
        TransactionState::Started => "STARTED",
        TransactionState::Finished => "FINISHED",
        TransactionState::Aborted => "ABORTED",
    }
}

fn transaction_state_from_str(raw: &str) -> TransactionState {
    match raw {
        "FINISHED" => TransactionState::Finished,
        "ABORTED" => TransactionState::Aborted,
        _ => TransactionState::Started,
    }
}

#[async_trait]
impl IngestStore for MySqlIngestStore {
    async fn transaction(&self, id: TransactionId) -> Result<SuperTransaction> {
        let row = sqlx::query(
            "SELECT `database`, `state` FROM `transaction` WHERE `id` = ?",
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::store_error)?
        .ok_or(Error::TransactionNotFound { id })?;

        let database: String = row.try_get("database").map_err(Self::store_error)?;
        let state: String = row.try_get("state").map_err(Self::store_error)?;
        Ok(SuperTransaction {
            id,
            database,
            state: transaction_state_from_str(&state),
        })
    }

    async fn add_transaction(&self, transaction: SuperTransaction) -> Result<()> {
        sqlx::query("INSERT INTO `transaction` (`id`, `database`, `state`) VALUES (?, ?, ?)")
            .bind(transaction.id.get())
            .bind(&transaction.database)
            .bind(transaction_state_to_str(transaction.state))
            .execute(&self.pool)
            .await
            .map_err(Self::store_error)?;
        Ok(())
    }

    async fn update_transaction(&self, id: TransactionId, state: TransactionState) -> Result<()> {
        let done = sqlx::query("UPDATE `transaction` SET `state` = ? WHERE `id` = ?")
            .bind(transaction_state_to_str(state))
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(Self::store_error)?;
        if done.rows_affected() == 0 {
            return Err(Error::TransactionNotFound { id });
        }
        Ok(())
    }

    async fn add_contribution(&self, contribution: &IngestContribution) -> Result<()> {
        let descriptor = serde_json::to_string(contribution).expect("serializing contribution");
        sqlx::query(
            "INSERT INTO `transaction_contrib` (`id`, `transaction_id`, `descriptor`) \
             VALUES (?, ?, ?)",
        )
        .bind(contribution.id.get())
        .bind(contribution.transaction_id.get())
        .bind(descriptor)
        .execute(&self.pool)
        .await
        .map_err(Self::store_error)?;
        Ok(())
    }

    async fn next_contribution_id(&self) -> Result<ContributionId> {
        let row = sqlx::query("SELECT COALESCE(MAX(`id`), 0) + 1 AS `next` FROM `transaction_contrib`")
            .fetch_one(&self.pool)
            .await
            .map_err(Self::store_error)?;
        let next: u64 = row.try_get("next").map_err(Self::store_error)?;
        Ok(ContributionId::new(next))
    }

    async fn contribution(&self, id: ContributionId) -> Result<IngestContribution> {
        let row = sqlx::query("SELECT `descriptor` FROM `transaction_contrib` WHERE `id` = ?")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::store_error)?
            .ok_or(Error::ContributionNotFound { id })?;
        let descriptor: String = row.try_get("descriptor").map_err(Self::store_error)?;
        serde_json::from_str(&descriptor).map_err(|e| Error::Store {
            message: format!("malformed contribution {}: {}", id, e),
        })
    }

    async fn update_contribution(&self, contribution: &IngestContribution) -> Result<()> {
        let descriptor = serde_json::to_string(contribution).expect("serializing contribution");
        sqlx::query("UPDATE `transaction_contrib` SET `descriptor` = ? WHERE `id` = ?")
            .bind(descriptor)
            .bind(contribution.id.get())
            .execute(&self.pool)
            .await
            .map_err(Self::store_error)?;
        Ok(())
    }
}
