//! The ingest service: a bounded pool of contribution processors with a
//! status/cancellation surface.

use crate::request::{ContributionSpec, IngestDeps, IngestRequest, IngestRequestOptions};
use crate::Result;
use data_types::{ContributionId, IngestContribution};
use observability_deps::tracing::{error, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Accepts contributions, runs them on a bounded pool, and answers status
/// and cancellation calls while they run.
#[derive(Debug)]
pub struct IngestService {
    deps: IngestDeps,
    options: IngestRequestOptions,
    slots: Arc<Semaphore>,
    active: Mutex<HashMap<ContributionId, Arc<IngestRequest>>>,
}

impl IngestService {
    /// Create a service processing at most `concurrency` contributions at
    /// a time.
    pub fn new(deps: IngestDeps, options: IngestRequestOptions, concurrency: usize) -> Arc<Self> {
        Arc::new(Self {
            deps,
            options,
            slots: Arc::new(Semaphore::new(concurrency.max(1))),
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Register a contribution and queue it for processing. Returns its id
    /// immediately; progress is visible through [`IngestService::status`].
    pub async fn submit(self: &Arc<Self>, spec: ContributionSpec) -> Result<ContributionId> {
        let request =
            IngestRequest::create(self.deps.clone(), self.options.clone(), spec).await?;
        let id = request.contribution().id;
        self.active.lock().insert(id, Arc::clone(&request));

        let service = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = Arc::clone(&service.slots)
                .acquire_owned()
                .await
                .expect("ingest semaphore never closes");
            match request.process().await {
                Ok(state) => info!(%id, ?state, "contribution processed"),
                Err(e) => error!(%id, error=%e, "contribution refused"),
            }
            service.active.lock().remove(&id);
        });
        Ok(id)
    }

    /// Cancel an active contribution. Unknown or already settled ids are a
    /// no-op, mirroring the terminal-state guarantee of the engine.
    pub fn cancel(&self, id: ContributionId) {
        if let Some(request) = self.active.lock().get(&id) {
            request.cancel();
        }
    }

    /// The current descriptor of a contribution, active or settled.
    pub async fn status(&self, id: ContributionId) -> Result<IngestContribution> {
        let active = self.active.lock().get(&id).map(|r| r.contribution());
        match active {
            Some(contribution) => Ok(contribution),
            None => self.deps.store.contribution(id).await,
        }
    }

    /// Number of contributions currently registered with the service.
    pub fn num_active(&self) -> usize {
        self.active.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MockLoader;
    use crate::request::UrlSourceFactory;
    use crate::store::{IngestStore, MemIngestStore};
    use data_types::{
        ContributionState, DialectInput, HttpMethod, SuperTransaction, TransactionId,
        TransactionState,
    };
    use locking::NamedMutexRegistry;

    #[tokio::test]
    async fn submitted_contributions_settle_and_leave_the_active_set() {
        let store = Arc::new(MemIngestStore::new());
        store
            .add_transaction(SuperTransaction {
                id: TransactionId::new(1),
                database: "sky".into(),
                state: TransactionState::Started,
            })
            .await
            .unwrap();
        let deps = IngestDeps {
            store: Arc::clone(&store) as _,
            loader: Arc::new(MockLoader::new()),
            sources: Arc::new(UrlSourceFactory::default()),
            named_mutexes: Arc::new(NamedMutexRegistry::new()),
        };
        let service = IngestService::new(deps, IngestRequestOptions::default(), 2);

        let input = test_helpers::make_temp_file("1\ta\n");
        let id = service
            .submit(ContributionSpec {
                transaction_id: TransactionId::new(1),
                table: "Object".into(),
                chunk: 1,
                is_overlap: false,
                url: format!("file://{}", input.path().display()),
                charset: "utf8mb4".into(),
                dialect: DialectInput::default(),
                http_method: HttpMethod::Get,
                http_data: None,
                http_headers: vec![],
                max_num_warnings: 0,
                max_retries: 0,
            })
            .await
            .unwrap();

        // Poll until the background task settles the contribution.
        let mut state = ContributionState::InProgress;
        for _ in 0..100 {
            state = service.status(id).await.unwrap().state;
            if state.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(state, ContributionState::Finished);

        for _ in 0..100 {
            if service.num_active() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(service.num_active(), 0);
    }
}
