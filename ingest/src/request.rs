//! The per-contribution state machine.

use crate::http::{open_http_source, HttpClientConfig, HttpSourceSpec};
use crate::loader::{LoadInterface, LoadRequest};
use crate::reader::{copy_records, ReadError, ReadStats, DEFAULT_RECORD_SIZE};
use crate::store::IngestStore;
use crate::{
    AlreadyAdvancedSnafu, BadDialectSnafu, BadUrlSnafu, Error, LockSnafu, Result,
    TransactionNotStartedSnafu,
};
use async_trait::async_trait;
use backoff::{Backoff, BackoffConfig};
use data_types::{
    ContributionState, CsvDialect, DialectInput, HttpMethod, IngestContribution, ResourceUrl,
    Scheme, TransactionId, TransactionState,
};
use locking::NamedMutexRegistry;
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;
use snafu::{ensure, ResultExt};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;

/// Opens contribution sources. The production implementation resolves the
/// contribution's URL; tests script their own readers (and failures).
#[async_trait]
pub trait SourceFactory: Debug + Send + Sync {
    /// Open the source of a contribution for one READ pass.
    async fn open(
        &self,
        contribution: &IngestContribution,
    ) -> std::result::Result<Box<dyn AsyncRead + Send + Unpin>, ReadError>;
}

/// The [`SourceFactory`] resolving `file://`, `http://` and `https://`.
#[derive(Debug, Default)]
pub struct UrlSourceFactory {
    http: HttpClientConfig,
}

impl UrlSourceFactory {
    /// Create a factory with the given HTTP policy.
    pub fn new(http: HttpClientConfig) -> Self {
        Self { http }
    }
}

#[async_trait]
impl SourceFactory for UrlSourceFactory {
    async fn open(
        &self,
        contribution: &IngestContribution,
    ) -> std::result::Result<Box<dyn AsyncRead + Send + Unpin>, ReadError> {
        let url = ResourceUrl::parse(&contribution.url).map_err(|e| ReadError::Http {
            message: e.to_string(),
        })?;
        match url.scheme() {
            Scheme::File => {
                let host = url.file_host().expect("file scheme");
                if !host.is_empty() && host != "localhost" {
                    return Err(ReadError::Http {
                        message: format!("remote file host '{}' is not reachable", host),
                    });
                }
                let path = url.file_path().expect("file scheme");
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|source| ReadError::SourceIo { source })?;
                Ok(Box::new(file))
            }
            Scheme::Http | Scheme::Https => {
                let client = self.http.build_client()?;
                let source = open_http_source(
                    &client,
                    &HttpSourceSpec {
                        url: contribution.url.clone(),
                        method: contribution.http_method,
                        data: contribution.http_data.clone(),
                        headers: contribution.http_headers.clone(),
                    },
                )
                .await?;
                Ok(Box::new(source))
            }
        }
    }
}

/// The collaborators of the engine, threaded explicitly.
#[derive(Debug, Clone)]
pub struct IngestDeps {
    /// The persistent transaction/contribution store.
    pub store: Arc<dyn IngestStore>,
    /// The LOAD executor.
    pub loader: Arc<dyn LoadInterface>,
    /// Source resolution.
    pub sources: Arc<dyn SourceFactory>,
    /// Per-target load serialization.
    pub named_mutexes: Arc<NamedMutexRegistry>,
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct IngestRequestOptions {
    /// Record size of the READ stage.
    pub record_size: usize,
    /// Stall bound on a single record read.
    pub stall_timeout: Option<Duration>,
    /// Backoff between READ retries.
    pub retry_backoff: BackoffConfig,
    /// Issue `LOAD DATA LOCAL INFILE` instead of a server-side path.
    pub load_local: bool,
}

impl Default for IngestRequestOptions {
    fn default() -> Self {
        Self {
            record_size: DEFAULT_RECORD_SIZE,
            stall_timeout: None,
            retry_backoff: BackoffConfig::default(),
            load_local: true,
        }
    }
}

/// The client-facing description of a new contribution.
#[derive(Debug, Clone)]
pub struct ContributionSpec {
    /// The super-transaction the contribution belongs to.
    pub transaction_id: TransactionId,
    /// Target table (base name; chunk and overlap flag select the table).
    pub table: String,
    /// Target chunk.
    pub chunk: u32,
    /// Whether the overlap table is the target.
    pub is_overlap: bool,
    /// Source location.
    pub url: String,
    /// Character set of the input.
    pub charset: String,
    /// Raw CSV dialect components.
    pub dialect: DialectInput,
    /// HTTP method for remote sources.
    pub http_method: HttpMethod,
    /// Optional HTTP body.
    pub http_data: Option<String>,
    /// Extra HTTP headers.
    pub http_headers: Vec<(String, String)>,
    /// Cap on retained MySQL warnings.
    pub max_num_warnings: u32,
    /// READ retry budget.
    pub max_retries: u32,
}

/// One contribution being processed.
///
/// The descriptor is kept under a copy-on-write discipline: mutators take a
/// snapshot under the mutex, modify the copy, write it back under the
/// mutex, and push the same values to the persistent store without holding
/// the mutex across the I/O. Readers always see a consistent snapshot.
#[derive(Debug)]
pub struct IngestRequest {
    deps: IngestDeps,
    options: IngestRequestOptions,
    contrib: Mutex<IngestContribution>,
    cancelled: AtomicBool,
    processing: AtomicBool,
}

impl IngestRequest {
    /// Validate a specification, persist the new contribution row and
    /// return the request ready for processing.
    pub async fn create(
        deps: IngestDeps,
        options: IngestRequestOptions,
        spec: ContributionSpec,
    ) -> Result<Arc<Self>> {
        ResourceUrl::parse(&spec.url).context(BadUrlSnafu)?;
        let dialect = CsvDialect::try_from_input(&spec.dialect).context(BadDialectSnafu)?;
        let transaction = deps.store.transaction(spec.transaction_id).await?;

        let id = deps.store.next_contribution_id().await?;
        let contribution = IngestContribution {
            id,
            transaction_id: spec.transaction_id,
            database: transaction.database,
            table: spec.table,
            chunk: spec.chunk,
            is_overlap: spec.is_overlap,
            url: spec.url,
            charset: spec.charset,
            dialect,
            http_method: spec.http_method,
            http_data: spec.http_data,
            http_headers: spec.http_headers,
            max_num_warnings: spec.max_num_warnings,
            max_retries: spec.max_retries,
            state: ContributionState::InProgress,
            num_warnings: 0,
            num_rows: 0,
            num_bytes: 0,
            num_retries: 0,
            error: None,
        };
        deps.store.add_contribution(&contribution).await?;
        info!(id=%contribution.id, table=%contribution.table, chunk=contribution.chunk,
              "contribution registered");

        Ok(Arc::new(Self {
            deps,
            options,
            contrib: Mutex::new(contribution),
            cancelled: AtomicBool::new(false),
            processing: AtomicBool::new(false),
        }))
    }

    /// Re-arm a contribution found in the store, e.g. after a worker
    /// restart. Refuses contributions that already reached a terminal
    /// state.
    pub async fn resume(
        deps: IngestDeps,
        options: IngestRequestOptions,
        id: data_types::ContributionId,
    ) -> Result<Arc<Self>> {
        let contribution = deps.store.contribution(id).await?;
        ensure!(
            !contribution.state.is_terminal(),
            AlreadyAdvancedSnafu {
                id,
                state: contribution.state,
            }
        );
        Ok(Arc::new(Self {
            deps,
            options,
            contrib: Mutex::new(contribution),
            cancelled: AtomicBool::new(false),
            processing: AtomicBool::new(false),
        }))
    }

    /// A consistent snapshot of the descriptor.
    pub fn contribution(&self) -> IngestContribution {
        self.contrib.lock().clone()
    }

    /// Request cancellation. The READ and LOAD stages observe the flag at
    /// record boundaries; a contribution already in a terminal state is
    /// unaffected.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Run the contribution to its terminal state.
    ///
    /// Processing happens at most once per request object; all failures
    /// during processing settle into a terminal [`ContributionState`],
    /// returned as `Ok`. An `Err` means the request was refused and the
    /// descriptor was not advanced.
    pub async fn process(self: &Arc<Self>) -> Result<ContributionState> {
        let snapshot = self.contribution();
        ensure!(
            !self.processing.swap(true, Ordering::SeqCst),
            crate::AlreadyProcessingSnafu { id: snapshot.id }
        );
        ensure!(
            !snapshot.state.is_terminal(),
            AlreadyAdvancedSnafu {
                id: snapshot.id,
                state: snapshot.state,
            }
        );

        // VALIDATE
        let transaction = self.deps.store.transaction(snapshot.transaction_id).await?;
        ensure!(
            transaction.state == TransactionState::Started,
            TransactionNotStartedSnafu {
                id: transaction.id,
                state: transaction.state,
            }
        );

        // READ, with the retry budget applied to retryable failures.
        let tmp = tempfile::NamedTempFile::new().map_err(|e| Error::Store {
            message: format!("creating temporary file: {}", e),
        })?;
        let mut backoff = Backoff::new(&self.options.retry_backoff);
        let stats = loop {
            if self.cancelled.load(Ordering::Relaxed) {
                return self.finish(ContributionState::Cancelled, None).await;
            }
            match self.read_once(tmp.path()).await {
                Ok(stats) => break stats,
                Err(ReadError::Interrupted) => {
                    return self.finish(ContributionState::Cancelled, None).await;
                }
                Err(e) => {
                    let current = self.contribution();
                    if !current.can_retry() {
                        return self
                            .finish(ContributionState::ReadFailed, Some(e.to_string()))
                            .await;
                    }
                    let updated = self
                        .update(|c| {
                            c.num_retries += 1;
                            c.error = Some(e.to_string());
                        })
                        .await?;
                    warn!(id=%updated.id, retry=updated.num_retries, of=updated.max_retries,
                          error=%e, "read failed, retrying");
                    tokio::time::sleep(backoff.next()).await;
                }
            }
        };
        self.update(|c| {
            c.num_rows = stats.num_rows;
            c.num_bytes = stats.num_bytes;
            c.error = None;
        })
        .await?;

        // LOAD, serialized per target table.
        if self.cancelled.load(Ordering::Relaxed) {
            return self.finish(ContributionState::Cancelled, None).await;
        }
        let contribution = self.contribution();
        let key = format!(
            "{}:{}:{}:{}",
            contribution.database, contribution.table, contribution.chunk, contribution.is_overlap
        );
        let mutex = self
            .deps
            .named_mutexes
            .named_mutex(&key)
            .context(LockSnafu)?;
        let guard = mutex.lock().await;

        let load = LoadRequest {
            database: contribution.database.clone(),
            table: contribution.table.clone(),
            chunk: contribution.chunk,
            is_overlap: contribution.is_overlap,
            transaction_id: contribution.transaction_id,
            path: tmp.path().to_path_buf(),
            charset: contribution.charset.clone(),
            dialect: contribution.dialect.clone(),
            local: self.options.load_local,
            max_num_warnings: contribution.max_num_warnings,
        };
        debug!(id=%contribution.id, table=%load.target_table(), "loading contribution");
        let outcome = self.deps.loader.load(&load).await;
        drop(guard);

        // FINISH; the temporary file is removed when `tmp` drops, on every
        // path out of here.
        match outcome {
            Ok(outcome) => {
                self.update(|c| c.num_warnings = outcome.num_warnings).await?;
                self.finish(ContributionState::Finished, None).await
            }
            Err(e) => self.finish(ContributionState::LoadFailed, Some(e)).await,
        }
    }

    /// One READ pass into the (truncated) temporary file.
    async fn read_once(&self, tmp: &std::path::Path) -> std::result::Result<ReadStats, ReadError> {
        let contribution = self.contribution();
        let mut source = self.deps.sources.open(&contribution).await?;
        let mut sink = tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(tmp)
            .await
            .map_err(|source| ReadError::SinkIo { source })?;
        copy_records(
            &mut source,
            &mut sink,
            &contribution.dialect,
            self.options.record_size,
            self.options.stall_timeout,
            &self.cancelled,
        )
        .await
    }

    /// Copy-on-write mutation of the descriptor, pushed to the store.
    async fn update<F>(&self, mutate: F) -> Result<IngestContribution>
    where
        F: FnOnce(&mut IngestContribution),
    {
        let updated = {
            let mut guard = self.contrib.lock();
            let mut copy = guard.clone();
            mutate(&mut copy);
            *guard = copy.clone();
            copy
        };
        self.deps.store.update_contribution(&updated).await?;
        Ok(updated)
    }

    /// Settle the terminal state exactly once; later calls (a second
    /// cancellation, say) observe the settled state and change nothing.
    async fn finish(
        &self,
        state: ContributionState,
        error: Option<String>,
    ) -> Result<ContributionState> {
        let updated = {
            let mut guard = self.contrib.lock();
            if guard.state.is_terminal() {
                return Ok(guard.state);
            }
            let mut copy = guard.clone();
            copy.state = state;
            if error.is_some() {
                copy.error = error;
            }
            *guard = copy.clone();
            copy
        };
        self.deps.store.update_contribution(&updated).await?;
        info!(id=%updated.id, state=?updated.state, rows=updated.num_rows,
              bytes=updated.num_bytes, retries=updated.num_retries, "contribution settled");
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{LoadOutcome, MockLoader};
    use crate::store::MemIngestStore;
    use assert_matches::assert_matches;
    use data_types::SuperTransaction;
    use std::sync::atomic::AtomicUsize;

    fn deps_with(
        store: Arc<MemIngestStore>,
        loader: Arc<MockLoader>,
        sources: Arc<dyn SourceFactory>,
    ) -> IngestDeps {
        IngestDeps {
            store,
            loader,
            sources,
            named_mutexes: Arc::new(NamedMutexRegistry::new()),
        }
    }

    fn fast_options() -> IngestRequestOptions {
        IngestRequestOptions {
            record_size: 8,
            retry_backoff: BackoffConfig {
                init_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                base: 1.1,
                deadline: None,
            },
            ..Default::default()
        }
    }

    async fn store_with_transaction() -> Arc<MemIngestStore> {
        let store = Arc::new(MemIngestStore::new());
        store
            .add_transaction(SuperTransaction {
                id: TransactionId::new(42),
                database: "sky".into(),
                state: TransactionState::Started,
            })
            .await
            .unwrap();
        store
    }

    fn spec(url: &str, max_retries: u32) -> ContributionSpec {
        ContributionSpec {
            transaction_id: TransactionId::new(42),
            table: "Object".into(),
            chunk: 123,
            is_overlap: false,
            url: url.into(),
            charset: "utf8mb4".into(),
            dialect: DialectInput::default(),
            http_method: HttpMethod::Get,
            http_data: None,
            http_headers: vec![],
            max_num_warnings: 64,
            max_retries,
        }
    }

    /// A source failing a scripted number of times before serving `data`.
    #[derive(Debug)]
    struct FlakySourceFactory {
        remaining_failures: AtomicUsize,
        data: String,
    }

    #[async_trait]
    impl SourceFactory for FlakySourceFactory {
        async fn open(
            &self,
            _contribution: &IngestContribution,
        ) -> std::result::Result<Box<dyn AsyncRead + Send + Unpin>, ReadError> {
            let remaining = self.remaining_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(ReadError::Http {
                    message: "HTTP status server error (500 Internal Server Error)".into(),
                });
            }
            Ok(Box::new(std::io::Cursor::new(self.data.clone().into_bytes())))
        }
    }

    #[tokio::test]
    async fn successful_contribution_loads_into_the_partition() {
        let input = test_helpers::make_temp_file("1\ta\n2\tb\n3\tc\n");
        let url = format!("file://{}", input.path().display());

        let store = store_with_transaction().await;
        let loader = Arc::new(MockLoader::new());
        loader.push_outcome(Ok(LoadOutcome {
            num_warnings: 2,
            warnings: vec!["w1".into(), "w2".into()],
        }));
        let deps = deps_with(
            Arc::clone(&store),
            Arc::clone(&loader),
            Arc::new(UrlSourceFactory::default()),
        );

        let request = IngestRequest::create(deps, fast_options(), spec(&url, 0))
            .await
            .unwrap();
        let state = request.process().await.unwrap();
        assert_eq!(state, ContributionState::Finished);

        let contribution = request.contribution();
        assert_eq!(contribution.num_rows, 3);
        assert_eq!(contribution.num_bytes, 12);
        assert_eq!(contribution.num_warnings, 2);
        assert_eq!(contribution.num_retries, 0);

        // The persistent row tracked the in-memory descriptor.
        let stored = store.contribution(contribution.id).await.unwrap();
        assert_eq!(stored, contribution);

        // The loader saw exactly one order against the right partition.
        let requests = loader.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].target_table(), "Object_123");
        assert!(requests[0].statement().contains("PARTITION (p42)"));
    }

    #[tokio::test]
    async fn read_failures_are_retried_within_the_budget() {
        let store = store_with_transaction().await;
        let loader = Arc::new(MockLoader::new());
        let sources = Arc::new(FlakySourceFactory {
            remaining_failures: AtomicUsize::new(2),
            data: "1\ta\n2\tb\n".into(),
        });
        let deps = deps_with(Arc::clone(&store), Arc::clone(&loader), sources);

        let request = IngestRequest::create(deps, fast_options(), spec("http://svc/data", 2))
            .await
            .unwrap();
        let state = request.process().await.unwrap();
        assert_eq!(state, ContributionState::Finished);

        let contribution = request.contribution();
        assert_eq!(contribution.num_retries, 2);
        assert_eq!(contribution.num_rows, 2);
        assert_eq!(loader.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn spent_retry_budget_settles_read_failed() {
        let store = store_with_transaction().await;
        let loader = Arc::new(MockLoader::new());
        let sources = Arc::new(FlakySourceFactory {
            remaining_failures: AtomicUsize::new(100),
            data: String::new(),
        });
        let deps = deps_with(Arc::clone(&store), Arc::clone(&loader), sources);

        let request = IngestRequest::create(deps, fast_options(), spec("http://svc/data", 1))
            .await
            .unwrap();
        let state = request.process().await.unwrap();
        assert_eq!(state, ContributionState::ReadFailed);

        let contribution = request.contribution();
        assert_eq!(contribution.num_retries, 1);
        assert!(contribution.error.as_ref().unwrap().contains("500"));
        // Nothing reached the loader.
        assert!(loader.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn load_failure_is_terminal_without_retry() {
        let input = test_helpers::make_temp_file("1\ta\n");
        let url = format!("file://{}", input.path().display());

        let store = store_with_transaction().await;
        let loader = Arc::new(MockLoader::new());
        loader.push_outcome(Err("Duplicate entry '1' for key 'PRIMARY'".into()));
        let deps = deps_with(
            Arc::clone(&store),
            Arc::clone(&loader),
            Arc::new(UrlSourceFactory::default()),
        );

        let request = IngestRequest::create(deps, fast_options(), spec(&url, 5))
            .await
            .unwrap();
        let state = request.process().await.unwrap();
        assert_eq!(state, ContributionState::LoadFailed);
        assert_eq!(request.contribution().num_retries, 0);
        assert_eq!(loader.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_settles_exactly_once() {
        let input = test_helpers::make_temp_file("1\ta\n");
        let url = format!("file://{}", input.path().display());

        let store = store_with_transaction().await;
        let loader = Arc::new(MockLoader::new());
        let deps = deps_with(
            Arc::clone(&store),
            Arc::clone(&loader),
            Arc::new(UrlSourceFactory::default()),
        );

        let request = IngestRequest::create(deps, fast_options(), spec(&url, 0))
            .await
            .unwrap();
        request.cancel();
        let state = request.process().await.unwrap();
        assert_eq!(state, ContributionState::Cancelled);

        // A second cancellation is a no-op on the settled descriptor.
        request.cancel();
        assert_eq!(request.contribution().state, ContributionState::Cancelled);

        // Processing again is refused, and so is resuming from the store.
        assert_matches!(
            request.process().await,
            Err(Error::AlreadyProcessing { .. })
        );
        let id = request.contribution().id;
        let deps = deps_with(
            Arc::clone(&store),
            loader,
            Arc::new(UrlSourceFactory::default()),
        );
        assert_matches!(
            IngestRequest::resume(deps, fast_options(), id).await,
            Err(Error::AlreadyAdvanced { .. })
        );
    }

    #[tokio::test]
    async fn contributions_against_closed_transactions_are_refused() {
        let store = store_with_transaction().await;
        store
            .update_transaction(TransactionId::new(42), TransactionState::Aborted)
            .await
            .unwrap();
        let loader = Arc::new(MockLoader::new());
        let deps = deps_with(
            Arc::clone(&store),
            loader,
            Arc::new(UrlSourceFactory::default()),
        );

        let request = IngestRequest::create(deps, fast_options(), spec("file:///tmp/x", 0))
            .await
            .unwrap();
        assert_matches!(
            request.process().await,
            Err(Error::TransactionNotStarted { .. })
        );
        // The descriptor did not advance.
        assert_eq!(
            request.contribution().state,
            ContributionState::InProgress
        );
    }
}
