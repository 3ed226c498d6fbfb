//! The typed configuration view over the key-value tree.

use crate::kv::{check_version, get_json, initialize_version, set_json, KvInterface};
use crate::{Error, Result, UnknownDatabaseSnafu, UnknownFamilySnafu, UnknownWorkerSnafu};
use data_types::{Database, DatabaseFamily, DatabaseStatus, Table, WorkerNode, WorkerState};
use serde::{Deserialize, Serialize};
use snafu::ensure;
use std::sync::Arc;
use std::time::Duration;

/// Per-process runtime parameters that do not live in the tree.
#[derive(Debug, Clone)]
pub struct ServiceParams {
    /// Instance id shared by all peers of one deployment; requests carrying
    /// a different id are rejected by workers.
    pub instance_id: String,
    /// Default bound on the lifetime of a worker request.
    pub request_expiration: Duration,
    /// Wake-up interval of the job scheduler loop.
    pub job_scheduler_ival: Duration,
    /// Size of the file server's pre-allocated send buffer.
    pub fs_buf_size: usize,
    /// Cap on the size of an incoming protocol frame.
    pub request_buf_size: usize,
    /// How long completed jobs stay visible in the finished queue.
    pub finished_jobs_retention: Duration,
    /// Concurrent ingest requests per worker.
    pub ingest_concurrency: usize,
}

impl Default for ServiceParams {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            request_expiration: Duration::from_secs(1200),
            job_scheduler_ival: Duration::from_secs(1),
            fs_buf_size: 1024 * 1024,
            request_buf_size: 1024 * 1024,
            finished_jobs_retention: Duration::from_secs(3600),
            ingest_concurrency: 4,
        }
    }
}

/// The database record as stored at `/DBS/<name>`; tables hang below it.
#[derive(Debug, Serialize, Deserialize)]
struct DatabaseRecord {
    family: String,
    status: DatabaseStatus,
}

const NODES: &str = "/NODES";
const DBS: &str = "/DBS";
const PARTITIONING: &str = "/PARTITIONING";

/// Typed access to cluster metadata.
///
/// All reads go straight to the tree; there is no caching layer, so
/// concurrent mutators (the DeleteWorker job disabling a node, ingest
/// workflows registering databases) are always observed.
#[derive(Debug, Clone)]
pub struct Configuration {
    kv: Arc<dyn KvInterface>,
    params: ServiceParams,
}

impl Configuration {
    /// Open an existing tree. Fails on a schema version mismatch.
    pub fn open(kv: Arc<dyn KvInterface>, params: ServiceParams) -> Result<Self> {
        check_version(kv.as_ref())?;
        Ok(Self { kv, params })
    }

    /// Initialize a fresh tree with this reader's schema version.
    pub fn bootstrap(kv: Arc<dyn KvInterface>, params: ServiceParams) -> Result<Self> {
        initialize_version(kv.as_ref())?;
        Ok(Self { kv, params })
    }

    /// The runtime parameters.
    pub fn params(&self) -> &ServiceParams {
        &self.params
    }

    /// The instance id of this deployment.
    pub fn instance_id(&self) -> &str {
        &self.params.instance_id
    }

    /// The underlying tree.
    pub fn kv(&self) -> &Arc<dyn KvInterface> {
        &self.kv
    }

    // ---- workers ----

    /// All registered workers.
    pub fn workers(&self) -> Result<Vec<WorkerNode>> {
        let names = self.kv.get_children(NODES).unwrap_or_default();
        names
            .iter()
            .map(|name| self.worker(name))
            .collect::<Result<Vec<_>>>()
    }

    /// Workers eligible for placement.
    pub fn active_workers(&self) -> Result<Vec<WorkerNode>> {
        Ok(self
            .workers()?
            .into_iter()
            .filter(WorkerNode::is_active)
            .collect())
    }

    /// Look up one worker.
    pub fn worker(&self, name: &str) -> Result<WorkerNode> {
        get_json(self.kv.as_ref(), &format!("{}/{}", NODES, name))
            .map_err(|_| Error::UnknownWorker { name: name.into() })
    }

    /// Whether the worker is registered.
    pub fn is_known_worker(&self, name: &str) -> bool {
        self.worker(name).is_ok()
    }

    /// Register a new worker.
    pub fn add_worker(&self, node: &WorkerNode) -> Result<()> {
        set_json(self.kv.as_ref(), &format!("{}/{}", NODES, node.name), node)
    }

    /// Change the availability of a worker.
    pub fn set_worker_state(&self, name: &str, state: WorkerState) -> Result<()> {
        let mut node = self.worker(name)?;
        node.state = state;
        self.add_worker(&node)
    }

    /// Unregister a worker permanently.
    pub fn remove_worker(&self, name: &str) -> Result<()> {
        ensure!(self.is_known_worker(name), UnknownWorkerSnafu { name });
        self.kv.delete_key(&format!("{}/{}", NODES, name))
    }

    // ---- families ----

    /// All database families.
    pub fn families(&self) -> Result<Vec<DatabaseFamily>> {
        let ids = self.kv.get_children(PARTITIONING).unwrap_or_default();
        ids.iter()
            .map(|id| get_json(self.kv.as_ref(), &format!("{}/{}", PARTITIONING, id)))
            .collect()
    }

    /// Look up one family by name.
    pub fn family(&self, name: &str) -> Result<DatabaseFamily> {
        self.families()?
            .into_iter()
            .find(|f| f.name == name)
            .ok_or_else(|| Error::UnknownFamily { name: name.into() })
    }

    /// Register a family under its partitioning id.
    pub fn add_family(&self, family: &DatabaseFamily) -> Result<()> {
        set_json(
            self.kv.as_ref(),
            &format!("{}/{:010}", PARTITIONING, family.striping.partitioning_id),
            family,
        )
    }

    /// The replication level configured for a family.
    pub fn replication_level(&self, family: &str) -> Result<u32> {
        Ok(self.family(family)?.replication_level)
    }

    // ---- databases and tables ----

    /// All registered databases, tables included.
    pub fn databases(&self) -> Result<Vec<Database>> {
        let names = self.kv.get_children(DBS).unwrap_or_default();
        names.iter().map(|name| self.database(name)).collect()
    }

    /// Databases of one family, optionally restricted to `READY` ones.
    pub fn databases_of_family(&self, family: &str, ready_only: bool) -> Result<Vec<Database>> {
        ensure!(self.family(family).is_ok(), UnknownFamilySnafu { name: family });
        Ok(self
            .databases()?
            .into_iter()
            .filter(|db| db.family == family && (!ready_only || db.is_ready()))
            .collect())
    }

    /// Look up one database, tables included.
    pub fn database(&self, name: &str) -> Result<Database> {
        let record: DatabaseRecord = get_json(self.kv.as_ref(), &format!("{}/{}", DBS, name))
            .map_err(|_| Error::UnknownDatabase { name: name.into() })?;

        let tables_key = format!("{}/{}/TABLES", DBS, name);
        let table_names = self.kv.get_children(&tables_key).unwrap_or_default();
        let tables = table_names
            .iter()
            .map(|t| get_json(self.kv.as_ref(), &format!("{}/{}", tables_key, t)))
            .collect::<Result<Vec<Table>>>()?;

        Ok(Database {
            name: name.to_string(),
            family: record.family,
            status: record.status,
            tables,
        })
    }

    /// Whether the database is registered.
    pub fn is_known_database(&self, name: &str) -> bool {
        self.kv
            .exists(&format!("{}/{}", DBS, name))
            .unwrap_or(false)
    }

    /// Register a database and its tables.
    pub fn add_database(&self, database: &Database) -> Result<()> {
        ensure!(
            self.family(&database.family).is_ok(),
            UnknownFamilySnafu {
                name: database.family.clone(),
            }
        );
        set_json(
            self.kv.as_ref(),
            &format!("{}/{}", DBS, database.name),
            &DatabaseRecord {
                family: database.family.clone(),
                status: database.status.clone(),
            },
        )?;
        for table in &database.tables {
            self.add_table(&database.name, table)?;
        }
        Ok(())
    }

    /// Register (or replace) one table of a database.
    pub fn add_table(&self, database: &str, table: &Table) -> Result<()> {
        ensure!(
            self.is_known_database(database),
            UnknownDatabaseSnafu { name: database }
        );
        set_json(
            self.kv.as_ref(),
            &format!("{}/{}/TABLES/{}", DBS, database, table.name),
            table,
        )
    }

    /// Change the publication status of a database.
    pub fn set_database_status(&self, name: &str, status: DatabaseStatus) -> Result<()> {
        let mut record: DatabaseRecord = get_json(self.kv.as_ref(), &format!("{}/{}", DBS, name))
            .map_err(|_| Error::UnknownDatabase { name: name.into() })?;
        record.status = status;
        set_json(self.kv.as_ref(), &format!("{}/{}", DBS, name), &record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemKv;
    use assert_matches::assert_matches;
    use data_types::{StripingParams, TablePartitioning};

    fn test_config() -> Configuration {
        Configuration::bootstrap(Arc::new(MemKv::new()), ServiceParams::default()).unwrap()
    }

    fn test_family(name: &str) -> DatabaseFamily {
        DatabaseFamily {
            name: name.into(),
            replication_level: 2,
            striping: StripingParams {
                stripes: 340,
                sub_stripes: 3,
                overlap: 0.01667,
                partitioning_id: 1,
            },
        }
    }

    #[test]
    fn open_rejects_version_mismatch() {
        let kv = Arc::new(MemKv::new());
        kv.set(crate::kv::VERSION_KEY, "1000000").unwrap();
        assert_matches!(
            Configuration::open(kv, ServiceParams::default()),
            Err(Error::VersionMismatch { .. })
        );
    }

    #[test]
    fn worker_round_trip() {
        let config = test_config();
        let node = WorkerNode {
            name: "worker-1".into(),
            host: "host-1".into(),
            svc_port: 25000,
            fs_port: 25001,
            data_dir: "/qserv/data".into(),
            state: WorkerState::Active,
        };
        config.add_worker(&node).unwrap();

        assert_eq!(config.worker("worker-1").unwrap(), node);
        assert_matches!(config.worker("worker-2"), Err(Error::UnknownWorker { .. }));

        config
            .set_worker_state("worker-1", WorkerState::Inactive)
            .unwrap();
        assert!(config.active_workers().unwrap().is_empty());

        config.remove_worker("worker-1").unwrap();
        assert!(!config.is_known_worker("worker-1"));
    }

    #[test]
    fn database_round_trip() {
        let config = test_config();
        config.add_family(&test_family("production")).unwrap();

        let db = Database {
            name: "sky".into(),
            family: "production".into(),
            status: DatabaseStatus::Ready,
            tables: vec![Table {
                name: "Object".into(),
                schema: "(id BIGINT)".into(),
                partitioning: TablePartitioning::None,
            }],
        };
        config.add_database(&db).unwrap();

        let loaded = config.database("sky").unwrap();
        assert_eq!(loaded, db);
        assert!(config.is_known_database("sky"));
        assert_eq!(
            config
                .databases_of_family("production", true)
                .unwrap()
                .len(),
            1
        );

        config
            .set_database_status("sky", DatabaseStatus::Ignore)
            .unwrap();
        assert!(config
            .databases_of_family("production", true)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn unknown_family_is_rejected() {
        let config = test_config();
        let db = Database {
            name: "sky".into(),
            family: "nope".into(),
            status: DatabaseStatus::Ready,
            tables: vec![],
        };
        assert_matches!(config.add_database(&db), Err(Error::UnknownFamily { .. }));
        assert_matches!(
            config.databases_of_family("nope", false),
            Err(Error::UnknownFamily { .. })
        );
    }

    #[test]
    fn replication_level_comes_from_the_family() {
        let config = test_config();
        config.add_family(&test_family("production")).unwrap();
        assert_eq!(config.replication_level("production").unwrap(), 2);
    }
}
