//! Database, table and family metadata mirrored from the catalog.

use crate::transaction::TransactionId;
use serde::{Deserialize, Serialize};

/// Publication status of a database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatabaseStatus {
    /// Published and eligible for placement operations.
    Ready,
    /// Present in the catalog but excluded from all operations.
    Ignore,
    /// Being created under the umbrella of the given super-transaction.
    PendingCreate(TransactionId),
    /// Any other status recorded by an external tool.
    Other(String),
}

/// Spatial partitioning parameters shared by all databases of a family.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StripingParams {
    /// Number of latitude stripes.
    pub stripes: u32,
    /// Number of sub-stripes per stripe.
    pub sub_stripes: u32,
    /// Overlap radius in degrees.
    pub overlap: f64,
    /// Identifier of the partitioning record in the catalog.
    pub partitioning_id: u32,
}

/// A group of databases partitioned identically whose chunks are collocated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseFamily {
    /// Family name.
    pub name: String,
    /// The replication level the placement layer drives each chunk toward.
    pub replication_level: u32,
    /// Partitioning shared by all member databases.
    pub striping: StripingParams,
}

/// Parameters of a spatially partitioned table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionedTableParams {
    /// Database of the director table.
    pub dir_db: String,
    /// Name of the director table.
    pub dir_table: String,
    /// Column joining rows to the director table.
    pub dir_col: String,
    /// Longitude column.
    pub lon_col: String,
    /// Latitude column.
    pub lat_col: String,
    /// Overlap radius for this table, degrees.
    pub overlap: f64,
    /// Whether sub-chunks are materialized for near-neighbor joins.
    pub sub_chunks: bool,
}

/// Parameters of a match table relating two director tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchTableParams {
    /// First director table.
    pub dir_table1: String,
    /// Column referencing the first director table.
    pub dir_col1: String,
    /// Second director table.
    pub dir_table2: String,
    /// Column referencing the second director table.
    pub dir_col2: String,
    /// Column flagging the match disposition.
    pub flag_col: String,
}

/// How (and whether) a table is partitioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TablePartitioning {
    /// A regular, fully replicated table.
    None,
    /// A chunked table.
    Partitioned(PartitionedTableParams),
    /// A chunked match table.
    Match(MatchTableParams),
}

/// One table of a database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    /// Table name.
    pub name: String,
    /// The `CREATE TABLE` column list, as recorded in the catalog.
    pub schema: String,
    /// Partitioning parameters.
    pub partitioning: TablePartitioning,
}

impl Table {
    /// Whether the table is sliced into chunks.
    pub fn is_partitioned(&self) -> bool {
        !matches!(self.partitioning, TablePartitioning::None)
    }

    /// Whether the table is the director table of its own database.
    pub fn is_director(&self, database: &str) -> bool {
        match &self.partitioning {
            TablePartitioning::Partitioned(p) => p.dir_db == database && p.dir_table == self.name,
            _ => false,
        }
    }
}

/// One database of a family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Database {
    /// Database name.
    pub name: String,
    /// The family the database belongs to.
    pub family: String,
    /// Publication status.
    pub status: DatabaseStatus,
    /// Tables of the database.
    pub tables: Vec<Table>,
}

impl Database {
    /// Whether the database participates in placement operations.
    pub fn is_ready(&self) -> bool {
        self.status == DatabaseStatus::Ready
    }

    /// Look up a table by name.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Tables that direct the partitioning of this database.
    pub fn director_tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter().filter(|t| t.is_director(&self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn director(name: &str, db: &str) -> Table {
        Table {
            name: name.into(),
            schema: "(id BIGINT, ra DOUBLE, dec DOUBLE)".into(),
            partitioning: TablePartitioning::Partitioned(PartitionedTableParams {
                dir_db: db.into(),
                dir_table: name.into(),
                dir_col: "id".into(),
                lon_col: "ra".into(),
                lat_col: "dec".into(),
                overlap: 0.01,
                sub_chunks: true,
            }),
        }
    }

    #[test]
    fn director_tables_are_recognized() {
        let mut dependent = director("Source", "sky");
        if let TablePartitioning::Partitioned(p) = &mut dependent.partitioning {
            p.dir_table = "Object".into();
        }
        let db = Database {
            name: "sky".into(),
            family: "production".into(),
            status: DatabaseStatus::Ready,
            tables: vec![director("Object", "sky"), dependent],
        };

        let directors: Vec<_> = db.director_tables().map(|t| t.name.as_str()).collect();
        assert_eq!(directors, vec!["Object"]);
    }
}
