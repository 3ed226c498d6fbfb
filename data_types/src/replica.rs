//! Replica descriptors as reported by workers and stored in the replica view.

use crate::chunk::Chunk;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Completeness of one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    /// All files of the chunk are present and readable.
    Complete,
    /// The replica exists but some files are missing or partial.
    Incomplete,
}

/// One file of a chunk's file set as seen on a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// File name relative to the database directory.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Modification time, seconds since the UNIX epoch.
    pub mtime: i64,
    /// Control sum over the file content, if it was computed.
    pub checksum: Option<u64>,
}

/// One physical copy of a chunk of one database on one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    /// The chunk this replica materializes.
    pub chunk: Chunk,
    /// Database the files belong to.
    pub database: String,
    /// Worker holding the files.
    pub worker: String,
    /// Completeness status.
    pub status: ReplicaStatus,
    /// When the replica was last verified, seconds since the UNIX epoch.
    pub verify_time: i64,
    /// Per-file details.
    pub files: Vec<FileInfo>,
}

/// Why two replicas of the same chunk were found to disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DifferenceReason {
    /// The replicas carry different numbers of files.
    FileCount,
    /// A file exists in one replica only.
    MissingFile(String),
    /// Sizes of the named file differ.
    Size(String),
    /// Modification times of the named file differ.
    Mtime(String),
    /// Checksums of the named file differ.
    Checksum(String),
}

impl fmt::Display for DifferenceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileCount => write!(f, "file count"),
            Self::MissingFile(name) => write!(f, "missing file {}", name),
            Self::Size(name) => write!(f, "size of {}", name),
            Self::Mtime(name) => write!(f, "mtime of {}", name),
            Self::Checksum(name) => write!(f, "checksum of {}", name),
        }
    }
}

/// A disagreement between two replicas of the same chunk, produced by the
/// verification job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaDifference {
    /// The replica the comparison was anchored on.
    pub reference: Replica,
    /// The replica that disagreed with it.
    pub other: Replica,
    /// All observed disagreements.
    pub reasons: Vec<DifferenceReason>,
}

impl ReplicaDifference {
    /// Compare two replicas of the same chunk; `None` when they agree.
    ///
    /// Checksums are only compared when both sides carry one, so replicas
    /// verified with and without checksum computation never conflict on that
    /// account.
    pub fn between(reference: &Replica, other: &Replica) -> Option<Self> {
        let mut reasons = vec![];
        if reference.files.len() != other.files.len() {
            reasons.push(DifferenceReason::FileCount);
        }
        for file in &reference.files {
            match other.files.iter().find(|f| f.name == file.name) {
                None => reasons.push(DifferenceReason::MissingFile(file.name.clone())),
                Some(peer) => {
                    if peer.size != file.size {
                        reasons.push(DifferenceReason::Size(file.name.clone()));
                    }
                    if peer.mtime != file.mtime {
                        reasons.push(DifferenceReason::Mtime(file.name.clone()));
                    }
                    if let (Some(a), Some(b)) = (file.checksum, peer.checksum) {
                        if a != b {
                            reasons.push(DifferenceReason::Checksum(file.name.clone()));
                        }
                    }
                }
            }
        }
        if reasons.is_empty() {
            None
        } else {
            Some(Self {
                reference: reference.clone(),
                other: other.clone(),
                reasons,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(worker: &str, files: Vec<FileInfo>) -> Replica {
        Replica {
            chunk: Chunk::new("test", 7),
            database: "db1".into(),
            worker: worker.into(),
            status: ReplicaStatus::Complete,
            verify_time: 0,
            files,
        }
    }

    fn file(name: &str, size: u64, mtime: i64, checksum: Option<u64>) -> FileInfo {
        FileInfo {
            name: name.into(),
            size,
            mtime,
            checksum,
        }
    }

    #[test]
    fn identical_replicas_do_not_differ() {
        let a = replica("w1", vec![file("t_7.tsv", 10, 100, Some(1))]);
        let b = replica("w2", vec![file("t_7.tsv", 10, 100, Some(1))]);
        assert_eq!(ReplicaDifference::between(&a, &b), None);
    }

    #[test]
    fn size_and_checksum_disagreements_are_reported() {
        let a = replica("w1", vec![file("t_7.tsv", 10, 100, Some(1))]);
        let b = replica("w2", vec![file("t_7.tsv", 11, 100, Some(2))]);
        let diff = ReplicaDifference::between(&a, &b).unwrap();
        assert_eq!(
            diff.reasons,
            vec![
                DifferenceReason::Size("t_7.tsv".into()),
                DifferenceReason::Checksum("t_7.tsv".into()),
            ]
        );
    }

    #[test]
    fn checksum_is_only_compared_when_present_on_both_sides() {
        let a = replica("w1", vec![file("t_7.tsv", 10, 100, Some(1))]);
        let b = replica("w2", vec![file("t_7.tsv", 10, 100, None)]);
        assert_eq!(ReplicaDifference::between(&a, &b), None);
    }
}
