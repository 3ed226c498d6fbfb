//! The on-disk layout of chunk files.
//!
//! Each database owns one directory under the worker's data directory. A
//! chunk of a partitioned table is one `<table>_<chunk>.tsv` file plus an
//! optional `<table>FullOverlap_<chunk>.tsv` carrying the overlap region.

use crate::{FileIoSnafu, Result};
use data_types::FileInfo;
use sha2::{Digest, Sha256};
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::path::Path;

/// Suffix of chunk data files.
const CHUNK_FILE_EXT: &str = ".tsv";

/// Infix marking an overlap file.
const OVERLAP_INFIX: &str = "FullOverlap";

/// The file name of a chunk of a table.
pub fn chunk_file_name(table: &str, chunk: u32, overlap: bool) -> String {
    if overlap {
        format!("{}{}_{}{}", table, OVERLAP_INFIX, chunk, CHUNK_FILE_EXT)
    } else {
        format!("{}_{}{}", table, chunk, CHUNK_FILE_EXT)
    }
}

/// Parse a chunk file name into `(table, chunk, overlap)`.
///
/// Returns `None` for files that are not chunk files (the naming is opaque
/// to everything but this module, so foreign files are simply skipped).
pub fn parse_chunk_file(name: &str) -> Option<(String, u32, bool)> {
    let stem = name.strip_suffix(CHUNK_FILE_EXT)?;
    let (prefix, chunk) = stem.rsplit_once('_')?;
    let chunk = chunk.parse::<u32>().ok()?;
    match prefix.strip_suffix(OVERLAP_INFIX) {
        Some(table) if !table.is_empty() => Some((table.to_string(), chunk, true)),
        _ if !prefix.is_empty() => Some((prefix.to_string(), chunk, false)),
        _ => None,
    }
}

/// Scan one database directory and group its chunk files by chunk number.
///
/// A missing directory reads as "no chunks" because a worker that never
/// received a replica of a database has nothing on disk yet.
pub async fn scan_database_dir(
    dir: &Path,
    compute_checksum: bool,
) -> Result<BTreeMap<u32, Vec<FileInfo>>> {
    let mut chunks: BTreeMap<u32, Vec<FileInfo>> = BTreeMap::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(chunks),
        Err(e) => return Err(crate::Error::FileIo {
            path: dir.to_path_buf(),
            source: e,
        }),
    };

    while let Some(entry) = entries.next_entry().await.context(FileIoSnafu {
        path: dir.to_path_buf(),
    })? {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some((_, chunk, _)) = parse_chunk_file(&name) else {
            continue;
        };
        let path = entry.path();
        let info = file_info(&path, &name, compute_checksum).await?;
        chunks.entry(chunk).or_default().push(info);
    }
    for files in chunks.values_mut() {
        files.sort_by(|a, b| a.name.cmp(&b.name));
    }
    Ok(chunks)
}

/// Stat (and optionally checksum) one chunk file.
pub async fn file_info(path: &Path, name: &str, compute_checksum: bool) -> Result<FileInfo> {
    let metadata = tokio::fs::metadata(path).await.context(FileIoSnafu {
        path: path.to_path_buf(),
    })?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();
    let checksum = if compute_checksum {
        Some(checksum_file(path).await?)
    } else {
        None
    };
    Ok(FileInfo {
        name: name.to_string(),
        size: metadata.len(),
        mtime,
        checksum,
    })
}

/// A 64-bit control sum over the file content (leading bytes of a SHA-256).
pub async fn checksum_file(path: &Path) -> Result<u64> {
    let content = tokio::fs::read(path).await.context(FileIoSnafu {
        path: path.to_path_buf(),
    })?;
    let digest = Sha256::digest(&content);
    let mut first = [0_u8; 8];
    first.copy_from_slice(&digest[..8]);
    Ok(u64::from_be_bytes(first))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_round_trip() {
        assert_eq!(chunk_file_name("Object", 123, false), "Object_123.tsv");
        assert_eq!(
            chunk_file_name("Object", 123, true),
            "ObjectFullOverlap_123.tsv"
        );

        assert_eq!(
            parse_chunk_file("Object_123.tsv"),
            Some(("Object".to_string(), 123, false))
        );
        assert_eq!(
            parse_chunk_file("ObjectFullOverlap_123.tsv"),
            Some(("Object".to_string(), 123, true))
        );
        assert_eq!(parse_chunk_file("README.md"), None);
        assert_eq!(parse_chunk_file("_1.tsv"), None);
        assert_eq!(parse_chunk_file("Object_x.tsv"), None);
    }

    #[tokio::test]
    async fn scan_groups_files_by_chunk() {
        let dir = test_helpers::tmp_dir().unwrap();
        for name in [
            "Object_1.tsv",
            "ObjectFullOverlap_1.tsv",
            "Source_1.tsv",
            "Object_2.tsv",
            "ignored.txt",
        ] {
            tokio::fs::write(dir.path().join(name), b"row\n").await.unwrap();
        }

        let chunks = scan_database_dir(dir.path(), false).await.unwrap();
        assert_eq!(chunks.len(), 2);
        let names: Vec<_> = chunks[&1].iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["ObjectFullOverlap_1.tsv", "Object_1.tsv", "Source_1.tsv"]
        );
        assert!(chunks[&1].iter().all(|f| f.size == 4 && f.checksum.is_none()));
    }

    #[tokio::test]
    async fn missing_directory_reads_as_empty() {
        let dir = test_helpers::tmp_dir().unwrap();
        let missing = dir.path().join("nope");
        assert!(scan_database_dir(&missing, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn checksums_detect_content_changes() {
        let dir = test_helpers::tmp_dir().unwrap();
        let path = dir.path().join("Object_1.tsv");

        tokio::fs::write(&path, b"a\n").await.unwrap();
        let first = checksum_file(&path).await.unwrap();

        tokio::fs::write(&path, b"b\n").await.unwrap();
        let second = checksum_file(&path).await.unwrap();
        assert_ne!(first, second);
    }
}
