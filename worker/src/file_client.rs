//! Client side of the file server protocol, used by replication to pull
//! chunk files from a source worker.

use crate::{FileIoSnafu, FileRejectedSnafu, Result, TransportSnafu};
use observability_deps::tracing::debug;
use protocol::{read_frame, write_frame, FileRequest, FileResponse, MAX_FRAME_SIZE};
use snafu::ResultExt;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Metadata of a fetched (or probed) file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchedFile {
    /// Size in bytes as reported (and streamed) by the server.
    pub size: u64,
    /// Modification time on the server.
    pub mtime: i64,
}

/// Probe one file on a remote file server without pulling its content.
pub async fn probe_file(
    address: &str,
    instance_id: &str,
    database: &str,
    file: &str,
) -> Result<Option<FetchedFile>> {
    let mut stream = connect(address).await?;
    let response = exchange(&mut stream, instance_id, database, file, false).await?;
    Ok(available(response))
}

/// Pull one file from a remote file server into `dest`.
///
/// Returns `None` when the server reports the file unavailable; a foreign
/// instance id is an error. The file is written through a temporary sibling
/// and renamed into place, so partially transferred files never shadow good
/// replicas.
pub async fn fetch_file(
    address: &str,
    instance_id: &str,
    database: &str,
    file: &str,
    dest: &Path,
) -> Result<Option<FetchedFile>> {
    let mut stream = connect(address).await?;
    let response = exchange(&mut stream, instance_id, database, file, true).await?;
    let Some(fetched) = available(response) else {
        return Ok(None);
    };

    let tmp = dest.with_extension("part");
    let mut out = tokio::fs::File::create(&tmp)
        .await
        .context(FileIoSnafu { path: tmp.clone() })?;

    let mut remaining = fetched.size;
    let mut buf = vec![0_u8; 1024 * 1024];
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = stream
            .read(&mut buf[..want])
            .await
            .context(FileIoSnafu { path: tmp.clone() })?;
        if n == 0 {
            return FileRejectedSnafu {
                reason: format!(
                    "server closed the stream {} bytes short of {}",
                    remaining, fetched.size
                ),
            }
            .fail();
        }
        out.write_all(&buf[..n])
            .await
            .context(FileIoSnafu { path: tmp.clone() })?;
        remaining -= n as u64;
    }
    out.flush().await.context(FileIoSnafu { path: tmp.clone() })?;
    drop(out);

    tokio::fs::rename(&tmp, dest)
        .await
        .context(FileIoSnafu {
            path: dest.to_path_buf(),
        })?;
    debug!(file, size = fetched.size, "file fetched");
    Ok(Some(fetched))
}

async fn connect(address: &str) -> Result<TcpStream> {
    TcpStream::connect(address).await.context(FileIoSnafu {
        path: std::path::PathBuf::from(address),
    })
}

async fn exchange(
    stream: &mut TcpStream,
    instance_id: &str,
    database: &str,
    file: &str,
    send_content: bool,
) -> Result<FileResponse> {
    write_frame(
        stream,
        &FileRequest {
            database: database.to_string(),
            file: file.to_string(),
            send_content,
            instance_id: instance_id.to_string(),
        },
    )
    .await
    .context(TransportSnafu)?;

    let response: FileResponse = read_frame(stream, MAX_FRAME_SIZE)
        .await
        .context(TransportSnafu)?;
    if response.foreign_instance {
        return FileRejectedSnafu {
            reason: "foreign instance id".to_string(),
        }
        .fail();
    }
    Ok(response)
}

fn available(response: FileResponse) -> Option<FetchedFile> {
    response.available.then_some(FetchedFile {
        size: response.size,
        mtime: response.mtime,
    })
}
