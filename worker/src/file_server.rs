//! The per-worker file server.
//!
//! One request/response exchange per connection: the client asks for one
//! file of one database, the server answers with availability and
//! metadata, then streams the raw content to EOF if it was requested.

use crate::WorkerContext;
use observability_deps::tracing::{debug, error, info, warn};
use protocol::{read_frame, write_frame, FileRequest, FileResponse};
use snafu::ResultExt;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// The hard cap on the file send buffer.
pub const MAX_FILE_BUF_SIZE: usize = 16 * 1024 * 1024;

/// The file server: accepts connections and serves one file per connection.
#[derive(Debug)]
pub struct FileServer {
    context: WorkerContext,
    listener: TcpListener,
}

impl FileServer {
    /// Bind the server. Fails if the configured send buffer size is zero or
    /// beyond [`MAX_FILE_BUF_SIZE`].
    pub async fn bind(context: WorkerContext, address: SocketAddr) -> crate::Result<Self> {
        let fs_buf_size = context.config.params().fs_buf_size;
        if fs_buf_size == 0 || fs_buf_size > MAX_FILE_BUF_SIZE {
            return Err(crate::Error::FileRejected {
                reason: format!(
                    "fs_buf_size must be in 1..={}, got {}",
                    MAX_FILE_BUF_SIZE, fs_buf_size
                ),
            });
        }
        let listener = TcpListener::bind(address)
            .await
            .context(crate::FileIoSnafu {
                path: std::path::PathBuf::from(address.to_string()),
            })?;
        Ok(Self { context, listener })
    }

    /// The address the server actually listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("bound listener")
    }

    /// Accept and serve connections until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(worker=%self.context.worker_name, addr=%self.local_addr(), "file server started");
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.cancelled() => {
                    info!(worker=%self.context.worker_name, "file server shutdown");
                    return;
                }
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "file server connection accepted");
                    let context = self.context.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(context, stream).await {
                            debug!(%peer, error=%e, "file server connection closed");
                        }
                    });
                }
                Err(e) => {
                    error!(error=%e, "file server accept failed");
                }
            }
        }
    }
}

/// Serve one connection: one framed exchange, then the optional byte stream.
async fn serve_connection(context: WorkerContext, mut stream: TcpStream) -> crate::Result<()> {
    let request: FileRequest =
        read_frame(&mut stream, context.config.params().request_buf_size)
            .await
            .context(crate::TransportSnafu)?;

    // The file is resolved (and opened) before the response goes out, so
    // the availability flag is truthful at streaming time.
    let mut response = FileResponse {
        available: false,
        size: 0,
        mtime: 0,
        foreign_instance: false,
    };
    let mut file = None;

    if !context.config.is_known_database(&request.database) {
        warn!(database=%request.database, "file request for unknown database");
    } else if request.instance_id != context.instance_id() {
        warn!(
            theirs=%request.instance_id,
            ours=%context.instance_id(),
            "file request from a foreign instance"
        );
        response.foreign_instance = true;
    } else {
        let path = context.database_dir(&request.database).join(&request.file);
        match crate::file_info(&path, &request.file, false).await {
            Err(e) => {
                warn!(path=%path.display(), error=%e, "requested file unavailable");
            }
            Ok(info) => {
                if request.send_content {
                    match tokio::fs::File::open(&path).await {
                        Ok(opened) => file = Some(opened),
                        Err(e) => {
                            warn!(path=%path.display(), error=%e, "requested file unreadable");
                        }
                    }
                }
                if !request.send_content || file.is_some() {
                    response.available = true;
                    response.size = info.size;
                    response.mtime = info.mtime;
                }
            }
        }
    }

    write_frame(&mut stream, &response)
        .await
        .context(crate::TransportSnafu)?;

    if let Some(file) = file {
        let path = context.database_dir(&request.database).join(&request.file);
        stream_file(stream, file, context.config.params().fs_buf_size, &path).await?;
    }
    Ok(())
}

/// Stream the opened file to the client through a cycle of send buffers.
///
/// The reader cedes each filled buffer to the transport task and gets it
/// back only after the bytes are on the wire, so reads and writes overlap
/// without copying.
async fn stream_file(
    stream: TcpStream,
    mut file: tokio::fs::File,
    fs_buf_size: usize,
    path: &std::path::Path,
) -> crate::Result<()> {
    let (mut free_rx, full_tx, mut full_rx, free_tx) =
        crate::buffer_cycle(fs_buf_size, 2);

    let mut transport_stream = stream;
    let transport = tokio::spawn(async move {
        while let Some(buffer) = full_rx.recv().await {
            if let Err(e) = transport_stream.write_all(buffer.filled()).await {
                return Err(e);
            }
            if free_tx.send(buffer).await.is_err() {
                break;
            }
        }
        transport_stream.flush().await
    });

    while let Some(mut buffer) = free_rx.recv().await {
        let n = tokio::io::AsyncReadExt::read(&mut file, buffer.storage())
            .await
            .map_err(|e| crate::Error::FileIo {
                path: path.to_path_buf(),
                source: e,
            })?;
        if n == 0 {
            break;
        }
        buffer.set_filled(n);
        if full_tx.send(buffer).await.is_err() {
            break;
        }
    }
    drop(full_tx);

    match transport.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(crate::Error::FileIo {
            path: path.to_path_buf(),
            source: e,
        }),
        Err(_) => Ok(()),
    }
}
