//! Per-worker logical connections.
//!
//! A link is an mpsc sender feeding one connection task per worker. The
//! task writes framed requests and a companion task routes framed responses
//! back to per-request one-shot channels, so many requests can be in flight
//! on one connection. Dropping a link's reply channel (connection teardown)
//! surfaces as a transport failure on every affected request.

use observability_deps::tracing::{debug, warn};
use parking_lot::Mutex;
use protocol::{read_frame, write_frame, RequestEnvelope, ResponseEnvelope, MAX_FRAME_SIZE};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

/// Transport-level failure description.
#[derive(Debug, Clone)]
pub struct TransportError(pub String);

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One queued request together with its reply channel.
#[derive(Debug)]
pub struct Dispatch {
    /// The framed request to send.
    pub envelope: RequestEnvelope,
    /// Where to deliver the worker's response (or a transport error).
    pub reply: oneshot::Sender<Result<ResponseEnvelope, TransportError>>,
}

/// Capacity of a link's dispatch queue.
const LINK_QUEUE_DEPTH: usize = 128;

/// Creates links to workers. The production implementation dials TCP; tests
/// substitute scripted links.
pub trait LinkFactory: Debug + Send + Sync + 'static {
    /// Create a link to the worker's request service.
    fn connect(&self, worker_name: &str, host: &str, port: u16) -> mpsc::Sender<Dispatch>;
}

/// The TCP [`LinkFactory`].
#[derive(Debug, Default)]
pub struct TcpLinkFactory;

impl LinkFactory for TcpLinkFactory {
    fn connect(&self, worker_name: &str, host: &str, port: u16) -> mpsc::Sender<Dispatch> {
        let (tx, rx) = mpsc::channel(LINK_QUEUE_DEPTH);
        let worker_name = worker_name.to_string();
        let address = format!("{}:{}", host, port);
        tokio::spawn(run_link(worker_name, address, rx));
        tx
    }
}

/// The connection task: dial, then pump dispatches until the queue closes or
/// the transport fails.
async fn run_link(worker_name: String, address: String, mut rx: mpsc::Receiver<Dispatch>) {
    let stream = match TcpStream::connect(&address).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(worker=%worker_name, %address, error=%e, "worker connection failed");
            // Answer whatever is already queued; the closed queue makes the
            // controller re-dial on the next request.
            while let Ok(dispatch) = rx.try_recv() {
                let _ = dispatch
                    .reply
                    .send(Err(TransportError(format!("connect {}: {}", address, e))));
            }
            return;
        }
    };
    debug!(worker=%worker_name, %address, "worker connection established");
    let (reader, writer) = stream.into_split();
    pump(worker_name, reader, writer, rx).await;
}

/// Pump dispatches onto `writer` and route responses from `reader`.
///
/// Shared pending map: entries are claimed by the response router; whatever
/// is left when both tasks die is dropped, which the waiters observe as a
/// transport failure.
pub(crate) async fn pump<R, W>(
    worker_name: String,
    mut reader: R,
    mut writer: W,
    mut rx: mpsc::Receiver<Dispatch>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Result<ResponseEnvelope, TransportError>>>>>;
    let pending: Pending = Default::default();

    let router = {
        let pending = Arc::clone(&pending);
        let worker_name = worker_name.clone();
        tokio::spawn(async move {
            loop {
                match read_frame::<ResponseEnvelope, _>(&mut reader, MAX_FRAME_SIZE).await {
                    Ok(response) => {
                        let waiter = pending.lock().remove(&response.id);
                        match waiter {
                            Some(reply) => {
                                let _ = reply.send(Ok(response));
                            }
                            None => {
                                debug!(worker=%worker_name, id=%response.id,
                                       "dropping response for unknown or expired request");
                            }
                        }
                    }
                    Err(e) => {
                        debug!(worker=%worker_name, error=%e, "worker connection closed");
                        // Dropping the pending map fails all waiters.
                        pending.lock().clear();
                        return;
                    }
                }
            }
        })
    };

    while let Some(dispatch) = rx.recv().await {
        let id = dispatch.envelope.id.clone();
        pending.lock().insert(id.clone(), dispatch.reply);
        if let Err(e) = write_frame(&mut writer, &dispatch.envelope).await {
            warn!(worker=%worker_name, id=%id, error=%e, "worker send failed");
            if let Some(reply) = pending.lock().remove(&id) {
                let _ = reply.send(Err(TransportError(format!("send: {}", e))));
            }
            break;
        }
    }
    // Closing the queue (or a send failure) tears the connection down; the
    // router dies with the reader and unresolved waiters fail.
    router.abort();
}
