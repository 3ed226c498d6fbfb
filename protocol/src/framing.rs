//! Length-prefixed framing over any async byte stream.

use prost::Message;
use snafu::{ensure, ResultExt, Snafu};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a frame body; anything larger is a protocol violation and
/// terminates the connection.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Errors of the framed transport.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum FrameError {
    #[snafu(display("I/O error on the framed stream: {}", source))]
    Io { source: std::io::Error },

    #[snafu(display("malformed frame body: {}", source))]
    Decode { source: prost::DecodeError },

    #[snafu(display("frame of {} bytes exceeds the limit of {} bytes", size, limit))]
    FrameTooLarge { size: usize, limit: usize },
}

/// Convenience result alias.
pub type Result<T, E = FrameError> = std::result::Result<T, E>;

/// Write one message framed with a 32-bit big-endian length prefix.
pub async fn write_frame<M, W>(stream: &mut W, message: &M) -> Result<()>
where
    M: Message,
    W: AsyncWrite + Unpin,
{
    let body = message.encode_to_vec();
    ensure!(
        body.len() <= MAX_FRAME_SIZE,
        FrameTooLargeSnafu {
            size: body.len(),
            limit: MAX_FRAME_SIZE,
        }
    );
    stream
        .write_all(&(body.len() as u32).to_be_bytes())
        .await
        .context(IoSnafu)?;
    stream.write_all(&body).await.context(IoSnafu)?;
    stream.flush().await.context(IoSnafu)?;
    Ok(())
}

/// Read one message framed with a 32-bit big-endian length prefix.
///
/// The receive buffer is sized from the length prefix, bounded by `limit`.
pub async fn read_frame<M, R>(stream: &mut R, limit: usize) -> Result<M>
where
    M: Message + Default,
    R: AsyncRead + Unpin,
{
    let mut prefix = [0_u8; 4];
    stream.read_exact(&mut prefix).await.context(IoSnafu)?;
    let size = u32::from_be_bytes(prefix) as usize;
    ensure!(
        size <= limit.min(MAX_FRAME_SIZE),
        FrameTooLargeSnafu {
            size,
            limit: limit.min(MAX_FRAME_SIZE),
        }
    );

    let mut body = vec![0_u8; size];
    stream.read_exact(&mut body).await.context(IoSnafu)?;
    M::decode(body.as_slice()).context(DecodeSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{EchoBody, RequestBody, RequestEnvelope};

    fn request() -> RequestEnvelope {
        RequestEnvelope {
            id: "req-1".into(),
            instance_id: "qserv-prod".into(),
            priority: 2,
            job_id: "job-1".into(),
            expiration_ival_secs: 60,
            body: Some(RequestBody::Echo(EchoBody {
                data: "ping".into(),
                delay_ms: 0,
            })),
        }
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let sent = request();
        write_frame(&mut client, &sent).await.unwrap();

        let received: RequestEnvelope = read_frame(&mut server, MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_by_the_reader() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        // Announce a body far beyond the reader's limit.
        client
            .write_all(&(1024_u32 * 1024).to_be_bytes())
            .await
            .unwrap();

        let err = read_frame::<RequestEnvelope, _>(&mut server, 512)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn truncated_stream_surfaces_as_io_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        client.write_all(&8_u32.to_be_bytes()).await.unwrap();
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);

        let err = read_frame::<RequestEnvelope, _>(&mut server, MAX_FRAME_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Io { .. }));
    }
}
