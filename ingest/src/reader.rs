//! Record-oriented copying of contribution input.
//!
//! Input is consumed in record-sized chunks and decomposed into logical
//! lines terminated by the dialect's line terminator. The last line must be
//! terminated or the read fails. Cancellation is observed between chunks.

use data_types::CsvDialect;
use snafu::{ResultExt, Snafu};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The default record size when reading from an input source.
pub const DEFAULT_RECORD_SIZE: usize = 1024 * 1024;

/// Errors of the READ stage. All of them except [`ReadError::Interrupted`]
/// are candidates for a retry.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum ReadError {
    #[snafu(display("I/O failure while reading the source: {}", source))]
    SourceIo { source: std::io::Error },

    #[snafu(display("I/O failure while writing the temporary file: {}", source))]
    SinkIo { source: std::io::Error },

    #[snafu(display("HTTP failure while reading the source: {}", message))]
    Http { message: String },

    #[snafu(display("the source stalled for longer than {:?}", stall))]
    Stalled { stall: Duration },

    #[snafu(display("the last line of the input is not terminated"))]
    UnterminatedLine,

    #[snafu(display("the read was interrupted by cancellation"))]
    Interrupted,
}

/// Counters of one successful READ pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    /// Logical lines consumed.
    pub num_rows: u64,
    /// Bytes consumed.
    pub num_bytes: u64,
}

/// Copy `source` into `sink` record by record.
///
/// `stall_timeout` bounds the wait for any single record; `cancelled` is
/// observed between records.
pub async fn copy_records<R, W>(
    source: &mut R,
    sink: &mut W,
    dialect: &CsvDialect,
    record_size: usize,
    stall_timeout: Option<Duration>,
    cancelled: &AtomicBool,
) -> Result<ReadStats, ReadError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let terminator = dialect.lines_terminated_by;
    let mut buf = vec![0_u8; record_size.max(1)];
    let mut stats = ReadStats::default();
    let mut last_byte = None;

    loop {
        if cancelled.load(Ordering::Relaxed) {
            return Err(ReadError::Interrupted);
        }
        let n = match stall_timeout {
            None => source.read(&mut buf).await.context(SourceIoSnafu)?,
            Some(stall) => tokio::time::timeout(stall, source.read(&mut buf))
                .await
                .map_err(|_| ReadError::Stalled { stall })?
                .context(SourceIoSnafu)?,
        };
        if n == 0 {
            break;
        }
        let record = &buf[..n];
        stats.num_bytes += n as u64;
        stats.num_rows += record.iter().filter(|b| **b == terminator).count() as u64;
        last_byte = Some(record[n - 1]);
        sink.write_all(record).await.context(SinkIoSnafu)?;
    }
    sink.flush().await.context(SinkIoSnafu)?;

    match last_byte {
        // An empty input carries zero rows, which is legal.
        None => Ok(stats),
        Some(byte) if byte == terminator => Ok(stats),
        Some(_) => Err(ReadError::UnterminatedLine),
    }
}
