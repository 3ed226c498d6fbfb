//! Buffers cycling between a producer and the transport.
//!
//! The producer fills a [`StreamBuffer`] and cedes ownership to the
//! transport; the transport sends the bytes and recycles the buffer back
//! over the free channel. Nothing is ever freed from under the side that
//! currently owns a buffer, and the producer can only run ahead of the
//! transport by the number of buffers in flight.

use tokio::sync::mpsc;

/// A fixed-capacity send buffer with a fill level.
#[derive(Debug)]
pub struct StreamBuffer {
    data: Vec<u8>,
    len: usize,
}

impl StreamBuffer {
    /// Allocate a buffer of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0_u8; capacity],
            len: 0,
        }
    }

    /// The writable storage.
    pub fn storage(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Record how many bytes of the storage are filled.
    pub fn set_filled(&mut self, len: usize) {
        assert!(len <= self.data.len());
        self.len = len;
    }

    /// The filled bytes.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

/// A pair of channels cycling `count` buffers of `capacity` bytes between
/// a producer and the transport.
///
/// Returns `(free, full)` ends for the producer and `(full_rx, free_tx)`
/// ends for the transport.
pub fn buffer_cycle(
    capacity: usize,
    count: usize,
) -> (
    mpsc::Receiver<StreamBuffer>,
    mpsc::Sender<StreamBuffer>,
    mpsc::Receiver<StreamBuffer>,
    mpsc::Sender<StreamBuffer>,
) {
    let (free_tx, free_rx) = mpsc::channel(count.max(1));
    let (full_tx, full_rx) = mpsc::channel(count.max(1));
    for _ in 0..count.max(1) {
        free_tx
            .try_send(StreamBuffer::with_capacity(capacity))
            .expect("seeding an empty channel");
    }
    (free_rx, full_tx, full_rx, free_tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffers_cycle_between_producer_and_transport() {
        let (mut free_rx, full_tx, mut full_rx, free_tx) = buffer_cycle(4, 2);
        let chunks: Vec<&[u8]> = vec![b"abcd", b"ef", b"ghij", b"k"];

        let transport = tokio::spawn(async move {
            let mut received = vec![];
            while let Some(buffer) = full_rx.recv().await {
                received.extend_from_slice(buffer.filled());
                // Transport-driven reclamation: the producer gets the
                // allocation back only once the bytes are out.
                if free_tx.send(buffer).await.is_err() {
                    break;
                }
            }
            received
        });

        for chunk in &chunks {
            let mut buffer = free_rx.recv().await.unwrap();
            buffer.storage()[..chunk.len()].copy_from_slice(chunk);
            buffer.set_filled(chunk.len());
            full_tx.send(buffer).await.unwrap();
        }
        drop(full_tx);

        assert_eq!(transport.await.unwrap(), b"abcdefghijk".to_vec());
    }

    #[tokio::test]
    async fn producer_blocks_until_the_transport_recycles() {
        let (mut free_rx, full_tx, mut full_rx, _free_tx) = buffer_cycle(4, 1);

        let buffer = free_rx.recv().await.unwrap();
        full_tx.send(buffer).await.unwrap();

        // The only buffer is held by the transport; the producer cannot
        // proceed until it is recycled.
        assert!(free_rx.try_recv().is_err());
        let held = full_rx.recv().await.unwrap();
        drop(held);
        assert!(free_rx.try_recv().is_err());
    }
}
