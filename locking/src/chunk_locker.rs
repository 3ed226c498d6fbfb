//! Exclusive ownership claims on chunks.

use crate::{EmptyOwnerSnafu, Result};
use data_types::Chunk;
use parking_lot::Mutex;
use snafu::ensure;
use std::collections::BTreeMap;

/// Locked chunks grouped by owner.
pub type ChunksByOwner = BTreeMap<String, Vec<Chunk>>;

#[derive(Debug, Default)]
struct State {
    /// The authority: which owner holds each chunk.
    chunk_to_owner: BTreeMap<Chunk, String>,
    /// Derived view kept in step with the authority. Owner rows are removed
    /// as soon as their chunk lists empty out.
    owner_to_chunks: ChunksByOwner,
}

impl State {
    fn release(&mut self, chunk: &Chunk) -> Option<String> {
        let owner = self.chunk_to_owner.remove(chunk)?;
        let chunks = self
            .owner_to_chunks
            .get_mut(&owner)
            .expect("owner row exists for every locked chunk");
        chunks.retain(|c| c != chunk);
        if chunks.is_empty() {
            self.owner_to_chunks.remove(&owner);
        }
        Some(owner)
    }
}

/// A thread-safe registry of exclusive ownership claims on chunks.
///
/// Owners are unique string identifiers, typically job ids. Placement jobs
/// claim every chunk they are about to mutate and release the claims on the
/// terminal event of the mutation (or wholesale at job end), so two jobs
/// never race on the same chunk across the cluster.
#[derive(Debug, Default)]
pub struct ChunkLocker {
    state: Mutex<State>,
}

impl ChunkLocker {
    /// Create an empty locker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the chunk is currently locked.
    pub fn is_locked(&self, chunk: &Chunk) -> bool {
        self.state.lock().chunk_to_owner.contains_key(chunk)
    }

    /// The owner currently holding the chunk, if any.
    pub fn owner_of(&self, chunk: &Chunk) -> Option<String> {
        self.state.lock().chunk_to_owner.get(chunk).cloned()
    }

    /// Locked chunks grouped by owner; restricted to one owner if given.
    pub fn locked(&self, owner: Option<&str>) -> ChunksByOwner {
        let state = self.state.lock();
        match owner {
            None => state.owner_to_chunks.clone(),
            Some(owner) => state
                .owner_to_chunks
                .get(owner)
                .map(|chunks| {
                    let mut one = ChunksByOwner::new();
                    one.insert(owner.to_string(), chunks.clone());
                    one
                })
                .unwrap_or_default(),
        }
    }

    /// Claim a chunk for `owner`.
    ///
    /// Returns `true` if the chunk was unlocked or already held by the same
    /// owner (re-locking is idempotent), `false` if another owner holds it.
    pub fn lock(&self, chunk: &Chunk, owner: &str) -> Result<bool> {
        ensure!(!owner.is_empty(), EmptyOwnerSnafu);

        let mut state = self.state.lock();
        if let Some(current) = state.chunk_to_owner.get(chunk) {
            return Ok(current == owner);
        }
        state
            .chunk_to_owner
            .insert(chunk.clone(), owner.to_string());
        state
            .owner_to_chunks
            .entry(owner.to_string())
            .or_default()
            .push(chunk.clone());
        Ok(true)
    }

    /// Release a chunk, returning the owner that held it, or `None` if it
    /// was not locked.
    pub fn release(&self, chunk: &Chunk) -> Option<String> {
        self.state.lock().release(chunk)
    }

    /// Release every chunk held by `owner` and return them.
    pub fn release_owner(&self, owner: &str) -> Result<Vec<Chunk>> {
        ensure!(!owner.is_empty(), EmptyOwnerSnafu);

        let mut state = self.state.lock();
        let chunks = state.owner_to_chunks.remove(owner).unwrap_or_default();
        for chunk in &chunks {
            state.chunk_to_owner.remove(chunk);
        }
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::Arc;

    #[test]
    fn lock_release_cycle() {
        let locker = ChunkLocker::new();
        let chunk1 = Chunk::new("test", 123);
        let chunk2 = Chunk::new("test", 124);
        let chunk3 = Chunk::new("prod", 125);

        assert!(locker.lock(&chunk1, "qserv").unwrap());
        assert!(locker.lock(&chunk2, "root").unwrap());
        assert!(locker.lock(&chunk3, "qserv").unwrap());

        assert!(locker.is_locked(&chunk1));
        assert_eq!(locker.owner_of(&chunk1).unwrap(), "qserv");

        // Chunks come back in the order they were claimed.
        let released = locker.release_owner("qserv").unwrap();
        assert_eq!(released, vec![chunk1.clone(), chunk3.clone()]);

        assert!(!locker.locked(None).contains_key("qserv"));
        assert!(!locker.is_locked(&chunk1));
        assert!(locker.is_locked(&chunk2));
    }

    #[test]
    fn same_owner_lock_is_idempotent() {
        let locker = ChunkLocker::new();
        let chunk = Chunk::new("test", 1);

        assert!(locker.lock(&chunk, "job-1").unwrap());
        assert!(locker.lock(&chunk, "job-1").unwrap());

        // No duplicate entries piled up.
        let locked = locker.locked(Some("job-1"));
        assert_eq!(locked["job-1"], vec![chunk.clone()]);
        assert_eq!(locker.release_owner("job-1").unwrap(), vec![chunk]);
    }

    #[test]
    fn cross_owner_lock_is_exclusive() {
        let locker = ChunkLocker::new();
        let chunk = Chunk::new("test", 1);

        assert!(locker.lock(&chunk, "job-1").unwrap());
        assert!(!locker.lock(&chunk, "job-2").unwrap());
        assert_eq!(locker.owner_of(&chunk).unwrap(), "job-1");
    }

    #[test]
    fn empty_owner_is_invalid() {
        let locker = ChunkLocker::new();
        let chunk = Chunk::new("test", 1);

        assert_eq!(locker.lock(&chunk, ""), Err(Error::EmptyOwner));
        assert_eq!(locker.release_owner(""), Err(Error::EmptyOwner));
    }

    #[test]
    fn release_reports_previous_owner() {
        let locker = ChunkLocker::new();
        let chunk = Chunk::new("test", 1);

        assert_eq!(locker.release(&chunk), None);
        locker.lock(&chunk, "job-1").unwrap();
        assert_eq!(locker.release(&chunk).unwrap(), "job-1");
        assert_eq!(locker.release(&chunk), None);
    }

    #[test]
    fn owner_rows_are_garbage_collected() {
        let locker = ChunkLocker::new();
        let chunk = Chunk::new("test", 1);

        locker.lock(&chunk, "job-1").unwrap();
        locker.release(&chunk);
        assert!(locker.locked(None).is_empty());
        assert!(locker.locked(Some("job-1")).is_empty());
    }

    #[test]
    fn concurrent_lockers_partition_the_range() {
        let locker = Arc::new(ChunkLocker::new());
        let num_chunks = 1000_u32;

        let threads: Vec<_> = ["owner-a", "owner-b"]
            .into_iter()
            .map(|owner| {
                let locker = Arc::clone(&locker);
                std::thread::spawn(move || {
                    for number in 0..num_chunks {
                        let chunk = Chunk::new("race", number);
                        locker.lock(&chunk, owner).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let locked = locker.locked(None);
        assert!(!locked.is_empty() && locked.len() <= 2);

        let mut all: Vec<Chunk> = locked.values().flatten().cloned().collect();
        all.sort();
        let expected: Vec<Chunk> = (0..num_chunks).map(|n| Chunk::new("race", n)).collect();
        assert_eq!(all, expected);
    }
}
