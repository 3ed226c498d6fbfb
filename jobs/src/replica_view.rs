//! The in-memory replica view fed by FindAll passes and consumed by every
//! planning job.

use data_types::{Chunk, Replica};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

/// Replicas grouped by chunk.
///
/// A worker "holds a chunk" when it holds a replica of at least one
/// database of the chunk's family; collocation means it should then hold
/// replicas of every database of the family.
#[derive(Debug, Default)]
pub struct ReplicaView {
    state: Mutex<BTreeMap<Chunk, Vec<Replica>>>,
}

impl ReplicaView {
    /// Create an empty view.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the recorded state of one family with a fresh scan.
    pub fn replace_family(&self, family: &str, replicas: Vec<Replica>) {
        let mut state = self.state.lock();
        state.retain(|chunk, _| chunk.family != family);
        for replica in replicas {
            state.entry(replica.chunk.clone()).or_default().push(replica);
        }
    }

    /// Record one more replica.
    pub fn add(&self, replica: Replica) {
        let mut state = self.state.lock();
        let replicas = state.entry(replica.chunk.clone()).or_default();
        replicas.retain(|r| !(r.worker == replica.worker && r.database == replica.database));
        replicas.push(replica);
    }

    /// Drop the record of one worker's replica of one database of a chunk.
    pub fn remove(&self, chunk: &Chunk, worker: &str, database: &str) {
        let mut state = self.state.lock();
        if let Some(replicas) = state.get_mut(chunk) {
            replicas.retain(|r| !(r.worker == worker && r.database == database));
            if replicas.is_empty() {
                state.remove(chunk);
            }
        }
    }

    /// Drop every replica recorded for a worker.
    pub fn remove_worker(&self, worker: &str) {
        let mut state = self.state.lock();
        state.retain(|_, replicas| {
            replicas.retain(|r| r.worker != worker);
            !replicas.is_empty()
        });
    }

    /// All chunks of a family.
    pub fn chunks(&self, family: &str) -> Vec<Chunk> {
        self.state
            .lock()
            .keys()
            .filter(|chunk| chunk.family == family)
            .cloned()
            .collect()
    }

    /// All recorded replicas of a chunk.
    pub fn replicas_of(&self, chunk: &Chunk) -> Vec<Replica> {
        self.state.lock().get(chunk).cloned().unwrap_or_default()
    }

    /// Workers holding at least one database's replica of the chunk.
    pub fn workers_with(&self, chunk: &Chunk) -> BTreeSet<String> {
        self.state
            .lock()
            .get(chunk)
            .map(|replicas| replicas.iter().map(|r| r.worker.clone()).collect())
            .unwrap_or_default()
    }

    /// Workers holding the chunk for one specific database.
    pub fn workers_with_database(&self, chunk: &Chunk, database: &str) -> BTreeSet<String> {
        self.state
            .lock()
            .get(chunk)
            .map(|replicas| {
                replicas
                    .iter()
                    .filter(|r| r.database == database)
                    .map(|r| r.worker.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of distinct chunks of the family each listed worker holds.
    /// Workers without replicas report zero.
    pub fn chunk_counts(&self, family: &str, workers: &[String]) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> =
            workers.iter().map(|w| (w.clone(), 0)).collect();
        let state = self.state.lock();
        for (chunk, replicas) in state.iter() {
            if chunk.family != family {
                continue;
            }
            let holders: BTreeSet<&str> = replicas.iter().map(|r| r.worker.as_str()).collect();
            for holder in holders {
                if let Some(count) = counts.get_mut(holder) {
                    *count += 1;
                }
            }
        }
        counts
    }
}
