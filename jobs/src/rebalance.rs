//! The Rebalance job: even out chunk counts across workers.

use crate::common::{new_job_id, release_chunks, wait_for, Job, JobContext, JobOptions, JobOutcome};
use crate::find_all::scan_family;
use crate::replicate::execute_placements;
use crate::ChunkError;
use controller::RequestOptions;
use data_types::Chunk;
use observability_deps::tracing::info;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One planned move of a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Move {
    /// The chunk to move.
    pub chunk: Chunk,
    /// The over-loaded worker losing the chunk.
    pub source: String,
    /// The under-loaded worker receiving it.
    pub destination: String,
}

/// Result data of a Rebalance job.
#[derive(Debug, Clone, Default)]
pub struct RebalanceResult {
    /// The plan; in estimate mode this is the entire output.
    pub plan: Vec<Move>,
    /// Moves fully applied (replicated to the destination and deleted from
    /// the source).
    pub moved: Vec<Move>,
    /// Per-chunk failures.
    pub errors: Vec<ChunkError>,
}

/// Moves chunks from over-average to under-average workers without
/// changing any chunk's replication level.
///
/// Destination ties are broken toward the lexicographically smallest
/// worker name, so the plan for one input state is deterministic.
#[derive(Debug)]
pub struct RebalanceJob {
    id: String,
    family: String,
    estimate_only: bool,
    options: JobOptions,
    result: Mutex<RebalanceResult>,
}

impl RebalanceJob {
    /// Create the job.
    pub fn new(family: impl Into<String>, estimate_only: bool, options: JobOptions) -> Arc<Self> {
        Arc::new(Self {
            id: new_job_id("rebalance"),
            family: family.into(),
            estimate_only,
            options,
            result: Mutex::new(RebalanceResult::default()),
        })
    }

    /// A snapshot of the result data.
    pub fn result(&self) -> RebalanceResult {
        self.result.lock().clone()
    }
}

/// Compute the move plan for the given per-worker chunk holdings.
///
/// Donors give chunks away while above the average; each chunk goes to the
/// least loaded worker not already holding it.
pub(crate) fn plan_moves(
    counts: &std::collections::BTreeMap<String, usize>,
    holdings: &[(Chunk, BTreeSet<String>)],
) -> Vec<Move> {
    if counts.is_empty() {
        return vec![];
    }
    let total: usize = counts.values().sum();
    let avg = total / counts.len();

    let mut counts = counts.clone();
    let mut moves = vec![];
    for (chunk, holders) in holdings {
        // Pick the most loaded holder as the donor for this chunk.
        let Some(donor) = holders
            .iter()
            .filter(|w| counts.contains_key(*w))
            .max_by_key(|w| (counts[*w], std::cmp::Reverse((*w).clone())))
            .cloned()
        else {
            continue;
        };
        if counts[&donor] <= avg {
            continue;
        }
        // And the least loaded non-holder as the acceptor; ties go to the
        // smallest name.
        let Some(acceptor) = counts
            .iter()
            .filter(|(w, _)| !holders.contains(*w))
            .min_by_key(|(w, count)| (**count, (*w).clone()))
            .map(|(w, _)| w.clone())
        else {
            continue;
        };
        if counts[&acceptor] >= avg {
            continue;
        }
        *counts.get_mut(&donor).expect("donor counted") -= 1;
        *counts.get_mut(&acceptor).expect("acceptor counted") += 1;
        moves.push(Move {
            chunk: chunk.clone(),
            source: donor,
            destination: acceptor,
        });
    }
    moves
}

#[async_trait::async_trait]
impl Job for RebalanceJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "REBALANCE"
    }

    fn options(&self) -> JobOptions {
        self.options
    }

    async fn execute(self: Arc<Self>, ctx: JobContext, cancel: CancellationToken) -> JobOutcome {
        let Some(scan) = scan_family(&ctx, &self.family, &self.id, &cancel).await else {
            release_chunks(&ctx, &self.id);
            return JobOutcome::Cancelled;
        };
        ctx.replicas
            .replace_family(&self.family, scan.replicas.clone());
        let mut errors = scan.errors;

        let config = &ctx.controller.context().config;
        let worker_names: Vec<String> = match config.active_workers() {
            Ok(workers) => workers.into_iter().map(|w| w.name).collect(),
            Err(_) => {
                release_chunks(&ctx, &self.id);
                return JobOutcome::Failed;
            }
        };
        let databases: Vec<String> = match config.databases_of_family(&self.family, true) {
            Ok(databases) => databases.into_iter().map(|db| db.name).collect(),
            Err(_) => {
                release_chunks(&ctx, &self.id);
                return JobOutcome::Failed;
            }
        };

        let counts = ctx.replicas.chunk_counts(&self.family, &worker_names);
        let holdings: Vec<(Chunk, BTreeSet<String>)> = ctx
            .replicas
            .chunks(&self.family)
            .into_iter()
            .map(|chunk| {
                let holders = ctx.replicas.workers_with(&chunk);
                (chunk, holders)
            })
            .collect();
        let plan = plan_moves(&counts, &holdings);
        info!(job_id=%self.id, family=%self.family, moves=plan.len(),
              estimate_only=self.estimate_only, "rebalance plan computed");

        if self.estimate_only {
            *self.result.lock() = RebalanceResult {
                plan,
                moved: vec![],
                errors,
            };
            release_chunks(&ctx, &self.id);
            return JobOutcome::Success;
        }

        // A move is a replicate to the destination followed by a delete
        // from the source; the replication level never dips.
        let mut moved = vec![];
        for step in &plan {
            if cancel.is_cancelled() {
                break;
            }
            let (created, mut create_errors) = execute_placements(
                &ctx,
                &self.id,
                vec![(step.chunk.clone(), step.source.clone(), step.destination.clone())],
                &databases,
                &cancel,
            )
            .await;
            if !create_errors.is_empty() {
                errors.append(&mut create_errors);
                continue;
            }
            for replica in &created {
                ctx.replicas.add(replica.clone());
            }

            let mut deleted = true;
            for database in &databases {
                let reply = wait_for(|callback| {
                    ctx.controller.delete_replica(
                        &step.source,
                        database,
                        step.chunk.number,
                        RequestOptions {
                            job_id: Some(self.id.clone()),
                            ..Default::default()
                        },
                        callback,
                    )
                })
                .await;
                match reply {
                    Ok(result) if result.is_success() => {
                        ctx.replicas.remove(&step.chunk, &step.source, database);
                    }
                    Ok(result) => {
                        deleted = false;
                        errors.push(ChunkError {
                            chunk: step.chunk.clone(),
                            worker: step.source.clone(),
                            database: database.clone(),
                            message: format!("{:?}: {}", result.status, result.message),
                        });
                    }
                    Err(message) => {
                        deleted = false;
                        errors.push(ChunkError {
                            chunk: step.chunk.clone(),
                            worker: step.source.clone(),
                            database: database.clone(),
                            message,
                        });
                    }
                }
            }
            if deleted {
                moved.push(step.clone());
            }
        }

        let outcome = if cancel.is_cancelled() {
            JobOutcome::Cancelled
        } else if errors.is_empty() {
            JobOutcome::Success
        } else {
            JobOutcome::Failed
        };
        *self.result.lock() = RebalanceResult { plan, moved, errors };
        release_chunks(&ctx, &self.id);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn holdings(entries: &[(u32, &[&str])]) -> Vec<(Chunk, BTreeSet<String>)> {
        entries
            .iter()
            .map(|(number, workers)| {
                (
                    Chunk::new("prod", *number),
                    workers.iter().map(|w| w.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn moves_flow_from_over_to_under_average() {
        let counts: BTreeMap<String, usize> = [
            ("w1".to_string(), 4),
            ("w2".to_string(), 0),
        ]
        .into_iter()
        .collect();
        let holdings = holdings(&[
            (1, &["w1"]),
            (2, &["w1"]),
            (3, &["w1"]),
            (4, &["w1"]),
        ]);

        let moves = plan_moves(&counts, &holdings);
        // avg = 2; two chunks move over, then both sides sit at the average.
        assert_eq!(moves.len(), 2);
        assert!(moves.iter().all(|m| m.source == "w1" && m.destination == "w2"));
    }

    #[test]
    fn ties_break_toward_the_smallest_worker_name() {
        let counts: BTreeMap<String, usize> = [
            ("w1".to_string(), 3),
            ("w2".to_string(), 0),
            ("w3".to_string(), 0),
        ]
        .into_iter()
        .collect();
        let holdings = holdings(&[(1, &["w1"]), (2, &["w1"]), (3, &["w1"])]);

        let moves = plan_moves(&counts, &holdings);
        assert_eq!(moves.len(), 2);
        // w2 and w3 are equally empty; w2 wins the first move.
        assert_eq!(moves[0].destination, "w2");
    }

    #[test]
    fn balanced_holdings_produce_no_moves() {
        let counts: BTreeMap<String, usize> = [
            ("w1".to_string(), 1),
            ("w2".to_string(), 1),
        ]
        .into_iter()
        .collect();
        let holdings = holdings(&[(1, &["w1"]), (2, &["w2"])]);
        assert!(plan_moves(&counts, &holdings).is_empty());
    }

    #[test]
    fn never_moves_a_chunk_onto_a_holder() {
        let counts: BTreeMap<String, usize> = [
            ("w1".to_string(), 2),
            ("w2".to_string(), 2),
            ("w3".to_string(), 0),
        ]
        .into_iter()
        .collect();
        // Every chunk already lives on both loaded workers.
        let holdings = holdings(&[(1, &["w1", "w2"]), (2, &["w1", "w2"])]);

        let moves = plan_moves(&counts, &holdings);
        for m in &moves {
            assert_eq!(m.destination, "w3");
        }
    }
}
