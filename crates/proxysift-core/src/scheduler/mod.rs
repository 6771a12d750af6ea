//! Bounded-concurrency validation scheduling.
//!
//! Partitions the candidate list into fixed-size batches and runs each one
//! end-to-end on a worker drawn from a bounded pool. Workers are fully
//! independent; the only shared state is the merged live list, the failure
//! slot, and the processed counter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::ValidatorConfig;
use crate::descriptor::Candidate;
use crate::probe::ProbeOutcome;
use crate::validator::{BatchValidator, ValidateError};

/// One surviving endpoint with its measured latency.
#[derive(Debug, Clone)]
pub struct LiveEndpoint {
    /// The candidate that answered the probe.
    pub candidate: Candidate,
    /// Measured request latency.
    pub latency_ms: u64,
}

/// Merged result of one validation run.
#[derive(Debug)]
pub struct RunOutcome {
    /// Endpoints that answered the canonical probe, unordered.
    pub live: Vec<LiveEndpoint>,
    /// Candidates submitted to workers.
    pub processed: usize,
    /// Candidates that were actually probed or fell back.
    pub tested: usize,
}

impl RunOutcome {
    /// Candidates that were tested and did not answer.
    #[must_use]
    pub fn dead(&self) -> usize {
        self.tested.saturating_sub(self.live.len())
    }
}

/// Runs batches on a bounded worker pool and merges their results.
pub struct ValidationScheduler {
    validator: BatchValidator,
    config: Arc<ValidatorConfig>,
}

impl ValidationScheduler {
    /// Create a scheduler around a validator.
    #[must_use]
    pub fn new(validator: BatchValidator, config: Arc<ValidatorConfig>) -> Self {
        Self { validator, config }
    }

    /// Validate every candidate and merge the live results.
    ///
    /// Batches never block each other beyond their own deadlines; one slow
    /// batch delays only its own worker.
    ///
    /// # Errors
    ///
    /// Returns the first run-fatal error any worker hit (missing binary,
    /// unwritable scratch space). In-flight workers are drained before the
    /// error is returned, so no process outlives the run.
    pub async fn run(&self, candidates: Vec<Candidate>) -> Result<RunOutcome, ValidateError> {
        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let live = Arc::new(Mutex::new(Vec::new()));
        let processed = Arc::new(AtomicUsize::new(0));
        let tested = Arc::new(AtomicUsize::new(0));
        let first_error: Arc<Mutex<Option<ValidateError>>> = Arc::new(Mutex::new(None));

        let total = candidates.len();
        let mut workers = JoinSet::new();

        for (batch_index, chunk) in candidates.chunks(self.config.batch_size).enumerate() {
            let chunk = chunk.to_vec();
            let validator = self.validator.clone();
            let semaphore = Arc::clone(&semaphore);
            let live = Arc::clone(&live);
            let processed = Arc::clone(&processed);
            let tested = Arc::clone(&tested);
            let first_error = Arc::clone(&first_error);

            workers.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                // A fatal error has no per-batch recovery; spare the
                // remaining batches once one worker reported it.
                if first_error.lock().unwrap().is_some() {
                    return;
                }

                let outcome = validator.validate_batch(batch_index, &chunk).await;
                processed.fetch_add(chunk.len(), Ordering::SeqCst);
                match outcome {
                    Ok(records) => {
                        tested.fetch_add(records.len(), Ordering::SeqCst);
                        let mut merged = live.lock().unwrap();
                        for record in records {
                            if let ProbeOutcome::Live { latency_ms } = record.outcome {
                                merged.push(LiveEndpoint {
                                    candidate: record.candidate,
                                    latency_ms,
                                });
                            }
                        }
                    },
                    Err(error) => {
                        let mut slot = first_error.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(error);
                        }
                    },
                }
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(error) = joined {
                warn!(%error, "validation worker aborted");
            }
        }

        if let Some(error) = first_error.lock().unwrap().take() {
            return Err(error);
        }

        let live = Arc::try_unwrap(live)
            .map(|m| m.into_inner().unwrap())
            .unwrap_or_default();
        let outcome = RunOutcome {
            live,
            processed: processed.load(Ordering::SeqCst),
            tested: tested.load(Ordering::SeqCst),
        };
        debug!(
            total,
            processed = outcome.processed,
            live = outcome.live.len(),
            "validation run merged"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::probe::DeadReason;
    use crate::testing::{ConstProber, SequenceProber, StubHost, candidates, quick_config};

    fn scheduler(host: Arc<StubHost>, prober: Arc<dyn crate::probe::Prober>, batch: usize)
    -> ValidationScheduler {
        let config = quick_config(batch);
        let validator = BatchValidator::new(host, prober, Arc::clone(&config));
        ValidationScheduler::new(validator, config)
    }

    #[tokio::test]
    async fn merges_live_results_across_batches() {
        let host = Arc::new(StubHost::new(vec![true]));
        let prober = Arc::new(ConstProber::live(30));
        let outcome = scheduler(Arc::clone(&host), prober, 2)
            .run(candidates(5))
            .await
            .unwrap();

        // 5 candidates in batches of 2 -> 3 workers, each with one core.
        assert_eq!(host.starts(), 3);
        assert_eq!(host.terminates(), 3);
        assert_eq!(outcome.processed, 5);
        assert_eq!(outcome.tested, 5);
        assert_eq!(outcome.live.len(), 5);
        assert_eq!(outcome.dead(), 0);
    }

    #[tokio::test]
    async fn keeps_only_live_outcomes() {
        let host = Arc::new(StubHost::new(vec![true]));
        let prober = Arc::new(SequenceProber::new(vec![
            ProbeOutcome::Live { latency_ms: 120 },
            ProbeOutcome::Live { latency_ms: 80 },
            ProbeOutcome::Dead {
                reason: DeadReason::ReadTimeout,
            },
        ]));
        let outcome = scheduler(host, prober, 10).run(candidates(3)).await.unwrap();

        assert_eq!(outcome.live.len(), 2);
        assert_eq!(outcome.dead(), 1);
        let mut latencies: Vec<u64> = outcome.live.iter().map(|l| l.latency_ms).collect();
        latencies.sort_unstable();
        assert_eq!(latencies, vec![80, 120]);
    }

    #[tokio::test]
    async fn fatal_worker_error_fails_the_run() {
        let host = Arc::new(StubHost::failing());
        let prober = Arc::new(ConstProber::live(1));
        let result = scheduler(host, prober, 2).run(candidates(6)).await;
        assert!(matches!(result, Err(ValidateError::Supervisor(_))));
    }

    #[tokio::test]
    async fn two_live_one_timeout_writes_exactly_the_live_pair_in_latency_order() {
        let host = Arc::new(StubHost::new(vec![true]));
        let prober = Arc::new(SequenceProber::new(vec![
            ProbeOutcome::Live { latency_ms: 120 },
            ProbeOutcome::Live { latency_ms: 80 },
            ProbeOutcome::Dead {
                reason: DeadReason::ReadTimeout,
            },
        ]));
        let outcome = scheduler(host, prober, 10).run(candidates(3)).await.unwrap();

        let (ranked, _) = crate::dedup::dedupe_and_rank(outcome.live);
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("live.txt");
        crate::output::write_survivors(&out_path, &ranked).await.unwrap();

        let written = tokio::fs::read_to_string(&out_path).await.unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        // Candidate #2 (80 ms) outranks candidate #1 (120 ms).
        assert_eq!(lines[0], "vless://u1@192.0.2.2:443");
        assert_eq!(lines[1], "vless://u0@192.0.2.1:443");
    }

    #[tokio::test]
    async fn empty_input_produces_an_empty_outcome() {
        let host = Arc::new(StubHost::new(vec![true]));
        let prober = Arc::new(ConstProber::live(1));
        let outcome = scheduler(Arc::clone(&host), prober, 2)
            .run(Vec::new())
            .await
            .unwrap();
        assert_eq!(outcome.processed, 0);
        assert!(outcome.live.is_empty());
        assert_eq!(host.starts(), 0);
    }
}
