//! Batch validation state machine.
//!
//! A batch runs end-to-end inside one worker: plan, spawn, await readiness,
//! probe every listener, terminate. When a batched core never becomes ready
//! (one malformed descriptor can keep the whole process from binding its
//! listeners), the batch degrades to per-descriptor singleton validation
//! instead of discarding its results.
//!
//! Termination is unconditional: every successfully started process is
//! terminated on every path out of this module, and each worker keeps its
//! configuration artifacts in a scoped temporary directory so they are
//! removed however the batch ends.

use std::path::Path;
use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::ValidatorConfig;
use crate::descriptor::Candidate;
use crate::ports::PortRange;
use crate::probe::{DeadReason, ProbeOutcome, Prober};
use crate::supervisor::ProcessHost;
use crate::synth::{BatchPlan, SynthError};

/// Verdict for one candidate.
#[derive(Debug, Clone)]
pub struct ProbeRecord {
    /// The candidate that was probed.
    pub candidate: Candidate,
    /// Its outcome.
    pub outcome: ProbeOutcome,
}

/// Error that aborts the run, not just a batch.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ValidateError {
    /// The core binary is missing or unstartable.
    #[error(transparent)]
    Supervisor(#[from] crate::supervisor::SupervisorError),

    /// A configuration artifact could not be produced.
    #[error(transparent)]
    Synth(#[from] SynthError),

    /// The worker's scratch directory could not be created.
    #[error("failed to create scratch directory: {0}")]
    Workdir(#[source] std::io::Error),
}

/// Validates one batch of candidates against one spawned core process,
/// falling back to singletons when the batched core fails to start.
#[derive(Clone)]
pub struct BatchValidator {
    host: Arc<dyn ProcessHost>,
    prober: Arc<dyn Prober>,
    config: Arc<ValidatorConfig>,
}

impl BatchValidator {
    /// Assemble a validator from its capabilities.
    #[must_use]
    pub fn new(
        host: Arc<dyn ProcessHost>,
        prober: Arc<dyn Prober>,
        config: Arc<ValidatorConfig>,
    ) -> Self {
        Self {
            host,
            prober,
            config,
        }
    }

    /// Validate one batch end-to-end.
    ///
    /// Returns one record per planned candidate. Candidates that produced
    /// no usable outbound are excluded up front and yield no record.
    ///
    /// # Errors
    ///
    /// Only run-fatal conditions propagate: a missing/unstartable binary or
    /// an unwritable scratch directory. Readiness timeouts and probe
    /// failures are absorbed into the records.
    pub async fn validate_batch(
        &self,
        batch_index: usize,
        candidates: &[Candidate],
    ) -> Result<Vec<ProbeRecord>, ValidateError> {
        let start_port = self
            .config
            .ports
            .batch_start(batch_index, self.config.batch_size);
        let plan = BatchPlan::new(candidates, start_port);
        if plan.is_empty() {
            return Ok(Vec::new());
        }

        // Scratch directory is dropped (and removed) on every path out.
        let workdir = tempfile::tempdir().map_err(ValidateError::Workdir)?;
        let config_path = plan.write_config(workdir.path())?;

        let mut process = self.host.start(&config_path).await?;
        let ready = process
            .await_ready(&plan.ports(), self.config.batch_startup_timeout)
            .await;

        if ready {
            sleep(self.config.settle_delay).await;
            let mut records = Vec::with_capacity(plan.entries.len());
            for entry in &plan.entries {
                let outcome = self.prober.probe(entry.port).await;
                log_outcome(&entry.candidate, &outcome);
                records.push(ProbeRecord {
                    candidate: entry.candidate.clone(),
                    outcome,
                });
            }
            process.terminate().await;
            return Ok(records);
        }

        debug!(
            batch_index,
            start_port, "batch core never became ready; degrading to singletons"
        );
        process.terminate().await;

        let mut records = Vec::with_capacity(plan.entries.len());
        for (attempt, entry) in plan.entries.iter().enumerate() {
            let record = self
                .validate_singleton(workdir.path(), start_port, attempt, &entry.candidate)
                .await?;
            records.push(record);
        }
        Ok(records)
    }

    /// Validate one candidate against its own single-listener core.
    ///
    /// A singleton that fails readiness is recorded dead; it never aborts
    /// the other singletons of the batch.
    async fn validate_singleton(
        &self,
        workdir: &Path,
        batch_start: u16,
        attempt: usize,
        candidate: &Candidate,
    ) -> Result<ProbeRecord, ValidateError> {
        let port = PortRange::singleton_port(batch_start, self.config.batch_size, attempt);
        let plan = BatchPlan::singleton(candidate, port);
        let config_path = plan.write_config(workdir)?;

        let mut process = self.host.start(&config_path).await?;
        let ready = process
            .await_ready(&[port], self.config.singleton_startup_timeout)
            .await;

        let outcome = if ready {
            sleep(self.config.settle_delay).await;
            self.prober.probe(port).await
        } else {
            ProbeOutcome::Dead {
                reason: DeadReason::Other("startup-timeout".to_string()),
            }
        };
        process.terminate().await;

        log_outcome(candidate, &outcome);
        Ok(ProbeRecord {
            candidate: candidate.clone(),
            outcome,
        })
    }
}

fn log_outcome(candidate: &Candidate, outcome: &ProbeOutcome) {
    match outcome {
        ProbeOutcome::Live { latency_ms } => info!(
            endpoint = %candidate.descriptor.endpoint(),
            latency_ms,
            tag = %candidate.descriptor.tag,
            "live"
        ),
        ProbeOutcome::Dead { reason } => debug!(
            endpoint = %candidate.descriptor.endpoint(),
            %reason,
            tag = %candidate.descriptor.tag,
            "dead"
        ),
    }
}
