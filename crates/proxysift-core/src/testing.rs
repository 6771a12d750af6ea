//! Test doubles shared by the engine's unit tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ValidatorConfig;
use crate::descriptor::Candidate;
use crate::probe::{ProbeOutcome, Prober};
use crate::supervisor::{ProcessHost, ProxyProcess, SupervisorError};

/// Host whose processes report readiness from a script: start number `n`
/// consults `ready_pattern[n]` (last entry repeats). Counts starts and
/// terminations so tests can assert the pairing invariant.
pub struct StubHost {
    ready_pattern: Vec<bool>,
    starts: AtomicUsize,
    terminates: Arc<AtomicUsize>,
    fail_spawn: bool,
}

impl StubHost {
    pub fn new(ready_pattern: Vec<bool>) -> Self {
        Self {
            ready_pattern,
            starts: AtomicUsize::new(0),
            terminates: Arc::new(AtomicUsize::new(0)),
            fail_spawn: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            ready_pattern: Vec::new(),
            starts: AtomicUsize::new(0),
            terminates: Arc::new(AtomicUsize::new(0)),
            fail_spawn: true,
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn terminates(&self) -> usize {
        self.terminates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessHost for StubHost {
    async fn start(&self, _config: &Path) -> Result<Box<dyn ProxyProcess>, SupervisorError> {
        if self.fail_spawn {
            return Err(SupervisorError::Spawn {
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no binary"),
            });
        }
        let index = self.starts.fetch_add(1, Ordering::SeqCst);
        let ready = self
            .ready_pattern
            .get(index)
            .or(self.ready_pattern.last())
            .copied()
            .unwrap_or(false);
        Ok(Box::new(StubProcess {
            ready,
            terminates: Arc::clone(&self.terminates),
        }))
    }
}

struct StubProcess {
    ready: bool,
    terminates: Arc<AtomicUsize>,
}

#[async_trait]
impl ProxyProcess for StubProcess {
    async fn await_ready(&mut self, _ports: &[u16], _deadline: Duration) -> bool {
        self.ready
    }

    async fn terminate(&mut self) {
        self.terminates.fetch_add(1, Ordering::SeqCst);
    }
}

/// Prober that always answers the same outcome.
pub struct ConstProber {
    outcome: ProbeOutcome,
    probes: AtomicUsize,
}

impl ConstProber {
    pub fn live(latency_ms: u64) -> Self {
        Self {
            outcome: ProbeOutcome::Live { latency_ms },
            probes: AtomicUsize::new(0),
        }
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for ConstProber {
    async fn probe(&self, _local_port: u16) -> ProbeOutcome {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}

/// Prober that replays a fixed sequence of outcomes in probe order; the
/// last outcome repeats once the script runs out.
pub struct SequenceProber {
    outcomes: Mutex<VecDeque<ProbeOutcome>>,
    last: ProbeOutcome,
}

impl SequenceProber {
    pub fn new(outcomes: Vec<ProbeOutcome>) -> Self {
        let last = outcomes
            .last()
            .cloned()
            .unwrap_or(ProbeOutcome::Live { latency_ms: 0 });
        Self {
            outcomes: Mutex::new(outcomes.into()),
            last,
        }
    }
}

#[async_trait]
impl Prober for SequenceProber {
    async fn probe(&self, _local_port: u16) -> ProbeOutcome {
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.last.clone())
    }
}

/// Configuration with instant timeouts, sized for stub-backed tests.
pub fn quick_config(batch_size: usize) -> Arc<ValidatorConfig> {
    Arc::new(ValidatorConfig {
        batch_size,
        settle_delay: Duration::ZERO,
        batch_startup_timeout: Duration::from_millis(10),
        singleton_startup_timeout: Duration::from_millis(10),
        ..ValidatorConfig::default()
    })
}

/// `n` distinct parseable candidates.
pub fn candidates(n: usize) -> Vec<Candidate> {
    (0..n)
        .map(|i| Candidate::from_line(&format!("vless://u{i}@192.0.2.{}:443", i + 1)).unwrap())
        .collect()
}
