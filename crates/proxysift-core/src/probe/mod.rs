//! Liveness probing through local SOCKS listeners.
//!
//! One canonical request, one fixed expected status, no retries. Retry
//! policy belongs to the batch validator; this module only classifies a
//! single attempt.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::trace;

/// Outcome of probing one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The canonical request succeeded within the latency budget.
    Live {
        /// Wall-clock time of the request itself, excluding process
        /// startup.
        latency_ms: u64,
    },
    /// The request failed.
    Dead {
        /// Short classification of the failure.
        reason: DeadReason,
    },
}

impl ProbeOutcome {
    /// Latency when live.
    #[must_use]
    pub fn latency_ms(&self) -> Option<u64> {
        match self {
            Self::Live { latency_ms } => Some(*latency_ms),
            Self::Dead { .. } => None,
        }
    }
}

/// Short classification of a failed probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadReason {
    /// The connection could not be established in time.
    ConnectTimeout,
    /// The connection was established but the response did not arrive in
    /// time.
    ReadTimeout,
    /// A response arrived with an unexpected status code.
    WrongStatus(u16),
    /// Anything else, truncated for log hygiene.
    Other(String),
}

impl std::fmt::Display for DeadReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectTimeout => f.write_str("connect-timeout"),
            Self::ReadTimeout => f.write_str("read-timeout"),
            Self::WrongStatus(code) => write!(f, "wrong-status({code})"),
            Self::Other(detail) => write!(f, "other({detail})"),
        }
    }
}

/// Capability to probe one local listener.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Issue the canonical test request through `127.0.0.1:<local_port>`.
    async fn probe(&self, local_port: u16) -> ProbeOutcome;
}

/// HTTP prober: routes a GET to the canonical target through the local
/// SOCKS listener and expects the configured status code.
#[derive(Debug, Clone)]
pub struct HttpProber {
    target: String,
    expect_status: u16,
    timeout: Duration,
    connect_timeout: Duration,
}

impl HttpProber {
    /// Create a prober for the canonical target.
    #[must_use]
    pub fn new(
        target: String,
        expect_status: u16,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            target,
            expect_status,
            timeout,
            connect_timeout,
        }
    }

    fn client_for(&self, local_port: u16) -> Result<reqwest::Client, reqwest::Error> {
        let proxy = reqwest::Proxy::all(format!("socks5://127.0.0.1:{local_port}"))?;
        reqwest::Client::builder()
            .proxy(proxy)
            // Endpoint certificates are routinely self-signed or fronted;
            // liveness, not trust, is being measured.
            .danger_accept_invalid_certs(true)
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .build()
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, local_port: u16) -> ProbeOutcome {
        let client = match self.client_for(local_port) {
            Ok(client) => client,
            Err(error) => {
                return ProbeOutcome::Dead {
                    reason: DeadReason::Other(truncate_error(&error)),
                };
            },
        };

        let started = Instant::now();
        match client.get(&self.target).send().await {
            Ok(response) => {
                let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                let status = response.status().as_u16();
                trace!(local_port, status, latency_ms, "probe response");
                if status == self.expect_status {
                    ProbeOutcome::Live { latency_ms }
                } else {
                    ProbeOutcome::Dead {
                        reason: DeadReason::WrongStatus(status),
                    }
                }
            },
            Err(error) => ProbeOutcome::Dead {
                reason: classify(&error),
            },
        }
    }
}

fn classify(error: &reqwest::Error) -> DeadReason {
    if error.is_timeout() {
        if error.is_connect() {
            DeadReason::ConnectTimeout
        } else {
            DeadReason::ReadTimeout
        }
    } else {
        DeadReason::Other(truncate_error(error))
    }
}

/// Keep failure detail short, the way the run log wants it.
fn truncate_error(error: &dyn std::error::Error) -> String {
    let mut detail = error.to_string();
    detail.truncate(40);
    detail
}
