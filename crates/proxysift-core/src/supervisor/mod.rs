//! External core process supervision.
//!
//! The engine's only means of testing an endpoint is an external,
//! sometimes-flaky core binary. This module wraps it behind a capability
//! interface (start, await readiness, terminate) so the rest of the
//! system never touches process machinery directly.
//!
//! The central resource-safety invariant lives here: every successful
//! `start` is paired with a `terminate` on every code path, and `terminate`
//! reaps the whole process group because some core builds spawn helper
//! subprocesses.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, warn};

/// Names probed when no explicit binary path is given.
const BINARY_CANDIDATES: [&str; 2] = ["xray", "xray.exe"];

/// Interval between readiness polls.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Per-attempt connect timeout during readiness polling.
const READY_CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// How many leading listeners are sampled before a batch counts as ready.
///
/// Readiness is a latency/availability trade-off, not a correctness
/// guarantee: the per-descriptor probe is the real source of truth.
const READY_SAMPLE_PORTS: usize = 3;

/// Supervision error.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SupervisorError {
    /// The core binary could not be located.
    #[error("core binary not found ({searched}); install xray or pass an explicit path")]
    BinaryNotFound {
        /// What was searched.
        searched: String,
    },

    /// The core binary exists but could not be started.
    #[error("failed to spawn core process: {source}")]
    Spawn {
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Capability to start core processes against a configuration artifact.
#[async_trait]
pub trait ProcessHost: Send + Sync {
    /// Spawn a core process running the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Spawn`] when the binary cannot be
    /// executed. This is fatal for the run; there is no per-batch recovery
    /// from a missing binary.
    async fn start(&self, config: &Path) -> Result<Box<dyn ProxyProcess>, SupervisorError>;
}

/// Handle to one running core process.
#[async_trait]
pub trait ProxyProcess: Send {
    /// Wait until the process looks ready to accept connections.
    ///
    /// Ready means at least one of the first [`READY_SAMPLE_PORTS`] assigned
    /// ports accepts a TCP connection before the deadline.
    async fn await_ready(&mut self, ports: &[u16], deadline: Duration) -> bool {
        let lead: Vec<u16> = ports.iter().copied().take(READY_SAMPLE_PORTS).collect();
        let started = Instant::now();
        while started.elapsed() < deadline {
            for port in &lead {
                if port_connectable(*port).await {
                    return true;
                }
            }
            sleep(READY_POLL_INTERVAL).await;
        }
        false
    }

    /// Terminate the process and reap its children.
    ///
    /// Idempotent and always safe to call; failure to kill is logged and
    /// never blocks the run.
    async fn terminate(&mut self);
}

/// True when a local listener accepts a TCP connection on `port`.
pub async fn port_connectable(port: u16) -> bool {
    matches!(
        timeout(READY_CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Locate the core binary: explicit path, then `$PATH`, then the working
/// directory.
///
/// # Errors
///
/// Returns [`SupervisorError::BinaryNotFound`] when no candidate exists.
pub fn locate_binary(explicit: Option<&Path>) -> Result<PathBuf, SupervisorError> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(SupervisorError::BinaryNotFound {
            searched: path.display().to_string(),
        });
    }

    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            for name in BINARY_CANDIDATES {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }
    }

    for name in BINARY_CANDIDATES {
        let candidate = Path::new(".").join(name);
        if candidate.is_file() {
            return Ok(candidate.canonicalize().unwrap_or(candidate));
        }
    }

    Err(SupervisorError::BinaryNotFound {
        searched: "$PATH and working directory".to_string(),
    })
}

/// The one platform-appropriate [`ProcessHost`]: spawns the located binary
/// with `run -c <config>`, all standard streams discarded.
#[derive(Debug, Clone)]
pub struct CoreHost {
    binary: PathBuf,
    kill_grace: Duration,
}

impl CoreHost {
    /// Create a host for a located binary.
    #[must_use]
    pub fn new(binary: PathBuf, kill_grace: Duration) -> Self {
        Self { binary, kill_grace }
    }
}

#[async_trait]
impl ProcessHost for CoreHost {
    async fn start(&self, config: &Path) -> Result<Box<dyn ProxyProcess>, SupervisorError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("run")
            .arg("-c")
            .arg(config)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // Last-resort cleanup if a worker unwinds without terminating.
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|source| SupervisorError::Spawn { source })?;
        let pid = child.id();
        debug!(pid, config = %config.display(), "core process started");

        Ok(Box::new(CoreProcess {
            child,
            pid,
            kill_grace: self.kill_grace,
            terminated: false,
        }))
    }
}

/// A spawned core process.
struct CoreProcess {
    child: Child,
    pid: Option<u32>,
    kill_grace: Duration,
    terminated: bool,
}

#[async_trait]
impl ProxyProcess for CoreProcess {
    async fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            // The child leads its own process group, so signalling the
            // group reaps helper subprocesses too.
            let group = Pid::from_raw(pid as i32);
            let _ = killpg(group, Signal::SIGTERM);
            if timeout(self.kill_grace, self.child.wait()).await.is_ok() {
                return;
            }
            let _ = killpg(group, Signal::SIGKILL);
        }

        if let Err(error) = self.child.kill().await {
            warn!(pid = self.pid, %error, "failed to kill core process");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoProcess;

    #[async_trait]
    impl ProxyProcess for NoProcess {
        async fn terminate(&mut self) {}
    }

    #[test]
    fn locate_explicit_path_must_exist() {
        let missing = Path::new("/nonexistent/xray-binary");
        let result = locate_binary(Some(missing));
        assert!(matches!(
            result,
            Err(SupervisorError::BinaryNotFound { .. })
        ));
    }

    #[test]
    fn locate_explicit_path_is_returned_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("xray");
        std::fs::write(&binary, b"#!/bin/sh\n").unwrap();
        let located = locate_binary(Some(&binary)).unwrap();
        assert_eq!(located, binary);
    }

    #[tokio::test]
    async fn readiness_sees_a_bound_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut process = NoProcess;
        let ready = process
            .await_ready(&[port], Duration::from_secs(2))
            .await;
        assert!(ready);
    }

    #[tokio::test]
    async fn readiness_times_out_without_a_listener() {
        // Bind-then-drop to find a port nothing listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut process = NoProcess;
        let ready = process
            .await_ready(&[port], Duration::from_millis(300))
            .await;
        assert!(!ready);
    }

    #[tokio::test]
    async fn readiness_samples_later_ports_when_the_first_is_dead() {
        let dead_port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let live_port = listener.local_addr().unwrap().port();

        let mut process = NoProcess;
        let ready = process
            .await_ready(&[dead_port, live_port], Duration::from_secs(2))
            .await;
        assert!(ready);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawned_process_is_terminated_and_terminate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-core");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let host = CoreHost::new(script, Duration::from_millis(200));
        let config = dir.path().join("config.json");
        std::fs::write(&config, b"{}").unwrap();

        let mut process = host.start(&config).await.unwrap();
        process.terminate().await;
        // A second call must be a no-op.
        process.terminate().await;
    }

    #[tokio::test]
    async fn spawn_of_missing_binary_is_an_error() {
        let host = CoreHost::new(
            PathBuf::from("/nonexistent/core-binary"),
            Duration::from_millis(100),
        );
        let result = host.start(Path::new("/tmp/none.json")).await;
        assert!(matches!(result, Err(SupervisorError::Spawn { .. })));
    }
}
