//! Input and output artifacts.
//!
//! Input is a UTF-8 text stream with one endpoint URI per line; lines that
//! do not parse are dropped silently. Output is the surviving URIs, one per
//! line, in the order the ranker produced.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::descriptor::{Candidate, clean_line};
use crate::scheduler::LiveEndpoint;

/// What the reader saw in the input stream.
#[derive(Debug, Clone, Copy)]
pub struct InputStats {
    /// Total lines in the stream.
    pub lines: usize,
    /// Lines that parsed into candidates.
    pub parsed: usize,
}

/// I/O error tied to the artifact it concerns.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum OutputError {
    /// The input artifact is missing or unreadable; fatal for the run.
    #[error("cannot read input {path}: {source}")]
    ReadInput {
        /// Input path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The output artifact could not be written.
    #[error("cannot write output {path}: {source}")]
    WriteOutput {
        /// Output path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Read candidates from an input file.
///
/// Non-parsing lines are dropped; each drop is logged at debug level with
/// its reason, never surfaced as an error.
///
/// # Errors
///
/// Returns [`OutputError::ReadInput`] when the file cannot be read at all.
pub async fn read_candidates(path: &Path) -> Result<(Vec<Candidate>, InputStats), OutputError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| OutputError::ReadInput {
            path: path.to_path_buf(),
            source,
        })?;

    let mut lines = 0usize;
    let mut candidates = Vec::new();
    for line in content.lines() {
        if clean_line(line).is_empty() {
            continue;
        }
        lines += 1;
        match Candidate::from_line(line) {
            Ok(candidate) => candidates.push(candidate),
            Err(reason) => {
                debug!(%reason, "dropping unparseable line");
            },
        }
    }

    let stats = InputStats {
        lines,
        parsed: candidates.len(),
    };
    Ok((candidates, stats))
}

/// Write the ranked survivors, one URI per line.
///
/// # Errors
///
/// Returns [`OutputError::WriteOutput`] when the file cannot be written.
pub async fn write_survivors(path: &Path, survivors: &[LiveEndpoint]) -> Result<(), OutputError> {
    let mut body = String::new();
    for endpoint in survivors {
        body.push_str(&endpoint.candidate.url);
        body.push('\n');
    }
    tokio::fs::write(path, body)
        .await
        .map_err(|source| OutputError::WriteOutput {
            path: path.to_path_buf(),
            source,
        })
}
