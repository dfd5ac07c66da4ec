// Error types for the acquisition engine

use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by provisioning, the process backend and the orchestrator.
///
/// Per-job failures are reported through job events instead; a variant here
/// only reaches a caller when the request itself could not be carried out.
#[derive(Debug, Clone, Error, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DownloadError {
    /// Required executable is absent and this platform has no download source
    #[error("{name} is missing and cannot be fetched automatically on {platform}")]
    BinaryMissing { name: String, platform: String },

    /// Fetching the executable failed after every retry
    #[error("failed to download {name} after {attempts} attempt(s): {message}")]
    BinaryDownload {
        name: String,
        attempts: u32,
        message: String,
    },

    /// The OS refused to start the child process
    #[error("failed to start process: {0}")]
    ProcessSpawn(String),

    /// Exit code mapped to "no stream matches the strict format selector"
    #[error("format unavailable: {0}")]
    FormatUnavailable(String),

    /// Metadata stdout was not valid JSON or lacked a required field
    #[error("metadata parse error: {0}")]
    MetadataParse(String),

    /// Metadata query exited nonzero or timed out
    #[error("metadata query failed: {0}")]
    MetadataFetch(String),

    /// Configured cap on concurrently active jobs is reached
    #[error("too many active downloads (limit {limit})")]
    ConcurrencyLimit { limit: usize },

    /// A job a caller was waiting on ended in `failed`
    #[error("download failed: {0}")]
    JobFailed(String),

    /// A job a caller was waiting on was cancelled
    #[error("download was cancelled")]
    JobCancelled,

    /// Filesystem error while preparing directories or files
    #[error("I/O error: {0}")]
    Io(String),
}

impl DownloadError {
    /// Provisioning errors block the whole engine, everything else is per request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BinaryMissing { .. } | Self::BinaryDownload { .. })
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for DownloadError {
    fn from(err: serde_json::Error) -> Self {
        Self::MetadataParse(err.to_string())
    }
}
