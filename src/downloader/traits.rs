// Backend trait definition

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::errors::DownloadError;
use super::models::{BackendEvent, DownloadOptions, Job, JobId, MediaMetadata};

/// Trait for process-backed media backends
///
/// The orchestrator only talks to this surface, so another extractor can be
/// substituted without touching job bookkeeping.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Name of the backend (for logging)
    fn name(&self) -> &'static str;

    /// Spawn a download and return immediately with a `Downloading` job.
    ///
    /// Progress and the single terminal event for the job are reported
    /// through `emitter`. A cancelled job reports no terminal event.
    async fn download(
        &self,
        url: &str,
        options: &DownloadOptions,
        emitter: ProgressEmitter,
    ) -> Result<Job, DownloadError>;

    /// Kill the live process backing `job_id`.
    ///
    /// Returns `false` when no process was registered for it.
    async fn cancel(&self, job_id: JobId) -> bool;

    /// Metadata-only query; not registered and not cancellable
    async fn get_info(&self, url: &str) -> Result<MediaMetadata, DownloadError>;
}

/// Progress emitter helper
#[derive(Clone)]
pub struct ProgressEmitter {
    tx: mpsc::UnboundedSender<BackendEvent>,
}

impl ProgressEmitter {
    pub fn new(tx: mpsc::UnboundedSender<BackendEvent>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: BackendEvent) {
        // The orchestrator going away mid-download is not the backend's problem.
        let _ = self.tx.send(event);
    }
}
