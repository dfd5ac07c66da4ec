// Orchestrator - public job API over one backend
//
// Backend events flow through an unbounded channel into a single pump task,
// which is the only place job state changes in response to process output.
// Every state change is published while the registry lock is held, so
// listeners see events in the order the registry applied them.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, OnceCell};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::backends::YtDlpBackend;
use super::config::EngineConfig;
use super::errors::DownloadError;
use super::models::{BackendEvent, DownloadOptions, EngineEvent, Job, JobId, MediaMetadata};
use super::registry::{JobRegistry, JobSubscription};
use super::tools::{BinaryAsset, BinaryProvisioner};
use super::traits::{MediaBackend, ProgressEmitter};

const EVENT_CAPACITY: usize = 256;

/// What `cancel_download` found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was active and is now `cancelled`
    Cancelled,
    /// The job had already finished; nothing changed
    AlreadyTerminal,
    /// No job with that id is tracked
    Unknown,
}

struct Inner {
    config: EngineConfig,
    backend: Arc<dyn MediaBackend>,
    provisioner: BinaryProvisioner,
    asset: BinaryAsset,
    ready: OnceCell<()>,
    registry: Mutex<JobRegistry>,
    notifier: broadcast::Sender<EngineEvent>,
}

impl Inner {
    async fn cancel(&self, job_id: JobId) -> CancelOutcome {
        {
            let mut registry = self.registry.lock().await;
            match registry.get(job_id).map(|job| job.status) {
                None => {
                    debug!(%job_id, "cancel: unknown job");
                    return CancelOutcome::Unknown;
                }
                Some(status) if status.is_terminal() => {
                    debug!(%job_id, ?status, "cancel: job already finished");
                    return CancelOutcome::AlreadyTerminal;
                }
                Some(_) => {
                    if let Some(event) = registry.mark_cancelled(job_id) {
                        let _ = self.notifier.send(event);
                    }
                }
            }
        }

        let killed = self.backend.cancel(job_id).await;
        info!(%job_id, killed, "job cancelled");
        CancelOutcome::Cancelled
    }

    async fn expire(&self, job_id: JobId, limit: Duration) {
        {
            let mut registry = self.registry.lock().await;
            let message = format!("Download timed out after {:?}", limit);
            match registry.mark_failed(job_id, message) {
                Some(event) => {
                    let _ = self.notifier.send(event);
                }
                None => return,
            }
        }
        warn!(%job_id, ?limit, "job exceeded its time limit");
        self.backend.cancel(job_id).await;
    }
}

/// Owns the backend, the provisioner and the job registry.
///
/// Construct it once at startup (inside a Tokio runtime) and call
/// [`shutdown`](Self::shutdown) on exit.
pub struct DownloadOrchestrator {
    inner: Arc<Inner>,
    events: mpsc::UnboundedSender<BackendEvent>,
    pump: JoinHandle<()>,
}

impl DownloadOrchestrator {
    /// yt-dlp backed orchestrator using the binary under `config.bin_dir`
    pub fn new(config: EngineConfig) -> Self {
        let provisioner = BinaryProvisioner::new(&config);
        Self::with_provisioner(config, provisioner)
    }

    /// Same as [`new`](Self::new) with a custom provisioner, e.g. one that
    /// reports provisioning status to an observer
    pub fn with_provisioner(config: EngineConfig, provisioner: BinaryProvisioner) -> Self {
        let asset = BinaryAsset::yt_dlp(&config.bin_dir);
        let backend = Arc::new(YtDlpBackend::new(asset.local_path.clone(), &config));
        Self::assemble(config, backend, provisioner, asset)
    }

    /// Orchestrator over an arbitrary backend
    pub fn with_backend(config: EngineConfig, backend: Arc<dyn MediaBackend>) -> Self {
        let provisioner = BinaryProvisioner::new(&config);
        let asset = BinaryAsset::yt_dlp(&config.bin_dir);
        Self::assemble(config, backend, provisioner, asset)
    }

    fn assemble(
        config: EngineConfig,
        backend: Arc<dyn MediaBackend>,
        provisioner: BinaryProvisioner,
        asset: BinaryAsset,
    ) -> Self {
        let (notifier, _) = broadcast::channel(EVENT_CAPACITY);
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            backend,
            provisioner,
            asset,
            ready: OnceCell::new(),
            registry: Mutex::new(JobRegistry::new()),
            notifier,
        });
        let pump = tokio::spawn(pump_events(inner.clone(), rx));
        Self {
            inner,
            events,
            pump,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Provision the executable once per orchestrator. A failure is not
    /// remembered, so the next call tries again.
    pub async fn ensure_ready(&self) -> Result<(), DownloadError> {
        let inner = &self.inner;
        inner
            .ready
            .get_or_try_init(|| async {
                inner.provisioner.ensure_ready(&inner.asset).await?;
                match inner.provisioner.probe_version(&inner.asset).await {
                    Some(version) => info!(backend = inner.backend.name(), %version, "engine ready"),
                    None => info!(backend = inner.backend.name(), "engine ready"),
                }
                Ok::<(), DownloadError>(())
            })
            .await?;
        Ok(())
    }

    /// Metadata query; creates no job
    pub async fn get_media_info(&self, url: &str) -> Result<MediaMetadata, DownloadError> {
        self.ensure_ready().await?;
        self.inner.backend.get_info(url).await
    }

    /// Spawn a download and return its job in `downloading` status.
    ///
    /// Nothing is registered when the process cannot be started; the caller
    /// only gets the error.
    pub async fn start_download(
        &self,
        url: &str,
        options: DownloadOptions,
    ) -> Result<Job, DownloadError> {
        self.ensure_ready().await?;
        tokio::fs::create_dir_all(&options.output_dir).await?;

        let inner = &self.inner;
        // Held across the spawn so no event can reach the pump before the
        // job is registered.
        let mut registry = inner.registry.lock().await;

        if let Some(limit) = inner.config.max_concurrent_jobs {
            if registry.active_count() >= limit {
                warn!(%url, limit, "refusing download, too many active jobs");
                return Err(DownloadError::ConcurrencyLimit { limit });
            }
        }

        let emitter = ProgressEmitter::new(self.events.clone());
        match inner.backend.download(url, &options, emitter).await {
            Ok(job) => {
                info!(job_id = %job.id, %url, backend = inner.backend.name(), "job started");
                registry.insert(job.clone());
                drop(registry);
                if let Some(limit) = inner.config.job_timeout {
                    self.arm_deadline(job.id, limit);
                }
                Ok(job)
            }
            Err(e) => {
                warn!(%url, backend = inner.backend.name(), "failed to start download: {}", e);
                Err(e)
            }
        }
    }

    fn arm_deadline(&self, job_id: JobId, limit: Duration) {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            if let Some(inner) = inner.upgrade() {
                inner.expire(job_id, limit).await;
            }
        });
    }

    /// Mark the job `cancelled` and kill its process. Safe to repeat.
    pub async fn cancel_download(&self, job_id: JobId) -> CancelOutcome {
        self.inner.cancel(job_id).await
    }

    /// Cancel every active job; returns once all of them are terminal.
    pub async fn cancel_all(&self) -> usize {
        let ids = self.inner.registry.lock().await.active_ids();
        let mut pending = JoinSet::new();
        for job_id in ids {
            let inner = self.inner.clone();
            pending.spawn(async move { inner.cancel(job_id).await });
        }

        let mut cancelled = 0;
        while let Some(result) = pending.join_next().await {
            match result {
                Ok(CancelOutcome::Cancelled) => cancelled += 1,
                Ok(_) => {}
                Err(e) => warn!("cancel task failed: {}", e),
            }
        }
        info!(cancelled, "cancelled all active jobs");
        cancelled
    }

    pub async fn jobs(&self) -> Vec<Job> {
        self.inner.registry.lock().await.list()
    }

    pub async fn job(&self, job_id: JobId) -> Option<Job> {
        self.inner.registry.lock().await.get(job_id).cloned()
    }

    /// Drop a finished job from the registry
    pub async fn reap(&self, job_id: JobId) -> Option<Job> {
        self.inner.registry.lock().await.reap(job_id)
    }

    pub async fn reap_terminal(&self) -> Vec<Job> {
        self.inner.registry.lock().await.reap_terminal()
    }

    /// Events for one job, ending after its terminal event
    pub async fn subscribe(&self, job_id: JobId) -> Option<JobSubscription> {
        self.inner.registry.lock().await.subscribe(job_id)
    }

    /// Events for every job
    pub fn subscribe_all(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.notifier.subscribe()
    }

    /// Cancel everything and stop processing events
    pub async fn shutdown(self) {
        let cancelled = self.cancel_all().await;
        self.pump.abort();
        info!(cancelled, "orchestrator shut down");
    }
}

impl Drop for DownloadOrchestrator {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump_events(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<BackendEvent>) {
    while let Some(event) = rx.recv().await {
        let mut registry = inner.registry.lock().await;
        if let Some(published) = registry.apply(event) {
            if published.is_terminal() {
                info!(job_id = %published.job_id(), ?published, "job finished");
            }
            let _ = inner.notifier.send(published);
        }
    }
    debug!("event pump stopped");
}
