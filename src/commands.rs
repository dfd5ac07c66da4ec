// Commands exposed to the presentation layer
//
// Requests arrive already validated; these functions translate them into
// orchestrator calls and wait for the outcome where the caller expects one.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use crate::downloader::diagnostics::FORMAT_UNAVAILABLE;
use crate::downloader::utils::sanitize_filename;
use crate::downloader::{
    CancelOutcome, DownloadError, DownloadOptions, DownloadOrchestrator, EngineEvent, JobId,
    MediaKind, MediaMetadata,
};

/// Stem used when a title sanitizes to nothing
const FALLBACK_STEM: &str = "download";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp3,
    #[default]
    M4a,
    Mp4,
}

impl OutputFormat {
    pub fn media_kind(&self) -> MediaKind {
        match self {
            Self::Mp4 => MediaKind::Video,
            Self::Mp3 | Self::M4a => MediaKind::Audio,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    #[default]
    High,
    Medium,
    Low,
}

impl QualityPreset {
    pub fn selector_quality(&self) -> &'static str {
        match self {
            Self::Low => "worst",
            Self::High | Self::Medium => "best",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default)]
    pub quality: QualityPreset,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            format: OutputFormat::default(),
            quality: QualityPreset::default(),
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_quality(mut self, quality: QualityPreset) -> Self {
        self.quality = quality;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DownloadOutcome {
    /// The file was already on disk; no process was started
    Exists {
        file_path: PathBuf,
        title: String,
        duration: f64,
    },
    Completed {
        job_id: JobId,
        file_path: PathBuf,
        title: String,
        duration: f64,
    },
}

/// Fetch one URL into the configured output directory and wait for it.
///
/// `on_progress` sees every progress value of the job, in order.
pub async fn download_media(
    orchestrator: &DownloadOrchestrator,
    request: DownloadRequest,
    mut on_progress: impl FnMut(f32) + Send,
) -> Result<DownloadOutcome, DownloadError> {
    let MediaMetadata {
        title, duration, ..
    } = orchestrator.get_media_info(&request.url).await?;

    let mut stem = sanitize_filename(&title);
    if stem.is_empty() {
        stem = FALLBACK_STEM.to_string();
    }
    let options = DownloadOptions {
        format: request.format.media_kind(),
        quality: request.quality.selector_quality().to_string(),
        output_dir: orchestrator.config().output_dir.clone(),
        filename_template: Some(stem),
    };
    let expected = options
        .expected_output_path()
        .ok_or_else(|| DownloadError::Io("could not derive an output path".to_string()))?;

    if tokio::fs::try_exists(&expected).await.unwrap_or(false) {
        info!(path = %expected.display(), "already downloaded, skipping");
        return Ok(DownloadOutcome::Exists {
            file_path: expected,
            title,
            duration,
        });
    }

    // Subscribed before starting so not even the first event is missed.
    let events = orchestrator.subscribe_all();
    let job = orchestrator.start_download(&request.url, options).await?;
    let output_path = wait_for_completion(orchestrator, events, job.id, &mut on_progress).await?;

    Ok(DownloadOutcome::Completed {
        job_id: job.id,
        file_path: output_path.unwrap_or(expected),
        title,
        duration,
    })
}

/// Follow `job_id` on the shared event stream until it finishes.
///
/// If the stream overflowed, the rest is read from the job's own
/// subscription, which replays the outcome of a job that already ended.
async fn wait_for_completion(
    orchestrator: &DownloadOrchestrator,
    mut events: broadcast::Receiver<EngineEvent>,
    job_id: JobId,
    on_progress: &mut impl FnMut(f32),
) -> Result<Option<PathBuf>, DownloadError> {
    loop {
        match events.recv().await {
            Ok(event) if event.job_id() == job_id => {
                if let Some(outcome) = settle(event, on_progress) {
                    return outcome;
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(%job_id, skipped, "event listener fell behind, following the job directly");
                break;
            }
            Err(RecvError::Closed) => {
                return Err(DownloadError::JobFailed("engine stopped".to_string()));
            }
        }
    }

    let mut subscription = orchestrator
        .subscribe(job_id)
        .await
        .ok_or_else(|| DownloadError::JobFailed("job is no longer tracked".to_string()))?;
    while let Some(event) = subscription.next().await {
        if let Some(outcome) = settle(event, on_progress) {
            return outcome;
        }
    }
    Err(DownloadError::JobFailed("engine stopped".to_string()))
}

/// `Some` once the event ends the job
fn settle(
    event: EngineEvent,
    on_progress: &mut impl FnMut(f32),
) -> Option<Result<Option<PathBuf>, DownloadError>> {
    match event {
        EngineEvent::Progress { percent, .. } => {
            on_progress(percent);
            None
        }
        EngineEvent::Completed { output_path, .. } => Some(Ok(output_path)),
        EngineEvent::Failed { message, .. } if message == FORMAT_UNAVAILABLE => {
            Some(Err(DownloadError::FormatUnavailable(message)))
        }
        EngineEvent::Failed { message, .. } => Some(Err(DownloadError::JobFailed(message))),
        EngineEvent::Cancelled { .. } => Some(Err(DownloadError::JobCancelled)),
    }
}

/// Unparseable ids are treated like unknown ones
pub async fn cancel_download(orchestrator: &DownloadOrchestrator, job_id: &str) -> CancelOutcome {
    match job_id.parse::<JobId>() {
        Ok(id) => orchestrator.cancel_download(id).await,
        Err(_) => CancelOutcome::Unknown,
    }
}

pub async fn get_media_info(
    orchestrator: &DownloadOrchestrator,
    url: &str,
) -> Result<MediaMetadata, DownloadError> {
    orchestrator.get_media_info(url).await
}

pub async fn cancel_all(orchestrator: &DownloadOrchestrator) -> usize {
    orchestrator.cancel_all().await
}
