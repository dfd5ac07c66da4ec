// Common data models for the acquisition engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

use super::utils::sanitize_filename;

/// Globally unique job identifier, generated when a download is spawned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// What kind of stream to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Fixed container the strict format selector produces
    pub fn container_ext(&self) -> &'static str {
        match self {
            Self::Audio => "m4a",
            Self::Video => "mp4",
        }
    }
}

/// Download options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadOptions {
    pub format: MediaKind,
    /// "best", "worst" or a height cap such as "720p"
    pub quality: String,
    pub output_dir: PathBuf,
    /// File stem without extension; defaults to the media title
    pub filename_template: Option<String>,
}

impl DownloadOptions {
    pub fn audio(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            format: MediaKind::Audio,
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    pub fn video(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            format: MediaKind::Video,
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_quality(mut self, quality: impl Into<String>) -> Self {
        self.quality = quality.into();
        self
    }

    pub fn with_filename_template(mut self, template: Option<String>) -> Self {
        self.filename_template = template;
        self
    }

    fn file_stem(&self) -> Option<String> {
        self.filename_template
            .as_deref()
            .map(sanitize_filename)
            .filter(|stem| !stem.is_empty())
    }

    /// `--output` template handed to yt-dlp
    pub fn output_template(&self) -> PathBuf {
        match self.file_stem() {
            Some(stem) => self.output_dir.join(format!("{}.%(ext)s", stem)),
            None => self.output_dir.join("%(title)s.%(ext)s"),
        }
    }

    /// Output file path when it can be known before the process runs
    pub fn expected_output_path(&self) -> Option<PathBuf> {
        self.file_stem().map(|stem| {
            self.output_dir
                .join(format!("{}.{}", stem, self.format.container_ext()))
        })
    }
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            format: MediaKind::Video,
            quality: "best".to_string(),
            output_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            filename_template: None,
        }
    }
}

/// Job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states are absorbing
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One tracked download request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub url: String,
    pub options: DownloadOptions,
    pub status: JobStatus,
    pub progress: Option<f32>,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub output_path: Option<PathBuf>,
}

impl Job {
    pub fn new(id: JobId, url: &str, options: DownloadOptions) -> Self {
        let output_path = options.expected_output_path();
        Self {
            id,
            url: url.to_string(),
            options,
            status: JobStatus::Pending,
            progress: None,
            error: None,
            created_at: OffsetDateTime::now_utc(),
            output_path,
        }
    }
}

/// Result of a metadata-only query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub title: String,
    pub author: String,
    /// Seconds
    pub duration: f64,
    pub thumbnail: Option<String>,
    pub source_url: String,
}

/// Progress notification for one job, percent already clamped to [0, 100]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub percent: f32,
}

/// Raw events a backend reports for the jobs it spawned
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Progress(ProgressEvent),
    /// The process announced where it writes the final file
    Destination { job_id: JobId, path: PathBuf },
    Completed { job_id: JobId },
    Failed { job_id: JobId, message: String },
}

impl BackendEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Progress(p) => p.job_id,
            Self::Destination { job_id, .. }
            | Self::Completed { job_id }
            | Self::Failed { job_id, .. } => *job_id,
        }
    }
}

/// Events the orchestrator publishes to the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Progress { job_id: JobId, percent: f32 },
    Completed {
        job_id: JobId,
        output_path: Option<PathBuf>,
    },
    Failed { job_id: JobId, message: String },
    Cancelled { job_id: JobId },
}

impl EngineEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Progress { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id } => *job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}
