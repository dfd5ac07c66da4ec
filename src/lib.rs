pub mod commands;
pub mod downloader;

pub use commands::{download_media, DownloadOutcome, DownloadRequest, OutputFormat, QualityPreset};
pub use downloader::{
    CancelOutcome, DownloadError, DownloadOptions, DownloadOrchestrator, EngineConfig, EngineEvent,
    Job, JobId, JobStatus, MediaKind, MediaMetadata,
};
