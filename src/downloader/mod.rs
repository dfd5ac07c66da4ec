// Downloader module - provisioning, process backend and job bookkeeping

pub mod backends;
pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod format_selector;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod tools;
pub mod traits;
pub mod utils;

pub use backends::YtDlpBackend;
pub use config::{EngineConfig, RetryPolicy};
pub use errors::DownloadError;
pub use models::{
    DownloadOptions, EngineEvent, Job, JobId, JobStatus, MediaKind, MediaMetadata, ProgressEvent,
};
pub use orchestrator::{CancelOutcome, DownloadOrchestrator};
pub use registry::JobSubscription;
pub use tools::{BinaryAsset, BinaryProvisioner, ProvisionEvent, ProvisionStatus};
pub use traits::{MediaBackend, ProgressEmitter};
