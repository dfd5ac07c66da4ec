// Engine configuration

use std::path::PathBuf;
use std::time::Duration;

/// Retry behaviour for fetching a missing executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay after attempt `n` is `n * base_delay`
    pub base_delay: Duration,
    /// Connect timeout, and the longest a transfer may go without receiving data
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Backoff to sleep after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(15),
        }
    }
}

/// Configuration shared by the provisioner, the backend and the orchestrator
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding provisioned executables
    pub bin_dir: PathBuf,
    /// Default download directory for the command layer
    pub output_dir: PathBuf,
    /// SOCKS5/HTTP proxy URL
    pub proxy: Option<String>,
    /// Socket timeout handed to the executable, in seconds
    pub socket_timeout: Option<u32>,
    pub provision: RetryPolicy,
    /// Bound on a metadata query
    pub info_timeout: Duration,
    /// None means unbounded
    pub max_concurrent_jobs: Option<usize>,
    /// None means a job may run forever
    pub job_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bin_dir: dirs::data_local_dir()
                .map(|d| d.join("media-downloader").join("bin"))
                .unwrap_or_else(|| PathBuf::from("bin")),
            output_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            proxy: None,
            socket_timeout: None,
            provision: RetryPolicy::default(),
            info_timeout: Duration::from_secs(60),
            max_concurrent_jobs: None,
            job_timeout: None,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `MEDIA_DOWNLOADER_*` environment variables
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    fn overlay(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = var("MEDIA_DOWNLOADER_BIN_DIR") {
            self.bin_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("MEDIA_DOWNLOADER_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(proxy) = var("MEDIA_DOWNLOADER_PROXY").filter(|p| !p.trim().is_empty()) {
            self.proxy = Some(proxy);
        }
        match var("MEDIA_DOWNLOADER_MAX_JOBS").map(|v| v.parse::<usize>()) {
            Some(Ok(limit)) if limit > 0 => self.max_concurrent_jobs = Some(limit),
            Some(_) => tracing::warn!("ignoring invalid MEDIA_DOWNLOADER_MAX_JOBS"),
            None => {}
        }
        match var("MEDIA_DOWNLOADER_JOB_TIMEOUT_SECS").map(|v| v.parse::<u64>()) {
            Some(Ok(secs)) if secs > 0 => self.job_timeout = Some(Duration::from_secs(secs)),
            Some(_) => tracing::warn!("ignoring invalid MEDIA_DOWNLOADER_JOB_TIMEOUT_SECS"),
            None => {}
        }
        self
    }

    pub fn with_bin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = dir.into();
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_socket_timeout(mut self, seconds: Option<u32>) -> Self {
        self.socket_timeout = seconds;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.provision = policy;
        self
    }

    pub fn with_info_timeout(mut self, timeout: Duration) -> Self {
        self.info_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, limit: Option<usize>) -> Self {
        self.max_concurrent_jobs = limit;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }
}
