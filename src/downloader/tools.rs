// Provisioning of the external executables the engine shells out to

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::config::{EngineConfig, RetryPolicy};
use super::errors::DownloadError;
use super::utils::run_output_with_timeout;

const YT_DLP_RELEASES: &str = "https://github.com/yt-dlp/yt-dlp/releases/latest/download";

/// One required executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryAsset {
    pub name: String,
    /// (OS name as in `std::env::consts::OS`, download URL)
    pub sources: Vec<(String, String)>,
    pub local_path: PathBuf,
    /// Set the POSIX executable bit after download
    pub executable: bool,
}

impl BinaryAsset {
    /// yt-dlp standalone builds published on GitHub releases
    pub fn yt_dlp(bin_dir: &Path) -> Self {
        let file_name = if cfg!(windows) { "yt-dlp.exe" } else { "yt-dlp" };
        Self {
            name: "yt-dlp".to_string(),
            sources: vec![
                ("windows".to_string(), format!("{}/yt-dlp.exe", YT_DLP_RELEASES)),
                ("macos".to_string(), format!("{}/yt-dlp_macos", YT_DLP_RELEASES)),
                ("linux".to_string(), format!("{}/yt-dlp", YT_DLP_RELEASES)),
            ],
            local_path: bin_dir.join(file_name),
            executable: !cfg!(windows),
        }
    }

    pub fn source_for(&self, os: &str) -> Option<&str> {
        self.sources
            .iter()
            .find(|(platform, _)| platform == os)
            .map(|(_, url)| url.as_str())
    }

    pub fn is_present(&self) -> bool {
        self.local_path.is_file()
    }

    fn part_path(&self) -> PathBuf {
        let mut name = self.local_path.as_os_str().to_owned();
        name.push(".part");
        PathBuf::from(name)
    }
}

/// Provisioning progress as seen by an observer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "percent", rename_all = "lowercase")]
pub enum ProvisionStatus {
    Missing,
    Progress(f32),
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionEvent {
    pub binary: String,
    pub status: ProvisionStatus,
}

/// Makes sure required executables exist locally and are runnable
pub struct BinaryProvisioner {
    policy: RetryPolicy,
    proxy: Option<String>,
    observer: Option<mpsc::UnboundedSender<ProvisionEvent>>,
}

impl BinaryProvisioner {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            policy: config.provision.clone(),
            proxy: config.proxy.clone(),
            observer: None,
        }
    }

    /// Status notifications go to `observer`; a closed receiver is ignored
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<ProvisionEvent>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Returns `Ok(true)` once `asset` is present, downloading it if needed
    pub async fn ensure_ready(&self, asset: &BinaryAsset) -> Result<bool, DownloadError> {
        self.ensure_ready_on(asset, std::env::consts::OS).await
    }

    async fn ensure_ready_on(&self, asset: &BinaryAsset, os: &str) -> Result<bool, DownloadError> {
        if asset.is_present() {
            debug!(binary = %asset.name, path = %asset.local_path.display(), "binary present");
            self.notify(&asset.name, ProvisionStatus::Completed);
            return Ok(true);
        }

        info!(binary = %asset.name, path = %asset.local_path.display(), "binary missing, downloading");
        self.notify(&asset.name, ProvisionStatus::Missing);

        let Some(url) = asset.source_for(os) else {
            self.notify(&asset.name, ProvisionStatus::Error);
            return Err(DownloadError::BinaryMissing {
                name: asset.name.clone(),
                platform: os.to_string(),
            });
        };

        if let Some(parent) = asset.local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let client = self.http_client().map_err(|message| {
            self.notify(&asset.name, ProvisionStatus::Error);
            DownloadError::BinaryDownload {
                name: asset.name.clone(),
                attempts: 0,
                message,
            }
        })?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch_once(&client, url, asset).await {
                Ok(bytes) => {
                    info!(binary = %asset.name, bytes, attempt, "binary downloaded");
                    break;
                }
                Err(message) => {
                    let _ = tokio::fs::remove_file(asset.part_path()).await;
                    warn!(
                        binary = %asset.name,
                        "download failed (attempt {}/{}): {}",
                        attempt, self.policy.max_attempts, message
                    );
                    if attempt >= self.policy.max_attempts {
                        self.notify(&asset.name, ProvisionStatus::Error);
                        return Err(DownloadError::BinaryDownload {
                            name: asset.name.clone(),
                            attempts: attempt,
                            message,
                        });
                    }
                    tokio::time::sleep(self.policy.delay_for(attempt)).await;
                }
            }
        }

        if asset.executable {
            if let Err(e) = make_executable(&asset.local_path).await {
                self.notify(&asset.name, ProvisionStatus::Error);
                return Err(e.into());
            }
        }

        self.notify(&asset.name, ProvisionStatus::Completed);
        Ok(true)
    }

    /// `--version` output of an installed asset, if it runs at all
    pub async fn probe_version(&self, asset: &BinaryAsset) -> Option<String> {
        let program = asset.local_path.to_string_lossy();
        match run_output_with_timeout(&program, vec!["--version".to_string()], 10).await {
            Ok(output) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
            }
            Ok(_) => None,
            Err(e) => {
                debug!(binary = %asset.name, "version probe failed: {}", e);
                None
            }
        }
    }

    fn http_client(&self) -> Result<reqwest::Client, String> {
        let mut builder = reqwest::Client::builder().connect_timeout(self.policy.attempt_timeout);
        if let Some(proxy_url) = self.proxy.as_deref() {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| format!("invalid proxy {}: {}", proxy_url, e))?;
            builder = builder.proxy(proxy);
        }
        builder
            .build()
            .map_err(|e| format!("failed to build HTTP client: {}", e))
    }

    /// One streaming GET into `<path>.part`, renamed into place when non-empty
    async fn fetch_once(
        &self,
        client: &reqwest::Client,
        url: &str,
        asset: &BinaryAsset,
    ) -> Result<u64, String> {
        let idle = self.policy.attempt_timeout;
        let mut response = timeout(idle, client.get(url).send())
            .await
            .map_err(|_| format!("no response within {:?}", idle))?
            .map_err(|e| format!("request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {}", status));
        }

        let total = response.content_length().filter(|len| *len > 0);
        let part = asset.part_path();
        let mut file = tokio::fs::File::create(&part)
            .await
            .map_err(|e| format!("cannot create {}: {}", part.display(), e))?;

        let mut received: u64 = 0;
        // A slow transfer is fine as long as it keeps moving.
        while let Some(chunk) = timeout(idle, response.chunk())
            .await
            .map_err(|_| format!("transfer stalled after {} bytes", received))?
            .map_err(|e| format!("read failed after {} bytes: {}", received, e))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| format!("write failed: {}", e))?;
            received += chunk.len() as u64;
            if let Some(total) = total {
                self.notify(&asset.name, ProvisionStatus::Progress(percent_of(received, total)));
            }
        }
        file.flush().await.map_err(|e| format!("flush failed: {}", e))?;
        drop(file);

        if received == 0 {
            return Err("downloaded file is empty".to_string());
        }

        tokio::fs::rename(&part, &asset.local_path)
            .await
            .map_err(|e| format!("cannot move {} into place: {}", part.display(), e))?;
        Ok(received)
    }

    fn notify(&self, binary: &str, status: ProvisionStatus) {
        if let Some(tx) = &self.observer {
            let _ = tx.send(ProvisionEvent {
                binary: binary.to_string(),
                status,
            });
        }
    }
}

/// Percentage rounded to one decimal, capped at 100
fn percent_of(received: u64, total: u64) -> f32 {
    let percent = (received as f64 / total as f64 * 100.0).min(100.0);
    ((percent * 10.0).round() / 10.0) as f32
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
