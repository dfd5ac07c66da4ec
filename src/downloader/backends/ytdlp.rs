// yt-dlp process backend
//
// Every download is one child process. The process table maps a job id to a
// kill switch and the task monitoring that process; the monitor owns the
// `Child`, streams stdout into progress events and reports exactly one
// terminal event unless the job was cancelled first.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::downloader::config::EngineConfig;
use crate::downloader::diagnostics::exit_failure_message;
use crate::downloader::errors::DownloadError;
use crate::downloader::format_selector::FormatSelector;
use crate::downloader::models::{
    BackendEvent, DownloadOptions, Job, JobId, JobStatus, MediaMetadata, ProgressEvent,
};
use crate::downloader::progress::{parse_line, OutputLine, ProgressTracker};
use crate::downloader::traits::{MediaBackend, ProgressEmitter};
use crate::downloader::utils::{run_output_with_timeout, RunError};

struct ProcessHandle {
    kill: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
}

type ProcessTable = Arc<Mutex<HashMap<JobId, ProcessHandle>>>;

pub struct YtDlpBackend {
    binary_path: PathBuf,
    network_args: Vec<String>,
    info_timeout: Duration,
    processes: ProcessTable,
}

impl YtDlpBackend {
    pub fn new(binary_path: impl Into<PathBuf>, config: &EngineConfig) -> Self {
        let mut network_args = Vec::new();
        if let Some(proxy) = config.proxy.as_deref() {
            network_args.extend(["--proxy".to_string(), proxy.to_string()]);
        }
        if let Some(seconds) = config.socket_timeout {
            network_args.extend(["--socket-timeout".to_string(), seconds.to_string()]);
        }
        Self {
            binary_path: binary_path.into(),
            network_args,
            info_timeout: config.info_timeout,
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Argument vector for a download; the URL is always last
    pub fn build_download_args(&self, url: &str, options: &DownloadOptions) -> Vec<String> {
        let mut args = vec![
            "--progress".to_string(),
            "--newline".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
        ];
        args.extend(self.network_args.iter().cloned());
        args.extend([
            "--output".to_string(),
            options.output_template().to_string_lossy().to_string(),
            "-f".to_string(),
            FormatSelector::selector(options.format, &options.quality),
            // Nothing after this is parsed as an option, whatever the URL looks like.
            "--".to_string(),
            url.to_string(),
        ]);
        args
    }

    /// Argument vector for a metadata query; the URL is always last
    pub fn build_info_args(&self, url: &str) -> Vec<String> {
        let mut args = vec![
            "--dump-json".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
        ];
        args.extend(self.network_args.iter().cloned());
        args.push("--".to_string());
        args.push(url.to_string());
        args
    }

    /// Number of live processes
    pub async fn active_count(&self) -> usize {
        self.processes.lock().await.len()
    }
}

#[async_trait]
impl MediaBackend for YtDlpBackend {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn download(
        &self,
        url: &str,
        options: &DownloadOptions,
        emitter: ProgressEmitter,
    ) -> Result<Job, DownloadError> {
        let job_id = JobId::new();
        let args = self.build_download_args(url, options);
        debug!(%job_id, binary = %self.binary_path.display(), ?args, "spawning yt-dlp");

        // Held until the handle is registered so a fast exit cannot race it.
        let mut processes = self.processes.lock().await;

        let mut child = Command::new(&self.binary_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DownloadError::ProcessSpawn(format!("{}: {}", self.binary_path.display(), e))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DownloadError::ProcessSpawn("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DownloadError::ProcessSpawn("Failed to capture stderr".to_string()))?;

        let (kill, kill_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor_process(
            job_id,
            child,
            stdout,
            stderr,
            kill_rx,
            emitter,
            self.processes.clone(),
        ));
        processes.insert(job_id, ProcessHandle { kill, monitor });
        drop(processes);

        info!(%job_id, %url, "download started");
        let mut job = Job::new(job_id, url, options.clone());
        job.status = JobStatus::Downloading;
        Ok(job)
    }

    async fn cancel(&self, job_id: JobId) -> bool {
        let Some(handle) = self.processes.lock().await.remove(&job_id) else {
            debug!(%job_id, "cancel: no live process");
            return false;
        };

        let signalled = handle.kill.send(()).is_ok();
        if let Err(e) = handle.monitor.await {
            warn!(%job_id, "monitor task ended abnormally: {}", e);
        }
        info!(%job_id, signalled, "download cancelled");
        signalled
    }

    async fn get_info(&self, url: &str) -> Result<MediaMetadata, DownloadError> {
        let program = self.binary_path.to_string_lossy();
        let timeout_secs = self.info_timeout.as_secs().max(1);
        let output = run_output_with_timeout(&program, self.build_info_args(url), timeout_secs)
            .await
            .map_err(|e| match e {
                RunError::Spawn { .. } => DownloadError::ProcessSpawn(e.to_string()),
                other => DownloadError::MetadataFetch(other.to_string()),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no error output");
            return Err(DownloadError::MetadataFetch(format!(
                "yt-dlp exited with {}: {}",
                output.status, detail
            )));
        }

        parse_metadata(&output.stdout, url)
    }
}

/// Strict shape of the `--dump-json` fields we consume
#[derive(Debug, Deserialize)]
struct RawMetadata {
    title: String,
    uploader: String,
    duration: f64,
    #[serde(default)]
    thumbnail: Option<String>,
}

/// Parse a single JSON document; any missing or invalid required field rejects
pub fn parse_metadata(stdout: &[u8], url: &str) -> Result<MediaMetadata, DownloadError> {
    let raw: RawMetadata = serde_json::from_slice(stdout)?;

    let title = raw.title.trim();
    if title.is_empty() {
        return Err(DownloadError::MetadataParse("empty title".to_string()));
    }
    if !raw.duration.is_finite() || raw.duration < 0.0 {
        return Err(DownloadError::MetadataParse(format!(
            "invalid duration {}",
            raw.duration
        )));
    }

    Ok(MediaMetadata {
        title: title.to_string(),
        author: raw.uploader,
        duration: raw.duration,
        thumbnail: raw.thumbnail.filter(|t| !t.is_empty()),
        source_url: url.to_string(),
    })
}

async fn monitor_process(
    job_id: JobId,
    mut child: Child,
    stdout: impl AsyncRead + Unpin + Send + 'static,
    stderr: impl AsyncRead + Unpin + Send + 'static,
    kill_rx: oneshot::Receiver<()>,
    emitter: ProgressEmitter,
    processes: ProcessTable,
) {
    let stdout_emitter = emitter.clone();
    let stdout_task = tokio::spawn(async move {
        let mut tracker = ProgressTracker::new();
        for_each_line(stdout, |line| match parse_line(line) {
            OutputLine::Progress(raw) => {
                if let Some(percent) = tracker.accept(raw) {
                    stdout_emitter.emit(BackendEvent::Progress(ProgressEvent { job_id, percent }));
                }
            }
            OutputLine::Destination(path) => {
                debug!(%job_id, path = %path.display(), "destination");
                stdout_emitter.emit(BackendEvent::Destination { job_id, path });
            }
            OutputLine::Other => debug!(%job_id, "yt-dlp: {}", line),
        })
        .await;
    });

    let stderr_task = tokio::spawn(async move {
        let mut collected = String::new();
        for_each_line(stderr, |line| {
            debug!(%job_id, "yt-dlp stderr: {}", line);
            collected.push_str(line);
            collected.push('\n');
        })
        .await;
        collected
    });

    tokio::select! {
        status = child.wait() => {
            // Every progress line goes out before the terminal event.
            let _ = stdout_task.await;
            let stderr_output = stderr_task.await.unwrap_or_default();

            if processes.lock().await.remove(&job_id).is_none() {
                debug!(%job_id, "exit after cancellation ignored");
                return;
            }

            match status {
                Ok(status) if status.success() => {
                    info!(%job_id, "download completed");
                    emitter.emit(BackendEvent::Completed { job_id });
                }
                Ok(status) => {
                    let message = exit_failure_message(status.code(), &stderr_output);
                    warn!(%job_id, code = ?status.code(), "download failed: {}", message);
                    emitter.emit(BackendEvent::Failed { job_id, message });
                }
                Err(e) => {
                    let message = format!("Failed to wait for process: {}", e);
                    warn!(%job_id, "{}", message);
                    emitter.emit(BackendEvent::Failed { job_id, message });
                }
            }
        }
        _ = kill_rx => {
            if let Err(e) = child.kill().await {
                warn!(%job_id, "kill failed: {}", e);
            }
            stdout_task.abort();
            stderr_task.abort();
            debug!(%job_id, "process killed");
        }
    }
}

/// Feed every line (lossily decoded, newline stripped) to `f` until EOF
async fn for_each_line<R, F>(reader: R, mut f: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                f(line.trim_end_matches(['\r', '\n']));
            }
            Err(e) => {
                warn!("stopped reading process output: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::diagnostics::FORMAT_UNAVAILABLE;
    use tokio::sync::mpsc;

    fn backend_for(binary: PathBuf) -> YtDlpBackend {
        YtDlpBackend::new(binary, &EngineConfig::default())
    }

    #[test]
    fn test_download_args_are_explicit_and_url_last() {
        let backend = backend_for(PathBuf::from("/bin/yt-dlp"));
        let opts = DownloadOptions::audio("/out").with_filename_template(Some("Song".into()));
        let args = backend.build_download_args("https://x/y", &opts);

        assert_eq!(&args[..3], &["--progress", "--newline", "--no-playlist"]);
        let out = args.iter().position(|a| a == "--output").unwrap();
        assert_eq!(args[out + 1], "/out/Song.%(ext)s");
        let f = args.iter().position(|a| a == "-f").unwrap();
        assert_eq!(args[f + 1], "bestaudio[ext=m4a]");
        assert_eq!(args.last().map(String::as_str), Some("https://x/y"));
        assert_eq!(args[args.len() - 2], "--");
    }

    #[test]
    fn test_default_template_is_title_based() {
        let backend = backend_for(PathBuf::from("/bin/yt-dlp"));
        let args = backend.build_download_args("https://x/y", &DownloadOptions::video("/out"));
        assert!(args.contains(&"/out/%(title)s.%(ext)s".to_string()));
        assert!(args.contains(&"bestvideo[ext=mp4]+bestaudio[ext=m4a]".to_string()));
    }

    #[test]
    fn test_network_args_come_from_config() {
        let config = EngineConfig::default().with_proxy(Some("socks5h://127.0.0.1:1080".into()));
        let backend = YtDlpBackend::new("/bin/yt-dlp", &config);
        let args = backend.build_info_args("https://x/y");
        assert_eq!(
            args,
            vec![
                "--dump-json",
                "--no-playlist",
                "--no-warnings",
                "--proxy",
                "socks5h://127.0.0.1:1080",
                "--",
                "https://x/y"
            ]
        );
    }

    #[test]
    fn test_socket_timeout_precedes_url() {
        let config = EngineConfig::default().with_socket_timeout(Some(20));
        let backend = YtDlpBackend::new("/bin/yt-dlp", &config);
        let args = backend.build_download_args("https://x/y", &DownloadOptions::audio("/out"));
        let at = args.iter().position(|a| a == "--socket-timeout").unwrap();
        assert_eq!(args[at + 1], "20");
        assert!(at < args.len() - 2);
        assert!(!args.contains(&"--proxy".to_string()));
    }

    #[test]
    fn test_parse_metadata_maps_fields() {
        let json = br#"{"title":" Song ","uploader":"Band","duration":215.0,"thumbnail":"https://i/t.jpg","id":"abc"}"#;
        let meta = parse_metadata(json, "https://x/y").unwrap();
        assert_eq!(meta.title, "Song");
        assert_eq!(meta.author, "Band");
        assert_eq!(meta.duration, 215.0);
        assert_eq!(meta.thumbnail.as_deref(), Some("https://i/t.jpg"));
        assert_eq!(meta.source_url, "https://x/y");
    }

    #[test]
    fn test_parse_metadata_fails_closed() {
        let missing_uploader = br#"{"title":"Song","duration":1}"#;
        assert!(matches!(
            parse_metadata(missing_uploader, "u"),
            Err(DownloadError::MetadataParse(_))
        ));

        let live = br#"{"title":"Song","uploader":"Band","duration":null}"#;
        assert!(parse_metadata(live, "u").is_err());

        let two_docs = b"{\"title\":\"a\",\"uploader\":\"b\",\"duration\":1}\n{}";
        assert!(parse_metadata(two_docs, "u").is_err());

        assert!(matches!(
            parse_metadata(b"{not json", "u"),
            Err(DownloadError::MetadataParse(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let backend = backend_for(PathBuf::from("/definitely/not/yt-dlp"));
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = backend
            .download("https://x/y", &DownloadOptions::audio("/tmp"), ProgressEmitter::new(tx))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::ProcessSpawn(_)));
        assert_eq!(backend.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_noop() {
        let backend = backend_for(PathBuf::from("/definitely/not/yt-dlp"));
        assert!(!backend.cancel(JobId::new()).await);
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        fn fake_ytdlp(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("yt-dlp");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        async fn collect(mut rx: mpsc::UnboundedReceiver<BackendEvent>) -> Vec<BackendEvent> {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            events
        }

        #[tokio::test]
        async fn test_progress_then_completion() {
            let dir = tempfile::tempdir().unwrap();
            let script = r#"
printf '%s\n' "$@" > "$(dirname "$0")/argv"
echo "[youtube] y: Downloading webpage"
echo "[download] Destination: /out/Song.m4a"
echo "[download]  10.0% of 1.00MiB at 1.00MiB/s ETA 00:01"
echo "[download]   5.0% of 1.00MiB at 1.00MiB/s ETA 00:01"
echo "[download]  55.5% of 1.00MiB at 1.00MiB/s ETA 00:01"
echo "[download] 100% of 1.00MiB in 00:00:01"
echo "some warning" >&2
exit 0"#;
            let backend = backend_for(fake_ytdlp(dir.path(), script));
            let (tx, rx) = mpsc::unbounded_channel();
            let job = backend
                .download("https://x/y", &DownloadOptions::audio("/out"), ProgressEmitter::new(tx))
                .await
                .unwrap();
            assert_eq!(job.status, JobStatus::Downloading);

            let events = collect(rx).await;
            let percents: Vec<f32> = events
                .iter()
                .filter_map(|e| match e {
                    BackendEvent::Progress(p) => Some(p.percent),
                    _ => None,
                })
                .collect();
            assert_eq!(percents, vec![10.0, 55.5, 100.0]);
            assert!(events.contains(&BackendEvent::Destination {
                job_id: job.id,
                path: PathBuf::from("/out/Song.m4a")
            }));
            assert_eq!(events.last(), Some(&BackendEvent::Completed { job_id: job.id }));
            assert_eq!(backend.active_count().await, 0);

            let argv = std::fs::read_to_string(dir.path().join("argv")).unwrap();
            assert_eq!(argv.lines().last(), Some("https://x/y"));
        }

        #[tokio::test]
        async fn test_exit_one_maps_to_format_unavailable() {
            let dir = tempfile::tempdir().unwrap();
            let backend = backend_for(fake_ytdlp(
                dir.path(),
                "echo 'ERROR: Requested format is not available' >&2\nexit 1",
            ));
            let (tx, rx) = mpsc::unbounded_channel();
            let job = backend
                .download("https://x/y", &DownloadOptions::audio("/out"), ProgressEmitter::new(tx))
                .await
                .unwrap();

            let events = collect(rx).await;
            assert_eq!(
                events,
                vec![BackendEvent::Failed {
                    job_id: job.id,
                    message: FORMAT_UNAVAILABLE.to_string()
                }]
            );
        }

        #[tokio::test]
        async fn test_other_exit_codes_are_generic() {
            let dir = tempfile::tempdir().unwrap();
            let backend = backend_for(fake_ytdlp(
                dir.path(),
                "echo 'ERROR: HTTP Error 403: Forbidden' >&2\nexit 3",
            ));
            let (tx, rx) = mpsc::unbounded_channel();
            backend
                .download("https://x/y", &DownloadOptions::video("/out"), ProgressEmitter::new(tx))
                .await
                .unwrap();

            match collect(rx).await.as_slice() {
                [BackendEvent::Failed { message, .. }] => {
                    assert!(message.starts_with("Process exited with code 3"));
                    assert!(message.contains("403"));
                }
                other => panic!("unexpected events: {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_cancel_kills_without_terminal_event() {
            let dir = tempfile::tempdir().unwrap();
            let backend = backend_for(fake_ytdlp(
                dir.path(),
                "echo '[download]   1.0% of 1.00MiB'\nexec sleep 30",
            ));
            let (tx, rx) = mpsc::unbounded_channel();
            let job = backend
                .download("https://x/y", &DownloadOptions::audio("/out"), ProgressEmitter::new(tx))
                .await
                .unwrap();
            assert_eq!(backend.active_count().await, 1);

            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(backend.cancel(job.id).await);
            assert!(!backend.cancel(job.id).await);
            assert_eq!(backend.active_count().await, 0);

            let events = tokio::time::timeout(Duration::from_secs(5), collect(rx))
                .await
                .unwrap();
            assert!(events.iter().all(|e| matches!(e, BackendEvent::Progress(_))));
        }

        #[tokio::test]
        async fn test_get_info_parses_stdout() {
            let dir = tempfile::tempdir().unwrap();
            let backend = backend_for(fake_ytdlp(
                dir.path(),
                r#"echo '{"title":"Song","uploader":"Band","duration":12.5}'"#,
            ));
            let meta = backend.get_info("https://x/y").await.unwrap();
            assert_eq!(meta.title, "Song");
            assert_eq!(meta.thumbnail, None);
        }

        #[tokio::test]
        async fn test_get_info_rejects_malformed_json() {
            let dir = tempfile::tempdir().unwrap();
            let backend = backend_for(fake_ytdlp(dir.path(), "echo '{\"title\": '"));
            assert!(matches!(
                backend.get_info("https://x/y").await,
                Err(DownloadError::MetadataParse(_))
            ));
            assert_eq!(backend.active_count().await, 0);
        }

        #[tokio::test]
        async fn test_get_info_nonzero_exit() {
            let dir = tempfile::tempdir().unwrap();
            let backend = backend_for(fake_ytdlp(
                dir.path(),
                "echo 'ERROR: Unsupported URL' >&2\nexit 1",
            ));
            match backend.get_info("https://x/y").await {
                Err(DownloadError::MetadataFetch(msg)) => assert!(msg.contains("Unsupported URL")),
                other => panic!("unexpected: {:?}", other),
            }
        }
    }
}
