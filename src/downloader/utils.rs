// Helper functions shared by the provisioner, backends and command layer

use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;
use tokio::time::{timeout, Duration as TokioDuration};
use tracing::warn;

/// Characters most filesystems reserve in file names
const RESERVED_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Strip reserved characters (and control characters) from a media title
pub fn sanitize_filename(title: &str) -> String {
    title
        .chars()
        .filter(|c| !RESERVED_CHARS.contains(c) && !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Why `run_output_with_timeout` produced no output
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Failed to start {program}: {message}")]
    Spawn { program: String, message: String },
    #[error("Timed out after {0}s")]
    Timeout(u64),
    #[error("{0}")]
    Io(String),
}

/// Run command with timeout, collecting stdout and stderr
pub async fn run_output_with_timeout(
    program: &str,
    args: Vec<String>,
    timeout_secs: u64,
) -> Result<std::process::Output, RunError> {
    let mut child = TokioCommand::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RunError::Spawn {
            program: program.to_string(),
            message: e.to_string(),
        })?;

    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| RunError::Io(format!("Failed to capture stdout from {}", program)))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| RunError::Io(format!("Failed to capture stderr from {}", program)))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout_pipe
            .read_to_end(&mut buf)
            .await
            .map_err(|e| RunError::Io(format!("Failed to read stdout: {}", e)))?;
        Ok::<Vec<u8>, RunError>(buf)
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr_pipe
            .read_to_end(&mut buf)
            .await
            .map_err(|e| RunError::Io(format!("Failed to read stderr: {}", e)))?;
        Ok::<Vec<u8>, RunError>(buf)
    });

    let waited = timeout(TokioDuration::from_secs(timeout_secs), child.wait()).await;
    match waited {
        Ok(status_res) => {
            let status = status_res
                .map_err(|e| RunError::Io(format!("Failed to wait for {}: {}", program, e)))?;
            let stdout = stdout_task
                .await
                .map_err(|e| RunError::Io(format!("stdout task failed: {}", e)))??;
            let stderr = stderr_task
                .await
                .map_err(|e| RunError::Io(format!("stderr task failed: {}", e)))??;
            Ok(std::process::Output { status, stdout, stderr })
        }
        Err(_) => {
            warn!(program, "timed out after {}s, killing", timeout_secs);
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            Err(RunError::Timeout(timeout_secs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_reserved_chars() {
        assert_eq!(sanitize_filename("AC/DC: Back in Black?"), "ACDC Back in Black");
        assert_eq!(sanitize_filename(r#"a<b>c"d\e|f*g"#), "abcdefg");
        assert_eq!(sanitize_filename("  padded\t"), "padded");
    }

    #[test]
    fn test_sanitize_keeps_unicode() {
        assert_eq!(sanitize_filename("Café — Ünïcödé 歌"), "Café — Ünïcödé 歌");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_output_with_timeout_kills_slow_process() {
        let err = run_output_with_timeout("sleep", vec!["5".to_string()], 1)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Timeout(1)));
    }

    #[tokio::test]
    async fn test_run_output_with_timeout_reports_spawn_failure() {
        let err = run_output_with_timeout("/definitely/not/here", Vec::new(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_output_with_timeout_collects_output() {
        let out = run_output_with_timeout("sh", vec!["-c".into(), "echo hi; echo err >&2".into()], 5)
            .await
            .unwrap();
        assert!(out.status.success());
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "hi");
        assert_eq!(String::from_utf8_lossy(&out.stderr).trim(), "err");
    }
}
