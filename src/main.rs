use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::mpsc;
use tracing::warn;

use media_downloader_lib::commands::{self, DownloadOutcome, DownloadRequest, OutputFormat, QualityPreset};
use media_downloader_lib::downloader::{BinaryProvisioner, ProvisionEvent, ProvisionStatus};
use media_downloader_lib::{DownloadError, DownloadOrchestrator, EngineConfig};

/// Fetch media with a self-provisioned yt-dlp
#[derive(Parser)]
#[command(name = "media-downloader", version)]
struct Cli {
    /// Proxy URL handed to yt-dlp and the provisioning client
    #[arg(long, global = true)]
    proxy: Option<String>,

    /// Directory downloads are written to
    #[arg(short, long = "output-dir", global = true)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print metadata for a URL as JSON
    Info { url: String },
    /// Download a URL and wait for it to finish
    Get {
        url: String,
        #[arg(short, long, value_enum, default_value_t = FormatArg::M4a)]
        format: FormatArg,
        #[arg(short, long, value_enum, default_value_t = QualityArg::High)]
        quality: QualityArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Mp3,
    M4a,
    Mp4,
}

impl From<FormatArg> for OutputFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Mp3 => Self::Mp3,
            FormatArg::M4a => Self::M4a,
            FormatArg::Mp4 => Self::Mp4,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum QualityArg {
    High,
    Medium,
    Low,
}

impl From<QualityArg> for QualityPreset {
    fn from(arg: QualityArg) -> Self {
        match arg {
            QualityArg::High => Self::High,
            QualityArg::Medium => Self::Medium,
            QualityArg::Low => Self::Low,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::from_env();
    if let Some(proxy) = cli.proxy {
        config = config.with_proxy(Some(proxy));
    }
    if let Some(dir) = cli.output_dir {
        config = config.with_output_dir(dir);
    }

    let (observer, mut provision_events) = mpsc::unbounded_channel::<ProvisionEvent>();
    tokio::spawn(async move {
        while let Some(event) = provision_events.recv().await {
            match event.status {
                ProvisionStatus::Missing => eprintln!("{} not found, downloading...", event.binary),
                ProvisionStatus::Progress(percent) => eprint!("\r{}: {:5.1}%", event.binary, percent),
                ProvisionStatus::Completed => {}
                ProvisionStatus::Error => eprintln!("\nfailed to provision {}", event.binary),
            }
        }
    });
    let provisioner = BinaryProvisioner::new(&config).with_observer(observer);
    let orchestrator = DownloadOrchestrator::with_provisioner(config, provisioner);

    let result = tokio::select! {
        result = run(&orchestrator, cli.command) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling downloads");
            Err(DownloadError::JobCancelled)
        }
    };
    orchestrator.shutdown().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(orchestrator: &DownloadOrchestrator, command: Command) -> Result<(), DownloadError> {
    match command {
        Command::Info { url } => {
            let metadata = commands::get_media_info(orchestrator, &url).await?;
            let json = serde_json::to_string_pretty(&metadata)
                .map_err(|e| DownloadError::Io(e.to_string()))?;
            println!("{}", json);
        }
        Command::Get { url, format, quality } => {
            let request = DownloadRequest::new(url)
                .with_format(format.into())
                .with_quality(quality.into());
            let outcome = commands::download_media(orchestrator, request, |percent| {
                eprint!("\r{:5.1}%", percent);
            })
            .await?;
            eprintln!();
            match outcome {
                DownloadOutcome::Exists { file_path, .. } => {
                    println!("already downloaded: {}", file_path.display());
                }
                DownloadOutcome::Completed { file_path, title, .. } => {
                    println!("{} -> {}", title, file_path.display());
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parser_builds() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_get_defaults() {
        let cli = Cli::parse_from(["media-downloader", "get", "https://x/y"]);
        match cli.command {
            Command::Get { url, format, quality } => {
                assert_eq!(url, "https://x/y");
                assert_eq!(OutputFormat::from(format), OutputFormat::M4a);
                assert_eq!(QualityPreset::from(quality), QualityPreset::High);
            }
            Command::Info { .. } => panic!("parsed the wrong subcommand"),
        }
    }
}
