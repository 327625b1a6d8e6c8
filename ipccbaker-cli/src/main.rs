//! ipccbaker CLI - bake carrier bundles out of device firmware archives.

mod progress;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ipccbaker::catalog::DEFAULT_IPHONE_MODELS;
use ipccbaker::config::{DEFAULT_API_BASE, DEFAULT_CONCURRENCY, DEFAULT_DOWNLOAD_TIMEOUT_SECS};
use ipccbaker::{BakerConfig, Orchestrator};

use crate::progress::TerminalReporter;

/// Download firmware archives and repackage their carrier bundles.
#[derive(Debug, Parser)]
#[command(name = "ipccbaker", version, about)]
struct Cli {
    /// Directory under which per-device output trees are written.
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Maximum number of firmware workflows in flight at once.
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Base URL of the firmware catalog API.
    #[arg(long, default_value = DEFAULT_API_BASE)]
    api_base: String,

    /// Device model to process; repeatable. Defaults to the built-in
    /// iPhone list when omitted.
    #[arg(long = "device", value_name = "MODEL")]
    devices: Vec<String>,

    /// Per-download timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_DOWNLOAD_TIMEOUT_SECS)]
    timeout_secs: u64,

    /// Never install missing external tools; fail instead.
    #[arg(long)]
    no_bootstrap: bool,
}

impl Cli {
    fn models(&self) -> Vec<String> {
        if self.devices.is_empty() {
            DEFAULT_IPHONE_MODELS
                .iter()
                .map(|m| m.to_string())
                .collect()
        } else {
            self.devices.clone()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let models = cli.models();

    let mut config = BakerConfig::new(cli.output_dir)
        .with_concurrency(cli.concurrency)
        .with_api_base(cli.api_base)
        .with_download_timeout(Duration::from_secs(cli.timeout_secs));
    config.bootstrap_tools = !cli.no_bootstrap;

    info!(
        devices = models.len(),
        concurrency = config.concurrency,
        output_dir = %config.output_dir.display(),
        "starting run"
    );

    let reporter = Arc::new(TerminalReporter::new());
    let orchestrator = match Orchestrator::with_default_services(&config, reporter) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            eprintln!("failed to initialize: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let summary = orchestrator.run(&models).await;
    println!(
        "processed {}, skipped {}, failed {}",
        summary.processed, summary.skipped, summary.failed
    );

    ExitCode::SUCCESS
}
