//! CLI Entry Point for mtpa-trawler
//!
//! Provides command-line interface for:
//! - Running the trawler against the LOP buffer (daemon or a single cycle)
//! - Extracting the metadata record of one product container
//! - Downloading the archived products of a capture block
//! - Listing persisted transfer states
//!
//! # Usage
//!
//! ```bash
//! mtpa-trawler transfer --buffer-root /data --archive http://mtpa:9101 --poll-interval 20s
//! mtpa-trawler extract /data/1555862422/1555862422_sdp_l0.rdb --output sdp_l0.met
//! mtpa-trawler download 1555862422 --archive http://mtpa:9101 --dest ./products --parallel 4
//! mtpa-trawler status --state trawler-state.json
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use mtpa_trawler::archive::{ArchiveClient, HttpArchiveClient};
use mtpa_trawler::config::{TrawlerConfig, DEFAULT_CONFIG_PATH};
use mtpa_trawler::download::{DownloadOptions, Downloader};
use mtpa_trawler::metadata::Extractor;
use mtpa_trawler::state::{JsonStateStore, StateStore, TransferState};
use mtpa_trawler::{telemetry, Trawler};

#[derive(Parser)]
#[command(name = "mtpa-trawler", version)]
#[command(about = "Moves observation products from the LOP buffer into the MTPA", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/trawler.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the buffer and archive every completed product
    Transfer {
        /// Root of the LOP buffer
        #[arg(long)]
        buffer_root: Option<PathBuf>,

        /// Sleep between poll cycles, e.g. "20s"
        #[arg(long, value_parser = humantime::parse_duration)]
        poll_interval: Option<Duration>,

        /// Archive endpoint URL
        #[arg(long)]
        archive: Option<String>,

        /// Number of products processed concurrently
        #[arg(long)]
        workers: Option<usize>,

        /// Resume interrupted work, run one cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Print the metadata record of one product container
    Extract {
        /// Path to a .h5 or .rdb container
        file: PathBuf,

        /// Write the document here instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Download every archived product of a capture block
    Download {
        /// Capture block identifier
        capture_block_id: String,

        /// Archive endpoint URL
        #[arg(long)]
        archive: Option<String>,

        /// Destination directory
        #[arg(long, default_value = ".")]
        dest: PathBuf,

        /// Concurrent file fetches
        #[arg(long, default_value_t = 1)]
        parallel: usize,
    },

    /// List persisted transfer states
    Status {
        /// State file (defaults to state.path from the configuration)
        #[arg(long)]
        state: Option<PathBuf>,

        /// Only show products in this state
        #[arg(long, value_parser = parse_state)]
        only: Option<TransferState>,
    },
}

fn parse_state(name: &str) -> std::result::Result<TransferState, String> {
    TransferState::parse(name).ok_or_else(|| {
        let names: Vec<&str> = TransferState::ALL.iter().map(|s| s.as_str()).collect();
        format!("unknown state '{name}', expected one of: {}", names.join(", "))
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Transfer {
            buffer_root,
            poll_interval,
            archive,
            workers,
            once,
        } => {
            if let Some(root) = buffer_root {
                config.buffer.root = root;
            }
            if let Some(interval) = poll_interval {
                config.transfer.poll_interval = interval;
            }
            if let Some(endpoint) = archive {
                config.archive.endpoint = endpoint;
            }
            if let Some(workers) = workers {
                config.transfer.workers = workers;
            }
            init(&config)?;
            run_transfer(&config, once).await
        }
        Commands::Extract { file, output } => {
            init(&config)?;
            run_extract(&file, output.as_deref())
        }
        Commands::Download {
            capture_block_id,
            archive,
            dest,
            parallel,
        } => {
            if let Some(endpoint) = archive {
                config.archive.endpoint = endpoint;
            }
            init(&config)?;
            run_download(&config, &capture_block_id, dest, parallel).await
        }
        Commands::Status { state, only } => {
            if let Some(path) = state {
                config.state.path = path;
            }
            init(&config)?;
            run_status(&config, only)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<TrawlerConfig> {
    let path = match path {
        Some(path) if !path.exists() => bail!("config file {} does not exist", path.display()),
        Some(path) => path,
        None => Path::new(DEFAULT_CONFIG_PATH),
    };
    let config: TrawlerConfig = TrawlerConfig::figment(path)
        .extract()
        .map_err(mtpa_trawler::TrawlerError::from)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    Ok(config)
}

// CLI overrides are applied before validation
fn init(config: &TrawlerConfig) -> Result<()> {
    config.validate().context("invalid configuration")?;
    telemetry::init_from_config(config).context("failed to initialise logging")?;
    Ok(())
}

async fn run_transfer(config: &TrawlerConfig, once: bool) -> Result<()> {
    let store = JsonStateStore::open(&config.state.path).with_context(|| {
        format!("failed to open state store {}", config.state.path.display())
    })?;
    let archive: Arc<dyn ArchiveClient> = Arc::new(HttpArchiveClient::new(&config.archive)?);
    let trawler = Trawler::new(config, archive, Arc::new(store));

    if once {
        let resumed = trawler.resume().await.context("resume failed")?;
        trawler.observe().await;
        tokio::time::sleep(trawler.settings().poll_interval).await;
        let report = trawler.run_cycle().await.context("poll cycle failed")?;
        info!(?resumed, ?report, "single cycle complete");
        println!(
            "acknowledged {}, released {}, failed {}, deferred {}",
            resumed.acknowledged + report.acknowledged,
            resumed.released + report.released,
            resumed.failed + report.failed,
            resumed.deferred + report.deferred,
        );
        return Ok(());
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, finishing current cycle");
            let _ = cancel_tx.send(true);
        }
    });
    trawler.run(cancel_rx).await.context("trawler stopped with an error")?;
    Ok(())
}

fn run_extract(file: &Path, output: Option<&Path>) -> Result<()> {
    let extraction = Extractor::new()
        .extract_path(file)
        .with_context(|| format!("failed to extract metadata from {}", file.display()))?;
    for defaulted in &extraction.defaulted {
        warn!(%defaulted, "field defaulted");
    }
    match output {
        Some(path) => {
            extraction
                .record
                .write_sidecar(path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), fields = extraction.record.len(), "metadata written");
        }
        None => print!("{}", extraction.record.to_cas_xml()),
    }
    Ok(())
}

async fn run_download(
    config: &TrawlerConfig,
    capture_block_id: &str,
    dest: PathBuf,
    parallel: usize,
) -> Result<()> {
    if parallel == 0 {
        bail!("--parallel must be at least 1");
    }
    let archive = Arc::new(HttpArchiveClient::new(&config.archive)?);
    let downloader = Downloader::new(
        archive,
        DownloadOptions {
            dest,
            parallel,
            connect_timeout: config.archive.request_timeout,
            read_timeout: config.archive.request_timeout,
        },
    )?;
    let report = downloader
        .download_capture_block(capture_block_id)
        .await
        .with_context(|| format!("failed to look up capture block {capture_block_id}"))?;

    println!(
        "{} products: {} files fetched ({} bytes), {} already present",
        report.products, report.fetched, report.bytes, report.skipped
    );
    for (reference, error) in &report.failed {
        eprintln!("FAILED {reference}: {error}");
    }
    if !report.failed.is_empty() {
        bail!("{} files could not be downloaded", report.failed.len());
    }
    Ok(())
}

fn run_status(config: &TrawlerConfig, only: Option<TransferState>) -> Result<()> {
    let path = &config.state.path;
    if !path.exists() {
        bail!("state file {} does not exist", path.display());
    }
    let store = JsonStateStore::open(path)
        .with_context(|| format!("failed to open state store {}", path.display()))?;
    let records = match only {
        Some(state) => store.in_state(state)?,
        None => store.all()?,
    };

    println!(
        "{:<32} {:<12} {:<14} {:>8} {:<8} {:<25} LAST ERROR",
        "CAPTURE ID", "STATE", "ARCHIVE ID", "ATTEMPTS", "RELEASED", "UPDATED"
    );
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for record in &records {
        *counts.entry(record.state.as_str()).or_default() += 1;
        println!(
            "{:<32} {:<12} {:<14} {:>8} {:<8} {:<25} {}",
            record.capture_id.as_str(),
            record.state.as_str(),
            record.archive_id.as_deref().unwrap_or("-"),
            record.submit_attempts,
            if record.released { "yes" } else { "no" },
            record.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
            record.last_error.as_deref().unwrap_or(""),
        );
    }
    let summary: Vec<String> = counts
        .iter()
        .map(|(state, n)| format!("{state}: {n}"))
        .collect();
    println!();
    println!("{} products ({})", records.len(), summary.join(", "));
    Ok(())
}
