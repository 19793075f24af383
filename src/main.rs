//! CLI entry point for adcp_waves
//!
//! ```bash
//! adcp_waves list
//! adcp_waves download --all --parse
//! adcp_waves download B0000003.ENS B0000004.ENS
//! adcp_waves import data/B0000003.ENS
//! adcp_waves --mock download --all
//! ```
//!
//! Ctrl-C during a download cancels it and removes the partial file.

use adcp_waves::burst::WaveBurst;
use adcp_waves::config::{OptionsStore, WaveOptions};
use adcp_waves::display::{BurstRenderer, DisplayFeed};
use adcp_waves::download::{DownloadCoordinator, DownloadEvent, DownloadSession};
use adcp_waves::error::AppResult;
use adcp_waves::import::WaveImporter;
use adcp_waves::logging;
use adcp_waves::transport::mock::{MockBehavior, MockTransport};
use adcp_waves::transport::Transport;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Parser)]
#[command(name = "adcp_waves")]
#[command(about = "Download and decode wave bursts from a current profiler", long_about = None)]
struct Cli {
    /// Options file (default: user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use an in-process simulated instrument
    #[arg(long, global = true)]
    mock: bool,

    /// Per-file download timeout in minutes (saved to the options file)
    #[arg(long, global = true)]
    timeout_minutes: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List files stored on the instrument
    List,

    /// Download files from the instrument
    Download {
        /// Download every listed file
        #[arg(long, conflicts_with = "names")]
        all: bool,

        /// Replace files that already exist locally (this run only)
        #[arg(long)]
        overwrite: bool,

        /// Decode each downloaded file into a wave burst (this run only)
        #[arg(long)]
        parse: bool,

        /// Files to download
        names: Vec<String>,
    },

    /// Decode stored ensemble files into wave bursts
    Import {
        /// Output directory (default: the download directory)
        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

/// Prints a one-line summary per finalized burst.
struct SummaryRenderer;

impl BurstRenderer for SummaryRenderer {
    fn render(&self, burst: &WaveBurst) -> AppResult<()> {
        let bad: usize = burst.samples().iter().map(|s| s.bad_velocity_count()).sum();
        println!(
            "  {}  serial {}  from {}  {} samples ({} bad velocities)",
            burst.output_name(),
            burst.serial_number(),
            burst.first_timestamp(),
            burst.len(),
            bad
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let store = OptionsStore::open(cli.config.clone().unwrap_or_else(OptionsStore::default_path))
        .context("loading options")?;
    if let Some(minutes) = cli.timeout_minutes {
        store.update(|o| o.download_timeout_minutes = minutes)?;
    }
    let options = store.get();
    logging::init_from_options(&options)?;

    match cli.command {
        Commands::List => list(&options, cli.mock).await,
        Commands::Download {
            all,
            overwrite,
            parse,
            names,
        } => {
            if !all && names.is_empty() {
                bail!("name files to download or pass --all");
            }
            // One-shot flags widen this session only; the options file is untouched.
            let session = options.download_session_with(overwrite, parse);
            download(&options, session, cli.mock, all, names).await
        }
        Commands::Import { output, files } => import(&options, output, files),
    }
}

fn build_transport(options: &WaveOptions, mock: bool) -> Result<Arc<dyn Transport>> {
    if mock {
        let transport = MockTransport::new()
            .with_ensemble_file("B0000001.ENS", "SN12345", 40, MockBehavior::Succeed)
            .with_ensemble_file("B0000002.ENS", "SN12345", 40, MockBehavior::FailTimes(1))
            .with_ensemble_file("B0000003.ENS", "SN12345", 40, MockBehavior::Succeed);
        return Ok(Arc::new(transport));
    }

    #[cfg(feature = "instrument_serial")]
    {
        use adcp_waves::transport::serial::SerialTransport;
        Ok(Arc::new(SerialTransport::from_options(&options.serial)))
    }

    #[cfg(not(feature = "instrument_serial"))]
    {
        let _ = options;
        Err(adcp_waves::WaveError::SerialFeatureDisabled.into())
    }
}

async fn list(options: &WaveOptions, mock: bool) -> Result<()> {
    let transport = build_transport(options, mock)?;
    transport.open().await?;
    let coordinator = DownloadCoordinator::new(Arc::clone(&transport));

    let files = coordinator.populate_file_list().await;
    transport.close().await?;

    println!("{:<16} {:<20} {:>12}", "NAME", "MODIFIED", "BYTES");
    for file in files? {
        let modified = file
            .modified()
            .map(|m| m.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!("{:<16} {:<20} {:>12}", file.name(), modified, file.size());
    }
    Ok(())
}

async fn download(
    options: &WaveOptions,
    session: DownloadSession,
    mock: bool,
    all: bool,
    names: Vec<String>,
) -> Result<()> {
    let transport = build_transport(options, mock)?;
    transport.open().await?;

    let feed = Arc::new(DisplayFeed::new(Arc::new(SummaryRenderer)));
    let importer = WaveImporter::new(&options.download_dir, options.output_format.writer()?)
        .with_display_feed(feed);
    let mut coordinator = DownloadCoordinator::new(Arc::clone(&transport))
        .with_importer(Arc::new(Mutex::new(importer)));
    if mock {
        coordinator = coordinator.with_settle_delay(std::time::Duration::ZERO);
    }
    let coordinator = Arc::new(coordinator);

    let files = coordinator.populate_file_list().await?;
    if all {
        coordinator.select_all();
    } else {
        let matched = coordinator.select(names.as_slice());
        if matched < names.len() {
            for name in names.iter().filter(|n| !files.iter().any(|f| f.name() == n.as_str())) {
                eprintln!("Not on instrument: {}", name);
            }
        }
        if matched == 0 {
            transport.close().await?;
            bail!("none of the requested files are on the instrument");
        }
    }

    let mut events = coordinator.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                DownloadEvent::FileCompleted { name, success } => {
                    println!("{} {}", if success { "done  " } else { "FAILED" }, name)
                }
                DownloadEvent::Skipped { name } => println!("skip   {}", name),
                DownloadEvent::Retrying { name } => println!("retry  {}", name),
                _ => {}
            }
        }
    });

    let handle = coordinator.start_download(session)?;
    let mut wait = std::pin::pin!(handle.wait());
    let report = tokio::select! {
        report = &mut wait => report?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            coordinator.cancel_download();
            wait.await?
        }
    };
    printer.abort();
    transport.close().await?;

    println!();
    println!(
        "{} of {} files downloaded ({} skipped), {} failed{}",
        report.completed_count(),
        report.total,
        report.skipped.len(),
        report.failed_count(),
        if report.cancelled { ", cancelled" } else { "" }
    );
    for name in &report.failed {
        println!("  failed: {}", name);
    }
    for path in &report.outputs {
        println!("  burst:  {}", path.display());
    }
    Ok(())
}

fn import(options: &WaveOptions, output: Option<PathBuf>, files: Vec<PathBuf>) -> Result<()> {
    let output = output.unwrap_or_else(|| options.download_dir.clone());
    let feed = Arc::new(DisplayFeed::new(Arc::new(SummaryRenderer)));
    let mut importer =
        WaveImporter::new(&output, options.output_format.writer()?).with_display_feed(feed);

    let report = importer.import_files(&files);
    importer.finish()?;

    println!(
        "{} files imported, {} ensembles, {} bytes discarded",
        report.files_imported, report.ensembles, report.bytes_discarded
    );
    for (path, reason) in &report.failed {
        println!("  failed: {} ({})", path.display(), reason);
    }
    if report.files_imported == 0 {
        bail!("no files could be imported");
    }
    Ok(())
}
