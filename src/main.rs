//! CLI Entry Point for daq-log
//!
//! Provides command-line interface for:
//! - Recording a session from the configured device into a `.dqlog` file
//! - Inspecting a log file (segments, channels, recovery warnings)
//! - Exporting a log file to CSV
//! - Printing the effective configuration
//!
//! # Usage
//!
//! ```bash
//! daq-log record --config config/daq_log.toml --duration 30s --live
//! daq-log info data/session_20240309_140507.dqlog
//! daq-log export data/session_20240309_140507.dqlog --output run.csv
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_log::channel::ChannelRegistry;
use daq_log::config::{Settings, DEFAULT_CONFIG_PATH};
use daq_log::data::live_tap::{spawn_forwarder, LiveFrame};
use daq_log::hardware::mock::{SimulatedDaq, Waveform};
use daq_log::logging;
use daq_log::pipeline::Pipeline;
use daq_log::session::Session;
use daq_log::storage::{LogReader, LogWriter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "daq-log")]
#[command(about = "Multi-channel acquisition logger", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire and log until Ctrl+C or the duration elapses
    Record {
        /// Stop after this long (e.g. "30s", "5m")
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,

        /// Log file to create, instead of a timestamped name in output_dir
        #[arg(long, conflicts_with = "append")]
        output: Option<PathBuf>,

        /// Continue an existing log file
        #[arg(long)]
        append: Option<PathBuf>,

        /// Print the latest scaled values once per second
        #[arg(long)]
        live: bool,
    },

    /// Describe a log file
    Info {
        file: PathBuf,

        /// Compare stored channel names with the configured ones
        #[arg(long)]
        reconcile: bool,
    },

    /// Export a log file to CSV
    Export {
        file: PathBuf,

        /// Target file, defaults to the log path with a .csv extension
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    settings.validate()?;
    logging::init_from_settings(&settings)?;

    match cli.command {
        Commands::Record {
            duration,
            output,
            append,
            live,
        } => record(settings, duration, output, append, live).await,
        Commands::Info { file, reconcile } => info(&settings, file, reconcile),
        Commands::Export { file, output } => export(file, output),
        Commands::Config => {
            print!("{}", settings.to_toml_string()?);
            Ok(())
        }
    }
}

fn registry(settings: &Settings) -> ChannelRegistry {
    ChannelRegistry::new(
        Arc::new(SimulatedDaq::catalog(settings.acquisition.simulated_channels)),
        Arc::new(settings.scale_store()),
    )
}

async fn record(
    settings: Settings,
    duration: Option<Duration>,
    output: Option<PathBuf>,
    append: Option<PathBuf>,
    live: bool,
) -> Result<()> {
    let channels = registry(&settings).resolve(&settings.channels)?;
    let session = Session::start(channels, settings.acquisition.sample_rate);

    let writer = match append {
        Some(path) => LogWriter::append(&path, settings.writer_options())
            .with_context(|| format!("appending to {}", path.display()))?,
        None => {
            let path = match output {
                Some(path) => path,
                None => {
                    std::fs::create_dir_all(&settings.storage.output_dir)?;
                    settings.log_file_path(&chrono::Local::now())
                }
            };
            LogWriter::create(&path, settings.writer_options())
                .with_context(|| format!("creating {}", path.display()))?
        }
    };
    let path = writer.path().to_path_buf();

    let source = SimulatedDaq::new(
        Arc::clone(session.channels()),
        settings.acquisition.sample_rate,
        settings.acquisition.samples_per_block,
    )
    .with_waveform(Waveform::Sine {
        frequency: 1.0,
        amplitude: 5.0,
    })
    .paced(true);

    let running = Pipeline::start(settings.pipeline_settings(), source, writer, session)?;
    println!("Recording to {} (Ctrl+C to stop)", path.display());

    let mut frames = if live {
        let (tx, rx) = mpsc::channel(16);
        spawn_forwarder(running.tap("cli"), tx, Duration::from_millis(20));
        Some(rx)
    } else {
        None
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let mut status = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Ctrl+C received, stopping");
                break;
            }
            _ = &mut deadline => break,
            _ = status.tick() => {
                if running.has_stopped() {
                    break;
                }
                if let Some(rx) = frames.as_mut() {
                    let mut latest: Option<LiveFrame> = None;
                    while let Ok(frame) = rx.try_recv() {
                        latest = Some(frame);
                    }
                    if let Some(frame) = latest {
                        print_frame(&frame);
                    }
                }
            }
        }
    }

    let summary = tokio::task::spawn_blocking(move || running.stop()).await??;
    println!(
        "Recorded {} samples per channel in {} segment(s) to {}",
        summary.committed_samples,
        summary.segments,
        summary.path.display()
    );
    if summary.writer_dropped_blocks > 0 {
        println!(
            "Warning: {} block(s) missing from the log",
            summary.writer_dropped_blocks
        );
    }
    Ok(())
}

fn print_frame(frame: &LiveFrame) {
    let values: Vec<String> = frame
        .channels
        .iter()
        .filter_map(|c| {
            c.samples
                .last()
                .map(|(_, v)| format!("{}={:.4} {}", c.display_name, v, c.unit))
        })
        .collect();
    println!("t={:>9.3}s  {}", frame.timestamp, values.join("  "));
}

fn info(settings: &Settings, file: PathBuf, reconcile: bool) -> Result<()> {
    let handle = LogReader::open(&file).with_context(|| format!("opening {}", file.display()))?;
    println!("File:     {}", handle.path().display());
    println!("Version:  {}", handle.version());
    println!("Indexed:  {}", handle.is_indexed());
    println!("Segments: {}", handle.segments().len());
    for segment in handle.segments() {
        let names: Vec<&str> = segment
            .metadata
            .channels
            .iter()
            .map(|c| c.display_name.as_str())
            .collect();
        println!(
            "  #{:<3} session {}  {:>10} samples  {:>8.2}s  @ {} Hz  [{}]",
            segment.index,
            segment.metadata.session_id,
            segment.sample_count,
            segment.duration_secs(),
            segment.metadata.sample_rate,
            names.join(", ")
        );
    }
    println!("Channels:");
    for channel in handle.list_channels() {
        println!(
            "  {:<20} {:<8} {:>6}  {} samples",
            channel.display_name,
            channel.physical_id,
            channel.unit,
            handle.total_samples(&channel.display_name)
        );
    }
    for truncation in handle.truncations() {
        println!("Recovered: {truncation}");
    }
    if handle.uncommitted_bytes() > 0 {
        println!("Ignored {} uncommitted bytes", handle.uncommitted_bytes());
    }

    if reconcile {
        let configured = registry(settings).resolve(&settings.channels)?;
        let discrepancies = handle.reconcile(&configured);
        if discrepancies.is_empty() {
            println!("Channel names match the configuration");
        }
        for d in discrepancies {
            println!(
                "  {}: stored as '{}', configured as '{}'",
                d.physical_id, d.stored_name, d.configured_name
            );
        }
    }
    Ok(())
}

#[cfg(feature = "storage_csv")]
fn export(file: PathBuf, output: Option<PathBuf>) -> Result<()> {
    let handle = LogReader::open(&file).with_context(|| format!("opening {}", file.display()))?;
    let target = output.unwrap_or_else(|| file.with_extension("csv"));
    let rows = daq_log::storage::csv_export::export_csv_file(&handle, &target)?;
    println!("Wrote {rows} rows to {}", target.display());
    Ok(())
}

#[cfg(not(feature = "storage_csv"))]
fn export(_file: PathBuf, _output: Option<PathBuf>) -> Result<()> {
    anyhow::bail!("CSV export requires the 'storage_csv' feature")
}
