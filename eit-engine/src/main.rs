//! eit-engine: replay a transport stream through the EIT reconciler.
//!
//! Reads a recorded TS (or stdin), merges every EIT section into the
//! schedule store, optionally follows the TDT with the system clock and
//! prints what it collected.

use std::fs::File;
use std::io::{self, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use serde::Serialize;

use eit_engine::config::{load_config, ConfigFile, EngineConfig};
use eit_engine::epg::{EpgHandlers, EventReconciler};
use eit_engine::store::{ChannelId, Channels, Event, Schedules, StateLock};
use eit_engine::{logging, replay, ClockSync, DisableWindow, EitFilter, OsClock, ReaderStats, SystemClock};

const DEFAULT_CONFIG_FILE: &str = "eit-engine.toml";

/// eit-engine - Reconcile the EPG carried in a transport stream
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Transport stream file, or "-" for stdin
    input: String,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Write the collected schedules as JSON to this file
    #[arg(long)]
    dump: Option<PathBuf>,

    /// Source number the stream was received from
    #[arg(long, default_value = "1")]
    source: u32,

    /// Transponder frequency of the stream in MHz
    #[arg(long, default_value = "0")]
    frequency: u32,

    /// Preferred languages, best first (e.g. "deu,eng")
    #[arg(long, value_delimiter = ',')]
    languages: Vec<String>,

    /// Seconds an ended event is kept
    #[arg(long)]
    linger_secs: Option<i64>,

    /// Do not create channels that are not known yet
    #[arg(long)]
    no_create_channels: bool,

    /// Follow the TDT of this stream with the system clock
    #[arg(long)]
    set_system_time: bool,

    /// Directory where log files are stored
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,
}

/// Apply command line settings over the file configuration.
fn merge_args(args: &Args, config: &mut EngineConfig) {
    if args.log_dir.to_string_lossy() != "logs" {
        config.logging.log_dir = args.log_dir.clone();
    }
    if args.log_retention_days != 7 {
        config.logging.retention_days = args.log_retention_days;
    }
    if !args.languages.is_empty() {
        config.epg.languages = args.languages.clone();
    }
    if let Some(linger) = args.linger_secs {
        config.epg.linger_secs = linger.max(0);
    }
    if args.no_create_channels {
        config.epg.auto_create_channels = false;
    }
    if args.set_system_time {
        config.time.set_system_time = true;
        config.time.source = args.source;
        config.time.transponder = args.frequency;
    }
}

/// One channel in the JSON dump.
#[derive(Serialize)]
struct ChannelDump<'a> {
    id: String,
    name: &'a str,
    portal_name: &'a str,
    events: &'a [Event],
}

fn write_dump(path: &Path, channels: &Channels, schedules: &Schedules) -> Result<(), Box<dyn std::error::Error>> {
    let dump: Vec<ChannelDump<'_>> = schedules
        .iter()
        .map(|schedule| {
            let channel = channels.get(&schedule.channel_id);
            ChannelDump {
                id: schedule.channel_id.to_string(),
                name: channel.map(|c| c.name.as_str()).unwrap_or(""),
                portal_name: channel.map(|c| c.portal_name.as_str()).unwrap_or(""),
                events: schedule.events(),
            }
        })
        .collect();

    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, &dump)?;
    Ok(())
}

fn print_summary(stats: &ReaderStats, channels: &Channels, schedules: &Schedules) {
    println!(
        "{} packets, {} sections ({} EIT merged, {} changed, {} skipped, {} TDT, {} invalid)",
        stats.packets,
        stats.sections,
        stats.eit_processed,
        stats.eit_modified,
        stats.eit_skipped,
        stats.time_sections,
        stats.invalid
    );
    println!("{} channels, {} schedules", channels.len(), schedules.len());

    for schedule in schedules.iter() {
        let id: ChannelId = schedule.channel_id;
        let name = channels.get(&id).map(|c| c.name.as_str()).unwrap_or("");
        let present = schedule
            .present_event()
            .map(|e| e.describe())
            .unwrap_or_else(|| "-".to_string());
        println!("  {:<20} {:<24} {:>5} events  now: {}", id.to_string(), name, schedule.len(), present);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    });
    let file_config = match &config_path {
        Some(path) => match load_config(path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e.into());
            }
        },
        None => ConfigFile::default(),
    };
    let mut config = file_config.resolve()?;
    merge_args(&args, &mut config);

    logging::init_logging(
        &config.logging.log_dir,
        config.logging.retention_days,
        args.verbose,
        config.logging.level.as_deref(),
    )?;

    info!("eit-engine starting...");
    info!("  Input: {}", args.input);
    info!("  Source: {}, transponder: {} MHz", args.source, args.frequency);
    info!("  Languages: {:?}", config.epg.languages);
    info!("  Linger: {}s", config.epg.linger_secs);
    if config.time.set_system_time {
        info!(
            "  System time follows source {} transponder {} MHz",
            config.time.source, config.time.transponder
        );
    }

    let input: Box<dyn Read + Send> = if args.input == "-" {
        Box::new(io::stdin())
    } else {
        match File::open(&args.input) {
            Ok(f) => Box::new(f),
            Err(e) => {
                error!("Failed to open {}: {}", args.input, e);
                return Err(e.into());
            }
        }
    };

    let channels = Arc::new(StateLock::new("channels", Channels::new()));
    let schedules = Arc::new(StateLock::new("schedules", Schedules::new()));
    let reconciler = Arc::new(EventReconciler::new(
        config.epg.clone(),
        Arc::clone(&channels),
        Arc::clone(&schedules),
        Arc::new(EpgHandlers::new()),
    ));
    let clock: Arc<dyn SystemClock> = Arc::new(OsClock);
    let filter = Arc::new(EitFilter::new(
        args.source,
        args.frequency,
        config.time.clone(),
        reconciler,
        Arc::new(ClockSync::new(Arc::clone(&clock))),
        clock,
        Arc::new(DisableWindow::new()),
    ));

    let stop = Arc::new(AtomicBool::new(false));
    let replay_task = replay(input, filter, Arc::clone(&stop));
    tokio::pin!(replay_task);

    let stats = tokio::select! {
        result = &mut replay_task => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, finishing the current chunk");
            stop.store(true, Ordering::Relaxed);
            replay_task.await?
        }
    };
    info!(
        "Replay done: {} packets, {} sections, {} EIT sections merged",
        stats.packets, stats.sections, stats.eit_processed
    );

    let channels = channels.read();
    let schedules = schedules.read();
    print_summary(&stats, &channels, &schedules);

    if let Some(path) = &args.dump {
        if let Err(e) = write_dump(path, &channels, &schedules) {
            error!("Failed to write {}: {}", path.display(), e);
            return Err(e);
        }
        info!("Schedules written to {}", path.display());
    }

    Ok(())
}
