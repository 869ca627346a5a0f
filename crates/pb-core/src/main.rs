//! Proxy Buffer Core - operator binary
//!
//! Entry point for inspecting buffer configuration and exercising the buffer
//! against the in-process database:
//! - `config check` validates `buffer.toml` and prints its snapshot
//! - `simulate` runs concurrent writers against one uploader
//! - `schema` prints the JSON schema of the stats output

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use pb_common::{
    format_error_human, AutoregRecord, BufferMode, DiscoveryRecord, Error, ErrorCategory,
    HistoryRecord, More, StructuredError, SCHEMA_VERSION,
};
use pb_config::{load_config, parse_size, LoadedConfig};
use pb_core::exit_codes::ExitCode;
use pb_core::logging::{event_names, generate_run_id, init_logging, LogConfig, LogFormat, LogLevel};
use pb_core::{BufferRecord, BufferStats, InMemoryDatabase, ProxyBuffer};
use rand::Rng;
use serde::Serialize;
use tracing::{error, info};

/// Proxy Buffer Core - telemetry buffering between collectors and upload
#[derive(Parser)]
#[command(name = "pb-core")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Path to buffer.toml (overrides PB_CONFIG and PB_CONFIG_DIR)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log format (human, jsonl)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config(ConfigArgs),

    /// Run writers and an uploader against an in-process database
    Simulate(SimulateArgs),

    /// Print JSON schema for the stats output
    Schema,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Validate the resolved configuration and print its snapshot
    Check,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Override the configured mode (disk, memory, hybrid)
    #[arg(long)]
    mode: Option<BufferMode>,

    /// Override the configured arena size (e.g. 256K, 16M)
    #[arg(long)]
    memory_size: Option<String>,

    /// Records written per writer thread
    #[arg(long, default_value_t = 1000)]
    records: usize,

    /// Concurrent writer threads
    #[arg(long, default_value_t = 4)]
    writers: usize,

    /// Records per write handle
    #[arg(long, default_value_t = 50)]
    batch: usize,

    /// Rows per upload request
    #[arg(long, default_value_t = 500)]
    upload_count: usize,

    /// Serialized bytes per upload request
    #[arg(long, default_value_t = 64 * 1024)]
    upload_bytes: usize,

    /// Fraction of commits failing transiently
    #[arg(long, default_value_t = 0.0)]
    db_failure_rate: f64,

    /// Override the configured delay between database retries
    #[arg(long)]
    db_retry_delay_ms: Option<u64>,
}

fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::from_env(cli.global.log_level, cli.global.log_format);
    init_logging(&log_config);

    let exit_code = match &cli.command {
        Commands::Config(args) => run_config(&cli.global, args),
        Commands::Simulate(args) => run_simulate(&cli.global, args),
        Commands::Schema => run_schema(),
    };

    std::process::exit(exit_code.as_i32());
}

fn report_error(err: &Error) -> ExitCode {
    let exit_code = ExitCode::from_error(err);
    let event = match err.category() {
        ErrorCategory::Config => event_names::CONFIG_ERROR,
        _ => event_names::COMMAND_FAILED,
    };
    error!(
        event = event,
        code = err.code(),
        "{}",
        StructuredError::from(err).to_json()
    );
    eprintln!("{}", format_error_human(err, std::io::stderr().is_terminal()));
    exit_code
}

fn load(global: &GlobalOpts) -> Result<LoadedConfig, Error> {
    let loaded = load_config(global.config.as_deref())?;
    if loaded.snapshot.path.is_none() {
        info!(
            event = event_names::CONFIG_DEFAULT_USED,
            "no buffer.toml found, using defaults"
        );
    } else {
        info!(
            event = event_names::CONFIG_LOADED,
            config_id = loaded.snapshot.short_id(),
            "configuration loaded"
        );
    }
    Ok(loaded)
}

fn run_config(global: &GlobalOpts, args: &ConfigArgs) -> ExitCode {
    match args.command {
        ConfigCommands::Check => match load(global) {
            Ok(loaded) => match loaded.snapshot.to_json() {
                Ok(json) => {
                    println!("{}", json);
                    ExitCode::Clean
                }
                Err(e) => report_error(&Error::from(e)),
            },
            Err(e) => report_error(&e),
        },
    }
}

fn run_schema() -> ExitCode {
    let schema = schemars::schema_for!(BufferStats);
    match serde_json::to_string_pretty(&schema) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::Clean
        }
        Err(e) => report_error(&Error::from(e)),
    }
}

/// Rows delivered upstream per kind.
#[derive(Debug, Default, Serialize)]
struct Uploaded {
    history: u64,
    discovery: u64,
    autoreg: u64,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    schema_version: &'static str,
    run_id: String,
    generated_at: String,
    elapsed_ms: u128,
    written: u64,
    uploaded: Uploaded,
    commits: u64,
    commit_attempts: u64,
    stats: BufferStats,
}

fn run_simulate(global: &GlobalOpts, args: &SimulateArgs) -> ExitCode {
    let mut config = match load(global) {
        Ok(loaded) => loaded.config,
        Err(e) => return report_error(&e),
    };
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(size) = &args.memory_size {
        match parse_size(size) {
            Ok(bytes) => config.memory_size = bytes,
            Err(e) => return report_error(&Error::from(e)),
        }
    }
    if let Some(delay) = args.db_retry_delay_ms {
        config.db_retry_delay_ms = delay;
    }
    if config.mode.uses_memory() && config.memory_size == 0 {
        config.memory_size = 16 * 1024 * 1024;
    }

    let db = Arc::new(InMemoryDatabase::new());
    let buffer = match ProxyBuffer::create(config, db.clone()) {
        Ok(buffer) => buffer,
        Err(e) => return report_error(&e),
    };

    let run_id = generate_run_id();
    info!(
        run_id = %run_id,
        writers = args.writers,
        records = args.records,
        "simulation started"
    );

    let started = Instant::now();
    let finished = AtomicUsize::new(0);
    let mut uploaded = Uploaded::default();
    let mut idle_rounds = 0;

    thread::scope(|scope| {
        for writer in 0..args.writers {
            let buffer = &buffer;
            let finished = &finished;
            scope.spawn(move || {
                write_records(buffer, writer, args);
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }

        loop {
            let done = finished.load(Ordering::SeqCst) == args.writers;
            if args.db_failure_rate > 0.0
                && rand::rng().random_bool(args.db_failure_rate.min(1.0))
            {
                db.fail_next_commits(1);
            }

            let mut more = false;
            let mut sent = 0;
            sent += upload::<HistoryRecord>(&buffer, args, &mut uploaded.history, &mut more);
            sent += upload::<DiscoveryRecord>(&buffer, args, &mut uploaded.discovery, &mut more);
            sent += upload::<AutoregRecord>(&buffer, args, &mut uploaded.autoreg, &mut more);
            buffer.update_state(More::from_bool(more));

            if sent > 0 {
                idle_rounds = 0;
                continue;
            }
            // A drained database may hand reads over to the arena, so one
            // empty round is not enough to stop.
            idle_rounds += 1;
            if done && idle_rounds > 2 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
    });

    let report = SimulationReport {
        schema_version: SCHEMA_VERSION,
        run_id,
        generated_at: Utc::now().to_rfc3339(),
        elapsed_ms: started.elapsed().as_millis(),
        written: (args.writers * args.records) as u64,
        uploaded,
        commits: db.commits(),
        commit_attempts: db.commit_attempts(),
        stats: buffer.stats(),
    };
    buffer.destroy();

    match serde_json::to_string_pretty(&report) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::Clean
        }
        Err(e) => report_error(&Error::from(e)),
    }
}

/// Write `args.records` records of mixed kinds in batches.
fn write_records(buffer: &ProxyBuffer, writer: usize, args: &SimulateArgs) {
    let mut rng = rand::rng();
    let mut remaining = args.records;
    while remaining > 0 {
        let count = remaining.min(args.batch.max(1));
        remaining -= count;
        let clock = Utc::now().timestamp();

        match rng.random_range(0..10) {
            0 => {
                let mut handle = buffer.open::<DiscoveryRecord>();
                for i in 0..count {
                    let ip = format!("10.{}.{}.{}", writer % 256, i / 256 % 256, i % 256);
                    handle.write(DiscoveryRecord::new(writer as u64 + 1, clock, ip));
                }
                handle.close();
            }
            1 => {
                let mut handle = buffer.open::<AutoregRecord>();
                for i in 0..count {
                    handle.write(AutoregRecord::new(format!("host-{}-{}", writer, i), clock));
                }
                handle.close();
            }
            _ => {
                let mut handle = buffer.open::<HistoryRecord>();
                for _ in 0..count {
                    let itemid = rng.random_range(1..10_000u64);
                    let value = rng.random_range(0.0..100.0f64).to_string();
                    handle.write(HistoryRecord::new(itemid, clock, value));
                }
                handle.close();
            }
        }
    }
}

/// Upload one batch of `R`. Returns the number of rows acknowledged.
fn upload<R: BufferRecord>(
    buffer: &ProxyBuffer,
    args: &SimulateArgs,
    total: &mut u64,
    more: &mut bool,
) -> u64 {
    let batch = buffer.get_rows::<R>(args.upload_bytes, args.upload_count);
    if batch.more == More::Available {
        *more = true;
    }
    if batch.rows.is_empty() {
        return 0;
    }
    let count = batch.rows.len() as u64;
    *total += count;
    buffer.set_lastid(R::KIND, batch.lastid);
    count
}
