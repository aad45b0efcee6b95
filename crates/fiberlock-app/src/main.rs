//! Fiberlock Application
//!
//! Command-line entry point for the fiber photometry pipeline: demodulate
//! a raw recording into a trace table, then align the table onto the
//! behavior stream.
//!
//! # Usage
//!
//! ```bash
//! # Demodulate a raw recording (config found in the session directory)
//! fiberlock demodulate --session-dir data/M1_day3 --raw data/M1_day3/raw.csv --out traces.json
//!
//! # Align the trace table onto the behavior files
//! fiberlock sync --config data/M1_day3/meta.toml --traces traces.json \
//!     --behavior-dir data/behavior --subject M1 --out synced.json
//!
//! # Show the resolved processing plan and channels
//! fiberlock plan --config data/M1_day3/meta.toml
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use fiberlock_core::SessionConfig;
use fiberlock_native::{
    demodulate_session, load_trace_table, save_json, sync_session, BehaviorData, CsvSource,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Fiberlock Application
#[derive(Parser, Debug)]
#[command(name = "fiberlock")]
#[command(author, version, about = "Fiber photometry demodulation and behavior alignment", long_about = None)]
struct Cli {
    /// Logging verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Where the session metafile comes from
#[derive(clap::Args, Debug)]
struct ConfigArgs {
    /// Session metafile (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Session directory searched for the first `*.toml` metafile
    #[arg(long, conflicts_with = "config")]
    session_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Demodulate a raw CSV recording into a trace table
    Demodulate {
        #[command(flatten)]
        config: ConfigArgs,

        /// Raw recording, one column per channel
        #[arg(short, long)]
        raw: PathBuf,

        /// Output trace table (JSON)
        #[arg(short, long, default_value = "traces.json")]
        out: PathBuf,
    },

    /// Align a trace table onto the behavior stream
    Sync {
        #[command(flatten)]
        config: ConfigArgs,

        /// Trace table written by `demodulate`
        #[arg(short, long)]
        traces: PathBuf,

        /// Directory holding the behavior CSV files
        #[arg(short, long)]
        behavior_dir: PathBuf,

        /// Subject identifier (defaults to the metafile's Subject_ID)
        #[arg(short, long)]
        subject: Option<String>,

        /// Output synced session (JSON)
        #[arg(short, long, default_value = "synced.json")]
        out: PathBuf,
    },

    /// Print the resolved processing plan and channel table
    Plan {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Fiberlock v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Demodulate { config, raw, out } => run_demodulate(&config, &raw, &out)?,
        Commands::Sync {
            config,
            traces,
            behavior_dir,
            subject,
            out,
        } => run_sync(&config, &traces, &behavior_dir, subject, &out)?,
        Commands::Plan { config } => print_plan(&config)?,
    }

    Ok(())
}

/// Load the metafile. A missing or malformed file yields an empty
/// configuration, which later fails validation for lack of a sampling
/// frequency.
fn load_config(args: &ConfigArgs) -> anyhow::Result<SessionConfig> {
    let path = match (&args.config, &args.session_dir) {
        (Some(path), _) => path.clone(),
        (None, Some(dir)) => SessionConfig::find_in_dir(dir)
            .with_context(|| format!("no *.toml metafile in {}", dir.display()))?,
        (None, None) => anyhow::bail!("pass --config or --session-dir"),
    };
    Ok(SessionConfig::load_or_empty(&path))
}

/// Demodulate a raw recording
fn run_demodulate(args: &ConfigArgs, raw: &Path, out: &Path) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let source = CsvSource::open(raw)?;
    let table = demodulate_session(&config, &source)?;

    save_json(&table, out).with_context(|| format!("writing {}", out.display()))?;
    info!(traces = table.traces.len(), out = %out.display(), "Wrote trace table");
    Ok(())
}

/// Align a trace table onto the behavior files
fn run_sync(
    args: &ConfigArgs,
    traces: &Path,
    behavior_dir: &Path,
    subject: Option<String>,
    out: &Path,
) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let plan = config.validate()?;
    let subject = subject
        .or_else(|| config.subject_id.clone())
        .context("no subject given and the metafile has no Subject_ID")?;

    let table = load_trace_table(traces)?;
    let behavior = BehaviorData::load(behavior_dir, &subject, plan.behavior_sampling)?;
    let synced = sync_session(&table, &behavior, &plan)?;

    save_json(&synced, out).with_context(|| format!("writing {}", out.display()))?;
    info!(
        subject,
        offset_trials = synced.offset_trials,
        time_offset = synced.time_offset,
        out = %out.display(),
        "Wrote synced session"
    );
    Ok(())
}

/// Print the resolved plan and channels as JSON
fn print_plan(args: &ConfigArgs) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let plan = config.validate()?;
    let channels = config.channel_configurations()?;

    let summary = serde_json::json!({
        "subject": config.subject_id,
        "plan": plan,
        "channels": channels,
        "sync": config.signal_indices.sync,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
