//! platewatch CLI
//!
//! Watches the sequencer intake directory and drives completed plates
//! through backup, conversion, upload, dispatch and retention.

#![forbid(unsafe_code)]

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use platewatch_core::config::{LogFormat, PlatewatchConfig};
use platewatch_core::dispatch::{Dispatcher, detection_queue};
use platewatch_core::error::format_error_with_remediation;
use platewatch_core::external::{AwsCliStore, ObjectStore};
use platewatch_core::lifecycle::{PlateLifecycle, run_retention};
use platewatch_core::logging::init_logging;
use platewatch_core::pairing::BucketSummary;
use platewatch_core::retention::{RetentionEngine, RetentionPolicy};
use platewatch_core::tier_lock::{LockMode, TierLockFile};
use platewatch_core::watcher::PlateWatcher;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "platewatch")]
#[command(version = platewatch_core::VERSION)]
#[command(about = "Sequencer plate intake: watch, convert, upload, dispatch and retire")]
struct Cli {
    /// Config file (default: $PLATEWATCH_CONFIG, then ./platewatch.toml)
    #[arg(long, short = 'c', global = true, env = "PLATEWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the intake root and process plates until interrupted
    Watch {
        /// Enqueue already-marked plates without a backup before watching
        #[arg(long)]
        catch_up: bool,
    },
    /// Validate the configuration and print the effective values
    CheckConfig {
        /// Print as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
    /// Run one retention pass
    Retention {
        /// Report what would be evicted without deleting anything
        #[arg(long)]
        dry_run: bool,
        /// Override the configured policy (age, space)
        #[arg(long)]
        policy: Option<RetentionPolicy>,
    },
    /// Pair read keys listed one per line in FILE (`-` for stdin)
    Pair {
        file: PathBuf,
    },
    /// Pair the FASTQ keys stored under one or more bucket prefixes
    Summary {
        #[arg(long)]
        bucket: String,
        #[arg(long = "prefix", required = true)]
        prefixes: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<platewatch_core::Error>() {
                Some(core) => eprintln!("{}", format_error_with_remediation(core)),
                None => eprintln!("Error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = PlatewatchConfig::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_logging(&config.logging).context("failed to initialize logging")?;

    match cli.command {
        Commands::Watch { catch_up } => {
            if catch_up {
                config.watch.catch_up_on_start = true;
            }
            watch(config).await
        }
        Commands::CheckConfig { json } => check_config(&config, json),
        Commands::Retention { dry_run, policy } => retention(&config, dry_run, policy).await,
        Commands::Pair { file } => pair(&file),
        Commands::Summary { bucket, prefixes } => summary(&config, &bucket, &prefixes).await,
    }
}

async fn watch(config: PlatewatchConfig) -> anyhow::Result<()> {
    let (sender, queue) = detection_queue(config.workers.queue_capacity);
    let watcher = PlateWatcher::new(&config, sender)?;

    let tier_lock = Arc::new(RwLock::new(()));
    let lifecycle = PlateLifecycle::from_config(&config).with_tier_lock(tier_lock);
    let dispatcher = tokio::spawn(Dispatcher::new(lifecycle, &config.workers).run(queue));

    let handle = watcher.start()?;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested; finishing in-flight plates");

    // joining the watcher thread releases the last detection sender
    tokio::task::spawn_blocking(move || handle.stop())
        .await
        .context("watcher shutdown failed")?;
    let summary = dispatcher.await.context("dispatcher task failed")?;
    if summary.errored > 0 {
        warn!(errored = summary.errored, "Some plates ended in error");
    }
    Ok(())
}

fn check_config(config: &PlatewatchConfig, json: bool) -> anyhow::Result<()> {
    config.validate().map_err(platewatch_core::Error::from)?;
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        print!("{}", config.to_toml()?);
    }
    Ok(())
}

async fn retention(
    config: &PlatewatchConfig,
    dry_run: bool,
    policy: Option<RetentionPolicy>,
) -> anyhow::Result<()> {
    config.validate().map_err(platewatch_core::Error::from)?;
    let mut engine = RetentionEngine::new(config.roots.clone(), config.retention.clone())
        .with_dry_run(dry_run);
    if let Some(policy) = policy {
        engine = engine.with_policy(policy);
    }

    // a watcher holds the lock shared while it has plates in flight
    let _lock = if dry_run {
        None
    } else {
        Some(TierLockFile::new(&config.roots).try_acquire(LockMode::Exclusive)?)
    };
    let report = run_retention(&RwLock::new(()), None, engine).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_clean() {
        anyhow::bail!("{} eviction(s) failed", report.failures.len());
    }
    Ok(())
}

fn pair(file: &Path) -> anyhow::Result<()> {
    let content = if file == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read keys from stdin")?;
        buf
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("failed to read keys from {}", file.display()))?
    };

    let keys = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    let summary = BucketSummary::from_keys(file.display().to_string(), keys);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn summary(config: &PlatewatchConfig, bucket: &str, prefixes: &[String]) -> anyhow::Result<()> {
    let store = AwsCliStore::new(
        config.storage.aws_program.clone(),
        config.storage.endpoint_url.clone(),
    );

    let mut keys = Vec::new();
    for prefix in prefixes {
        let listed = store.list_keys(bucket, prefix).await?;
        info!(bucket, prefix = %prefix, keys = listed.len(), "Listed prefix");
        keys.extend(listed);
    }

    let summary = BucketSummary::from_keys(bucket, keys);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
