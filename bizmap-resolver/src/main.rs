//! bizmap - command-line entry point
//!
//! Subcommands:
//! - `match`: resolve input records against every configured source
//! - `enrich`: attach listing details to matched slots
//! - `neighborhoods`: fill missing neighborhoods in a place snapshot
//! - `repair`: repair a truncated JSON snapshot in place
//! - `progress`: read-only progress summary

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bizmap_common::config::{load_toml_config, resolve_config_path, resolve_data_folder};
use bizmap_common::logging::init_logging;
use bizmap_resolver::neighborhood::{fill_neighborhoods, NominatimClient, PassStatus};
use bizmap_resolver::progress::progress_report;
use bizmap_resolver::quota::QuotaLedger;
use bizmap_resolver::repair::repair_file;
use bizmap_resolver::types::load_source_records;
use bizmap_resolver::workflow::exit_codes;
use bizmap_resolver::{EnrichmentRun, MappingStore, MatchRun, ResolveError, RunConfig};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Command-line arguments for bizmap
#[derive(Parser, Debug)]
#[command(name = "bizmap")]
#[command(about = "Match business records against external directories")]
#[command(version)]
struct Args {
    /// Config file (defaults to BIZMAP_CONFIG, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data folder holding the input and mapping files
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve pending records against every source
    Match {
        /// Skip null slots an earlier run already searched
        #[arg(long)]
        skip_searched: bool,
    },
    /// Fetch listing details for matched slots
    Enrich,
    /// Fill missing neighborhoods in a place snapshot
    Neighborhoods {
        /// JSON array of place records
        path: PathBuf,
    },
    /// Repair a truncated JSON snapshot (a .backup copy is kept)
    Repair {
        path: PathBuf,
    },
    /// Print a read-only progress summary
    Progress,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Run failed");
            eprintln!("Error: {:#}", e);
            error_exit_code(&e)
        }
    };

    std::process::exit(code);
}

fn error_exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<ResolveError>() {
        Some(ResolveError::Corrupt { .. }) => exit_codes::EXIT_CORRUPT,
        Some(e) if e.is_fatal() => exit_codes::EXIT_AUTH_FAILED,
        _ => exit_codes::EXIT_FAILURE,
    }
}

async fn run(args: Args) -> Result<i32> {
    let config_path = resolve_config_path(args.config.as_deref());
    let toml_config = load_toml_config(config_path.as_deref()).context("Failed to load configuration")?;

    init_logging(&toml_config.logging, "bizmap_resolver").context("Failed to initialise logging")?;

    if let Some(path) = &config_path {
        info!("Configuration: {}", path.display());
    }

    let data_folder = resolve_data_folder(args.data_dir.as_deref(), &toml_config);
    let mut config = RunConfig::from_toml(&toml_config, &data_folder);
    info!("Data folder: {}", data_folder.display());

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });

    match args.command {
        Command::Match { skip_searched } => {
            if skip_searched {
                config.revisit_unmatched = false;
            }
            run_match(&config, &cancel).await
        }
        Command::Enrich => run_enrich(&config, &cancel).await,
        Command::Neighborhoods { path } => run_neighborhoods(&config, &path, &cancel).await,
        Command::Repair { path } => {
            let report = repair_file(&path).with_context(|| format!("Failed to repair {}", path.display()))?;
            println!(
                "{}: {} ({} elements, {} bytes discarded)",
                report.path.display(),
                report.strategy,
                report.elements_recovered,
                report.bytes_discarded
            );
            if let Some(backup) = report.backup {
                println!("Backup: {}", backup.display());
            }
            Ok(exit_codes::EXIT_OK)
        }
        Command::Progress => {
            let report = progress_report(&config).context("Failed to build progress report")?;
            print!("{}", report.display_string());
            Ok(exit_codes::EXIT_OK)
        }
    }
}

fn open_store(config: &RunConfig, ledger: Arc<QuotaLedger>) -> Result<MappingStore> {
    let (store, repair) = MappingStore::open(&config.mapping_file)
        .with_context(|| format!("Failed to open {}", config.mapping_file.display()))?;
    if let Some(report) = repair {
        warn!(
            "Mapping file was truncated; recovered {} entries ({})",
            report.elements_recovered, report.strategy
        );
    }
    Ok(store.with_ledger(ledger))
}

async fn run_match(config: &RunConfig, cancel: &CancellationToken) -> Result<i32> {
    let ledger = Arc::new(QuotaLedger::load(&config.quota_ledger).context("Failed to load quota ledger")?);
    let chains = config.build_chains(Arc::clone(&ledger))?;
    let records = load_source_records(&config.input_file)
        .with_context(|| format!("Failed to read {}", config.input_file.display()))?;
    let mut store = open_store(config, ledger)?;

    let run = MatchRun::new(chains, config.matcher(), config.revisit_unmatched);
    let outcome = run.execute(&records, &mut store, cancel).await?;

    println!("{}", outcome.statistics.display_string());
    for (source, stats) in &outcome.statistics.sources {
        println!("  {}: {}", source, stats.display_string());
    }
    println!("Status: {}", outcome.status);
    println!("{}", outcome.status.resume_hint());

    Ok(outcome.status.exit_code())
}

async fn run_enrich(config: &RunConfig, cancel: &CancellationToken) -> Result<i32> {
    let ledger = Arc::new(QuotaLedger::load(&config.quota_ledger).context("Failed to load quota ledger")?);
    let chains = config.build_chains(Arc::clone(&ledger))?;
    let mut store = open_store(config, ledger)?;

    let outcome = EnrichmentRun::new(chains).execute(&mut store, cancel).await?;

    println!("{}", outcome.statistics.display_string());
    println!("Status: {}", outcome.status);
    println!("{}", outcome.status.resume_hint());

    Ok(outcome.status.exit_code())
}

async fn run_neighborhoods(
    config: &RunConfig,
    path: &std::path::Path,
    cancel: &CancellationToken,
) -> Result<i32> {
    let geocoder = NominatimClient::new(&config.geocoding, config.backoff.clone())?;
    let summary = fill_neighborhoods(path, &geocoder, &config.geocoding, cancel)
        .await
        .with_context(|| format!("Neighborhood pass failed for {}", path.display()))?;

    println!(
        "{} places: {} already filled, {} updated ({} reverse, {} forward, {} address), {} not found, {} errors",
        summary.total,
        summary.already_filled,
        summary.updated,
        summary.by_reverse,
        summary.by_forward,
        summary.by_address,
        summary.not_found,
        summary.errors
    );

    Ok(match summary.status {
        Some(PassStatus::Interrupted) => {
            println!("Interrupted. Re-run the same command to continue.");
            exit_codes::EXIT_INTERRUPTED
        }
        Some(PassStatus::TooManyErrors) => exit_codes::EXIT_FAILURE,
        _ => exit_codes::EXIT_OK,
    })
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        },
        _ = terminate => {
            info!("Received terminate signal, stopping");
        },
    }
}
