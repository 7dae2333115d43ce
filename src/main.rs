// =============================================================================
// maestro — daily symphony execution engine
// =============================================================================
//
// Operator surface:
//   maestro schedule                 run the daily window loop
//   maestro run-once [--date DATE]   drive one window for a given date
//   maestro validate <FILE>          structural report for a symphony file
//   maestro reconcile                compare local positions to the broker
//
// Exit codes: 0 success, 1 validation error, 2 runtime error, 3 deadline
// exceeded.
// =============================================================================

mod arbiter;
mod broker;
mod config;
mod error;
mod evaluator;
mod events;
mod executor;
mod failure;
mod indicators;
mod market_data;
mod planner;
mod reconcile;
mod scheduler;
mod store;
mod symphony;
mod types;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::{AuthToken, BrokerClient};
use crate::config::EngineConfig;
use crate::events::EventBus;
use crate::market_data::eod::EodHistoricalClient;
use crate::market_data::vantage::AlphaVantageClient;
use crate::market_data::{FacadeTtls, MarketDataFacade, MarketDataProvider};
use crate::scheduler::{BrokerRegistry, Scheduler, WindowSummary};
use crate::store::EngineStores;
use crate::symphony::validator::ValidationReport;
use crate::types::Symphony;

const EXIT_VALIDATION: u8 = 1;
const EXIT_RUNTIME: u8 = 2;
const EXIT_DEADLINE: u8 = 3;

#[derive(Parser)]
#[command(name = "maestro", about = "Daily symphony execution engine", version)]
struct Cli {
    /// Engine configuration file.
    #[arg(long, default_value = "engine.json", global = true)]
    config: PathBuf,

    /// Directory of symphony JSON files to load at startup.
    #[arg(long, default_value = "symphonies", global = true)]
    symphonies: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daily scheduler loop.
    Schedule,
    /// Drive one execution window, then exit.
    RunOnce {
        /// Evaluation date (defaults to today in the exchange timezone).
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Validate one symphony file and print a structural report.
    Validate { file: PathBuf },
    /// Reconcile local positions against the broker.
    Reconcile,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let cfg = EngineConfig::load(&cli.config).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load engine config, using defaults");
        EngineConfig::default()
    });

    match run(cli, cfg).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal engine error");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

async fn run(cli: Cli, cfg: EngineConfig) -> anyhow::Result<ExitCode> {
    // `validate` needs no network wiring at all.
    if let Command::Validate { file } = &cli.command {
        return Ok(validate_file(file));
    }

    let stores = Arc::new(EngineStores::new());
    let events = EventBus::default();
    let facade = Arc::new(build_facade(&cfg)?);
    let brokers = Arc::new(BrokerRegistry::new());

    let user_id = std::env::var("MAESTRO_USER").unwrap_or_else(|_| "default".into());
    match build_broker(&cfg) {
        Some(broker) => brokers.register(&user_id, broker),
        None => warn!("BROKER_ACCESS_TOKEN not set; no symphonies will execute"),
    }

    let (loaded, rejected) = load_symphonies(&cli.symphonies, &user_id, &stores);
    info!(loaded, rejected, dir = %cli.symphonies.display(), "symphonies loaded");

    let scheduler = Scheduler::new(cfg.clone(), stores.clone(), facade, brokers.clone(), events);

    match cli.command {
        Command::Schedule => {
            info!("scheduler starting; ctrl-c to stop");
            tokio::select! {
                result = scheduler.run() => {
                    result?;
                    Ok(ExitCode::SUCCESS)
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!("shutdown signal received");
                    Ok(ExitCode::SUCCESS)
                }
            }
        }
        Command::RunOnce { date } => {
            let date = match date {
                Some(d) => d,
                None => Utc::now().with_timezone(&cfg.tz()?).date_naive(),
            };
            let summary = scheduler.run_once(date).await;
            info!(?summary, "run-once complete");
            Ok(exit_for_summary(&summary))
        }
        Command::Reconcile => {
            let mut clean = true;
            for user_id in brokers.user_ids() {
                let Some(broker) = brokers.get(&user_id) else { continue };
                let report =
                    reconcile::reconcile_positions(broker.as_ref(), &stores, &user_id).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                clean &= report.is_clean();
            }
            Ok(if clean { ExitCode::SUCCESS } else { ExitCode::from(EXIT_RUNTIME) })
        }
        Command::Validate { .. } => unreachable!("handled above"),
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn build_facade(cfg: &EngineConfig) -> anyhow::Result<MarketDataFacade> {
    use crate::market_data::provider::DataSource;

    let eod_token = std::env::var("EOD_API_TOKEN").unwrap_or_default();
    let vantage_key = std::env::var("ALPHA_VANTAGE_API_KEY").unwrap_or_default();

    let mut providers: Vec<Arc<dyn MarketDataProvider>> = Vec::new();
    for source in &cfg.provider_priority {
        match source {
            DataSource::EodHistorical => {
                providers.push(Arc::new(EodHistoricalClient::new(eod_token.clone())))
            }
            DataSource::AlphaVantage => {
                providers.push(Arc::new(AlphaVantageClient::new(vantage_key.clone())))
            }
            DataSource::Cache => {}
        }
    }
    if providers.is_empty() {
        anyhow::bail!("provider_priority configured no usable providers");
    }

    Ok(MarketDataFacade::new(
        providers,
        FacadeTtls::from_config(cfg),
        cfg.worker_concurrency.max(1),
    ))
}

fn build_broker(cfg: &EngineConfig) -> Option<Arc<BrokerClient>> {
    let token = std::env::var("BROKER_ACCESS_TOKEN").ok()?;
    Some(Arc::new(BrokerClient::new(
        cfg.broker_base_url.clone(),
        AuthToken::new(token, None),
        None,
    )))
}

/// Load, parse, and validate every `*.json` symphony in `dir`. Invalid files
/// are reported and skipped; valid trees activate immediately.
fn load_symphonies(dir: &PathBuf, user_id: &str, stores: &EngineStores) -> (usize, usize) {
    let mut loaded = 0usize;
    let mut rejected = 0usize;

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "symphony directory unreadable");
            return (0, 0);
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable symphony file");
                rejected += 1;
                continue;
            }
        };
        match symphony::parse_str(&text).and_then(|tree| {
            symphony::validate(&tree)?;
            Ok(tree)
        }) {
            Ok(tree) => {
                stores.symphonies.upsert(Symphony::new(user_id, tree));
                loaded += 1;
            }
            Err(e) => {
                error!(path = %path.display(), code = e.code(), error = %e, "symphony rejected");
                rejected += 1;
            }
        }
    }
    (loaded, rejected)
}

fn validate_file(file: &PathBuf) -> ExitCode {
    let text = match std::fs::read_to_string(file) {
        Ok(t) => t,
        Err(e) => {
            error!(path = %file.display(), error = %e, "cannot read file");
            return ExitCode::from(EXIT_RUNTIME);
        }
    };

    match symphony::parse_str(&text).and_then(|tree| symphony::validate(&tree)) {
        Ok(validated) => {
            let report = ValidationReport::from_validated(&validated);
            match serde_json::to_string_pretty(&report) {
                Ok(rendered) => println!("{rendered}"),
                Err(e) => {
                    error!(error = %e, "failed to render report");
                    return ExitCode::from(EXIT_RUNTIME);
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(code = e.code(), error = %e, "symphony failed validation");
            ExitCode::from(EXIT_VALIDATION)
        }
    }
}

/// A window that could not finish dispatching everything eligible before the
/// deadline reports exit code 3.
fn exit_for_summary(summary: &WindowSummary) -> ExitCode {
    if summary.executed + summary.failed < summary.eligible {
        return ExitCode::from(EXIT_DEADLINE);
    }
    if summary.failed > 0 {
        return ExitCode::from(EXIT_RUNTIME);
    }
    ExitCode::SUCCESS
}
