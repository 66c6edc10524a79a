//! `tradeledger` CLI: archival, export, integrity and monitoring entry
//! points over the journal core.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradeledger_backend::config::CoreConfig;
use tradeledger_backend::error::CoreError;
use tradeledger_backend::ledger::archival::{previous_month, ArchivalManager};
use tradeledger_backend::ledger::exporters::{export_ledger, ExportFormat};
use tradeledger_backend::ledger::integrity::IntegrityChecker;
use tradeledger_backend::ledger::LedgerFilter;
use tradeledger_backend::orders::store::OrderStore;
use tradeledger_backend::orders::triggers::{TriggerConfig, TriggerMonitor};
use tradeledger_backend::reporting::pnl::PnlEngine;
use tradeledger_backend::reporting::tax::{TaxExportFormat, TaxReportGenerator};
use tradeledger_backend::store::Store;
use tradeledger_backend::system::state::SystemStateController;
use tradeledger_backend::tokens::TokenRegistry;
use tradeledger_backend::trading::interfaces::{
    ExecutionResult, OrderExecutor, OrderSlice, PriceFeed, PriceQuote,
};
use tradeledger_backend::{CoreResult, TokenRef};

#[derive(Parser)]
#[command(name = "tradeledger", about = "Local-first DEX trading journal core")]
struct Cli {
    /// Config file; defaults and environment overrides apply when absent.
    #[arg(long, env = "TRADELEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path.
    #[arg(long, env = "TRADELEDGER_DB", default_value = "data/tradeledger.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending schema migrations and exit.
    Migrate,
    /// Archive one calendar month (defaults to the previous month).
    Archive {
        /// Month as YYYY-MM.
        #[arg(long)]
        month: Option<String>,
    },
    /// Run the archive retention scan.
    Retention,
    /// Export a user's ledger.
    ExportLedger {
        #[arg(long, default_value_t = 1)]
        user: i64,
        #[arg(long, default_value = "csv")]
        format: String,
    },
    /// Generate an annual tax report.
    ExportTax {
        #[arg(long, default_value_t = 1)]
        user: i64,
        #[arg(long)]
        year: i32,
        #[arg(long)]
        jurisdiction: Option<String>,
        #[arg(long, default_value = "csv")]
        format: String,
    },
    /// Scan ledger integrity; non-zero exit on critical issues.
    Integrity {
        #[arg(long)]
        fix: bool,
        #[arg(long)]
        user: Option<i64>,
    },
    /// Print component status and emergency state.
    Status,
    /// Run the trigger monitor loop until interrupted.
    Monitor,
}

/// Placeholder collaborators for CLI runs without a configured oracle or
/// router adapter: every call reports the dependency as unavailable, which
/// leaves orders active and state untouched.
struct UnconfiguredFeed;

#[async_trait::async_trait]
impl PriceFeed for UnconfiguredFeed {
    async fn get_price(&self, token: &TokenRef) -> CoreResult<PriceQuote> {
        Err(CoreError::ExternalUnavailable(format!(
            "no price feed configured (requested {token})"
        )))
    }
}

struct UnconfiguredExecutor;

#[async_trait::async_trait]
impl OrderExecutor for UnconfiguredExecutor {
    async fn execute(&self, _slice: &OrderSlice) -> CoreResult<ExecutionResult> {
        Err(CoreError::ExternalUnavailable(
            "no executor configured".to_string(),
        ))
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("info,tradeledger_backend=debug")
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => {}
        Err(err) => {
            if let Some(core) = err.downcast_ref::<CoreError>() {
                error!(code = core.code(), "{core}");
                std::process::exit(core.exit_code());
            }
            error!("{err:#}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => CoreConfig::load(path)?,
        None => CoreConfig::from_env()?,
    };
    config.ensure_directories()?;
    let config = Arc::new(config);

    let store = Store::open(&cli.db).await?;
    bootstrap_default_user(&store).await?;
    let system = SystemStateController::new(store.clone());
    let tokens = TokenRegistry::new(store.clone());

    match cli.command {
        Command::Migrate => {
            let version = store.schema_version().await?;
            info!(version, "schema up to date");
            println!("schema version {version}");
        }
        Command::Archive { month } => {
            let (year, month) = match month {
                Some(raw) => parse_month(&raw)?,
                None => previous_month(chrono::Utc::now()),
            };
            let manager = ArchivalManager::new(store.clone(), config.clone());
            let report = manager.archive_month(year, month).await?;
            if !report.verification_passed {
                anyhow::bail!(CoreError::IntegrityViolation(format!(
                    "archive verification failed: {:?}",
                    report.errors
                )));
            }
            println!(
                "archived {} entries for {} users ({} files)",
                report.total_entries,
                report.users_archived,
                report.files.len()
            );
        }
        Command::Retention => {
            let manager = ArchivalManager::new(store.clone(), config.clone());
            let report = manager.run_retention().await?;
            println!(
                "retention: scanned {}, deleted {}, kept {}",
                report.scanned, report.deleted, report.kept
            );
        }
        Command::ExportLedger { user, format } => {
            let format: ExportFormat = format.parse()?;
            let summary = export_ledger(
                &store,
                user,
                &LedgerFilter::default(),
                format,
                &config.exports_dir,
            )
            .await?;
            println!("exported {} rows to {}", summary.rows, summary.path.display());
        }
        Command::ExportTax {
            user,
            year,
            jurisdiction,
            format,
        } => {
            let jurisdiction = match jurisdiction {
                Some(raw) => raw.parse()?,
                None => config.tax_jurisdiction,
            };
            let format: TaxExportFormat = format.parse()?;
            let engine = PnlEngine::new(store.clone(), config.accounting_method);
            let generator = TaxReportGenerator::new(store.clone(), engine, jurisdiction);
            let report = generator
                .generate_annual_report(user, year, format, &config.exports_dir)
                .await?;
            println!(
                "tax year {year}: net gains {} across {} events",
                report.summary.net_capital_gains_base, report.summary.total_events
            );
            for file in &report.export_files {
                println!("  {}", file.display());
            }
        }
        Command::Integrity { fix, user } => {
            let checker = IntegrityChecker::new(store.clone(), system.clone());
            let report = checker.run_check(user, fix).await?;
            println!(
                "{} issues ({} repaired)",
                report.total_issues,
                report.repairs.iter().filter(|r| r.success).count()
            );
            for issue in &report.issues {
                println!("  [{:?}] {}", issue.severity, issue.description);
            }
            if report.has_critical() {
                anyhow::bail!(CoreError::IntegrityViolation(
                    "critical integrity issues found".to_string()
                ));
            }
        }
        Command::Status => {
            let states = system.status_overview().await?;
            if states.is_empty() {
                println!("no components registered");
            }
            for state in states {
                println!(
                    "{:<20} {:<10} emergency={} heartbeat={}",
                    state.state_id,
                    state.status,
                    state.is_emergency_stopped,
                    state
                        .last_heartbeat_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string()),
                );
            }
            if system.any_emergency_stopped().await? {
                anyhow::bail!(CoreError::EmergencyActive(
                    "one or more components are emergency-stopped".to_string()
                ));
            }
        }
        Command::Monitor => {
            let orders = OrderStore::new(store.clone());
            let monitor = TriggerMonitor::new(
                store.clone(),
                orders,
                tokens,
                system,
                Arc::new(UnconfiguredFeed),
                Arc::new(UnconfiguredExecutor),
                TriggerConfig {
                    tick: std::time::Duration::from_millis(config.trigger_tick_ms),
                    ..Default::default()
                },
            );
            let loop_handle = monitor.clone();
            let run = tokio::spawn(async move { loop_handle.run().await });
            tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
            info!("shutdown requested");
            monitor.shutdown();
            run.await.context("join monitor loop")??;
        }
    }
    Ok(())
}

/// One local user per install, created at bootstrap and never destroyed.
async fn bootstrap_default_user(store: &Store) -> CoreResult<()> {
    store
        .with_tx(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO users (user_id, username, created_at) \
                 VALUES (1, 'local', ?1)",
                rusqlite::params![tradeledger_backend::store::ts_to_sql(chrono::Utc::now())],
            )?;
            Ok(())
        })
        .await
}

fn parse_month(raw: &str) -> anyhow::Result<(i32, u32)> {
    let (year, month) = raw
        .split_once('-')
        .ok_or_else(|| CoreError::InputInvalid(format!("month must be YYYY-MM, got {raw}")))?;
    let year: i32 = year
        .parse()
        .map_err(|_| CoreError::InputInvalid(format!("bad year in {raw}")))?;
    let month: u32 = month
        .parse()
        .map_err(|_| CoreError::InputInvalid(format!("bad month in {raw}")))?;
    if !(1..=12).contains(&month) {
        anyhow::bail!(CoreError::InputInvalid(format!("month out of range: {raw}")));
    }
    Ok((year, month))
}
