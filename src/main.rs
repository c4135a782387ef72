//! Colosseum - competitive pattern and agent evolution
//!
//! - Patterns duel on historical segments and are promoted or retired by votes
//! - Agents trade with the winning patterns and learn from every outcome
//! - Periodic evolution culls the weakest agents and clones the strongest

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use colosseum::config::Config;
use colosseum::core::{Engine, NoopOracle, Scheduler, TaskKind};
use colosseum::data::{CsvSource, EvolutionStore, PriceSource, SyntheticSource};
use colosseum::status::{AuditExport, SystemStatus};

const SEP: &str = "===========================================================";

#[derive(Parser)]
#[command(name = "colosseum", version, about = "Competitive pattern and agent evolution engine")]
struct Cli {
    /// Configuration file; defaults apply when it does not exist
    #[arg(long, short, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every task on its interval until ctrl-c
    Run,
    /// Run one tick of a single task
    Tick {
        /// ingest, pattern-arena, decisions, agent-arena or evolution
        kind: String,
        /// Run evolution even when the cadence says it is not due
        #[arg(long)]
        force: bool,
    },
    /// Print a status snapshot built from the store
    Status,
    /// Export lineage and knowledge-sharing history as JSON
    Export {
        #[arg(long, default_value = "colosseum_audit.json")]
        out: String,
    },
    /// Create founders and fill the pattern library
    Seed,
}

fn parse_level(level: &str) -> Level {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn load_config(path: &str) -> Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::load(path)
    } else {
        Ok(Config::default())
    }
}

fn build_source(config: &Config) -> Arc<dyn PriceSource> {
    match &config.market.data_dir {
        Some(dir) => Arc::new(CsvSource::new(dir.as_str())),
        None => Arc::new(SyntheticSource::new(config.system.seed)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(&config.system.log_level))
        .with_target(false)
        .with_thread_ids(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let store = Arc::new(
        EvolutionStore::open(&config.system.database, config.store.retry_policy())
            .with_context(|| format!("Failed to open store: {}", config.system.database))?,
    );
    let engine = Arc::new(Engine::new(
        &config,
        store.clone(),
        build_source(&config),
        Arc::new(NoopOracle),
    ));

    match cli.command {
        Command::Run => run_daemon(config, engine).await,
        Command::Tick { kind, force } => {
            let kind = TaskKind::from_str(&kind).with_context(|| format!("Unknown task kind: {}", kind))?;
            let scheduler = Scheduler::new(engine, config.scheduler.clone());
            let outcome = if force && kind == TaskKind::Evolution {
                scheduler.force_evolution().await?
            } else {
                scheduler.trigger(kind).await?
            };
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Command::Status => {
            let status = SystemStatus::collect(&store, Vec::new())?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Export { out } => {
            let export = AuditExport::collect(&store)?;
            export.save(&out).with_context(|| format!("Failed to write {}", out))?;
            info!(lineage = export.lineage.len(), sharing = export.sharing.len(), path = %out, "audit exported");
            Ok(())
        }
        Command::Seed => {
            let (founders, discovered) = engine.seed().await?;
            info!(founders, discovered, "seeded");
            Ok(())
        }
    }
}

async fn run_daemon(config: Config, engine: Arc<Engine>) -> Result<()> {
    info!("{}", SEP);
    info!("COLOSSEUM - pattern and agent evolution");
    info!("Database: {}", config.system.database);
    info!("Symbols: {}", config.market.symbols.join(", "));
    match &config.market.data_dir {
        Some(dir) => info!("Prices: csv from {}", dir),
        None => info!("Prices: synthetic (seed {})", config.system.seed),
    }
    info!("{}", SEP);

    let (founders, discovered) = engine.seed().await?;
    info!(founders, discovered, "population ready");

    let scheduler = Arc::new(Scheduler::new(engine.clone(), config.scheduler.clone()));

    // Status writer
    let status_file = config.system.status_file.clone();
    let status_scheduler = scheduler.clone();
    let status_period = config.scheduler.ingest.interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(status_period);
        loop {
            ticker.tick().await;
            let health = status_scheduler.health();
            match SystemStatus::collect(&status_scheduler.engine().store, health) {
                Ok(status) => {
                    for kind in status.failing_tasks() {
                        warn!(task = kind, "task failing");
                    }
                    if let Err(e) = status.save(&status_file) {
                        warn!(cause = %e, "status write failed");
                    }
                }
                Err(e) => warn!(cause = %e, "status snapshot failed"),
            }
        }
    });

    scheduler
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await;

    let mut final_status = SystemStatus::collect(&engine.store, Vec::new())?;
    final_status.running = false;
    final_status.save(&config.system.status_file)?;
    info!("{}", SEP);
    Ok(())
}
