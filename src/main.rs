// =============================================================================
// Desk Governor — operator CLI
// =============================================================================
//
//   readiness [--watch SECS]   evaluate (and persist) the readiness state
//   verify-ledger              walk the decision ledger hash chain
//   halt status|set|clear      inspect or change the risk halt flag
//   migrate                    bring the SQLite projection schema up to date
//
// Exit codes: 0 success / tradeable, 2 BLOCKED, 1 anything else.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use desk_governor::halt::HaltFlag;
use desk_governor::ledger::{verify_log, Projection};
use desk_governor::readiness::probes::FileProbes;
use desk_governor::readiness::{ReadinessMachine, ReadinessResult};
use desk_governor::runtime_config::DeskConfig;

#[derive(Debug, Parser)]
#[command(name = "desk-governor", version, about = "Risk, ledger and readiness governance for one trading desk")]
struct Cli {
    /// Desk configuration file (JSON).
    #[arg(long, global = true, env = "DESK_CONFIG", default_value = "desk_config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Evaluate readiness and print the result as JSON.
    Readiness {
        /// Re-evaluate every SECS seconds until interrupted.
        #[arg(long, value_name = "SECS")]
        watch: Option<u64>,
    },
    /// Verify the decision ledger hash chain.
    VerifyLedger,
    /// Inspect or change the risk halt flag.
    Halt {
        #[command(subcommand)]
        action: HaltAction,
    },
    /// Create or extend the projection schema.
    Migrate,
}

#[derive(Debug, Subcommand)]
enum HaltAction {
    Status,
    Set {
        #[arg(long)]
        reason: String,
    },
    Clear {
        #[arg(long, default_value = "operator")]
        by: String,
    },
}

fn load_config(path: &Path) -> Result<Arc<DeskConfig>> {
    let config = DeskConfig::load_or_default(path)
        .with_context(|| format!("refusing to start with an unusable config at {}", path.display()))?;
    Ok(Arc::new(config))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("failed to render output")?);
    Ok(())
}

fn print_readiness(result: &ReadinessResult) -> Result<()> {
    print_json(result)?;
    for b in &result.blockers {
        eprintln!("BLOCKER  {b}");
    }
    for w in &result.warnings {
        eprintln!("WARNING  {w}");
    }
    Ok(())
}

async fn run_readiness(config: Arc<DeskConfig>, watch: Option<u64>) -> Result<i32> {
    let probes = FileProbes::from_config(&config);
    let machine = ReadinessMachine::new(config, Box::new(probes));

    let Some(secs) = watch.filter(|s| *s > 0) else {
        let result = machine.evaluate_and_persist(Some(Utc::now()))?;
        print_readiness(&result)?;
        return Ok(result.exit_code());
    };

    info!(interval_secs = secs, "readiness watch started");
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(secs));
    let mut last_code = 1;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let result = machine.tick(Some(Utc::now()));
                info!(
                    state = %result.state,
                    can_trade = result.can_trade,
                    blockers = ?result.blockers,
                    warnings = ?result.warnings,
                    "readiness"
                );
                last_code = result.exit_code();
            }
            _ = tokio::signal::ctrl_c() => {
                info!("readiness watch stopped");
                return Ok(last_code);
            }
        }
    }
}

fn run_verify(config: &DeskConfig) -> Result<i32> {
    let report = verify_log(&config.paths.ledger);
    print_json(&json!({
        "ok": report.ok,
        "status": report.status.code(),
        "last_hash": report.last_hash,
        "count": report.count,
        "line": report.line,
    }))?;
    if !report.ok {
        eprintln!("{}", report.summary());
    }
    Ok(if report.ok { 0 } else { 1 })
}

fn run_halt(config: &DeskConfig, action: HaltAction) -> Result<i32> {
    let flag = HaltFlag::new(config.paths.halt_file.clone());
    let record = match action {
        HaltAction::Status => flag.read(),
        HaltAction::Set { reason } => flag.set(&reason, json!({ "source": "cli" }))?,
        HaltAction::Clear { by } => {
            flag.clear(&by)?;
            flag.read()
        }
    };
    print_json(&record)?;
    Ok(0)
}

fn run_migrate(config: &DeskConfig) -> Result<i32> {
    let projection = Projection::open(config.paths.projection_db.clone(), &config.ledger)
        .with_context(|| format!("failed to open projection {}", config.paths.projection_db.display()))?;
    let added = projection.migrate().context("projection migration failed")?;
    let missing = projection
        .missing_columns(&config.readiness.required_columns)
        .context("failed to inspect projection schema")?;
    print_json(&json!({ "added_columns": added, "missing_columns": missing }))?;
    Ok(if missing.is_empty() { 0 } else { 1 })
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let code = match cli.command {
        Command::Readiness { watch } => run_readiness(config, watch).await?,
        Command::VerifyLedger => run_verify(&config)?,
        Command::Halt { action } => run_halt(&config, action)?,
        Command::Migrate => run_migrate(&config)?,
    };

    std::process::exit(code);
}
