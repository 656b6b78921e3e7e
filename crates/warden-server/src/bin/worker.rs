//! Warden worker binary

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use warden_server::config::{validate_config, ConfigLoader, WorkerConfig, CONFIG_PATH_VAR};
use warden_server::shutdown::block_termination_signals;
use warden_server::{HttpServeLoop, RequestBudget, SessionPool, ShutdownCoordinator};

/// Idle time after which outbound sessions are reaped.
const SESSION_MAX_IDLE: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "warden-worker", version, about = "Run one supervised worker process")]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = CONFIG_PATH_VAR)]
    config: Option<PathBuf>,

    /// Listening port, overriding every other source
    #[arg(short, long)]
    port: Option<u16>,

    /// Print the resolved configuration and worker plan, then exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    if let Some(port) = cli.port {
        loader = loader.with_port(port);
    }
    let config = loader.load()?;

    if let Err(errors) = validate_config(&config) {
        for error in &errors {
            eprintln!("config error: {error}");
        }
        anyhow::bail!("invalid configuration ({} error(s))", errors.len());
    }

    if cli.print_config {
        print_config(&config)?;
        return Ok(());
    }

    warden_common_log::init(config.logging.to_log_config())?;

    // Runtime threads inherit this mask; only the block_on thread unblocks.
    block_termination_signals().context("Failed to block termination signals")?;
    let runtime = warden_common_async::build_runtime(&config.runtime)
        .context("Failed to build runtime")?;
    let ceiling = config.shutdown.ceiling();

    let result = runtime.block_on(run_worker(config));
    runtime.shutdown_timeout(ceiling);
    result
}

async fn run_worker(config: WorkerConfig) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "Starting Warden worker"
    );

    let sessions = SessionPool::new();
    let coordinator = ShutdownCoordinator::builder(config.shutdown.clone())
        .app(Arc::new(sessions.clone()))
        .build();

    coordinator
        .registry()
        .spawn("session-reaper", {
            let sessions = sessions.clone();
            move |token| sessions.run_reaper(SESSION_MAX_IDLE, token)
        })?;

    let budget = RequestBudget::from_config(&config.workers);
    if let Some(budget) = &budget {
        info!(threshold = budget.threshold(), "Worker recycling enabled");
    }

    let serve_loop = HttpServeLoop::new(&config.server, coordinator.clone())
        .context("Invalid bind address")?
        .with_budget(budget);

    let report = coordinator.run(&serve_loop).await?;
    if report.deadline_exceeded {
        warn!("Worker exited at the shutdown deadline");
    }

    info!("Worker shutdown complete");
    Ok(())
}

fn print_config(config: &WorkerConfig) -> Result<()> {
    let rendered = serde_json::to_string_pretty(config)?;
    println!("{rendered}");
    println!(
        "worker plan: {} worker(s) on {}:{}",
        config.workers.worker_count(),
        config.server.host,
        config.server.port
    );
    Ok(())
}
