//! The Kiln queue runner daemon.

use anyhow::Context;
use clap::Parser;
use kiln_core::{BuildId, BuildStatus};
use kiln_scheduler::{RunnerConfig, Scheduler};
use kiln_store::{Connector, InProcessConnector, MemoryStore, Store};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod lock;

#[derive(Parser)]
#[command(name = "kiln-queue-runner")]
#[command(about = "Drains the build queue and dispatches steps to build machines", long_about = None)]
struct Cli {
    /// Process only the given build id and exit when it finishes (testing aid).
    #[arg(long, value_name = "ID")]
    build_one: Option<i32>,

    /// Ask the running instance to dump its status and print it.
    #[arg(long)]
    status: bool,

    /// Release the global queue-runner lock and exit.
    #[arg(long)]
    unlock: bool,
}

const EXIT_LOCK_CONTENTION: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = RunnerConfig::from_env();

    let result = if cli.unlock {
        run_unlock(&config)
    } else if cli.status {
        show_status(&config).await
    } else {
        run(config, cli.build_one.map(BuildId::new)).await
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run_unlock(config: &RunnerConfig) -> anyhow::Result<ExitCode> {
    if lock::unlock(&config.lock_file)? {
        info!(path = %config.lock_file.display(), "released global lock");
    } else {
        info!("no lock to release");
    }
    Ok(ExitCode::SUCCESS)
}

/// Trigger a status dump in the running instance via the `dump_status`
/// notification, then read it back from the `system_status` table.
async fn show_status(config: &RunnerConfig) -> anyhow::Result<ExitCode> {
    let pool = kiln_db::create_pool(&config.database_url)
        .await
        .context("connecting to database")?;
    let mut conn = pool.acquire().await?;
    kiln_db::queries::notify(&mut *conn, "dump_status", "").await?;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        if let Some(status) = kiln_db::queries::get_status(&mut *conn).await? {
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(ExitCode::SUCCESS);
        }
    }
    anyhow::bail!("no status dump appeared; is a queue runner running?")
}

async fn run(config: RunnerConfig, build_one: Option<BuildId>) -> anyhow::Result<ExitCode> {
    let lock_guard = match lock::GlobalLock::acquire(&config.lock_file) {
        Ok(guard) => guard,
        Err(lock::LockError::Held) => {
            error!(path = %config.lock_file.display(), "another queue runner holds the lock");
            return Ok(ExitCode::from(EXIT_LOCK_CONTENTION));
        }
        Err(lock::LockError::Io(e)) => return Err(e.into()),
    };

    info!("connecting to database");
    let pool = kiln_db::create_pool(&config.database_url)
        .await
        .context("connecting to database")?;

    let local_store = open_store(&config.local_store_uri)?;
    let dest_store = open_store(&config.dest_store_uri)?;
    let connector = make_connector(&config).await?;

    let scheduler = Scheduler::new(config, pool, local_store, dest_store, connector, build_one);
    kiln_scheduler::clear_busy_on_start(&scheduler).await?;

    tokio::spawn(kiln_scheduler::machine_reloader(scheduler.clone()));
    tokio::spawn(kiln_scheduler::queue_monitor(scheduler.clone()));
    tokio::spawn(kiln_scheduler::dispatcher(scheduler.clone()));
    info!("queue runner up");

    if build_one.is_some() {
        let status = loop {
            if let Some(status) = scheduler.build_one_status() {
                break status;
            }
            scheduler
                .build_one_done
                .wait_timeout(Duration::from_secs(3600))
                .await;
        };
        info!(status = ?status, "requested build finished");
        drop(lock_guard);
        return Ok(if status == BuildStatus::Success {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = kiln_scheduler::status::dump_status(&scheduler).await;
    drop(lock_guard);
    Ok(ExitCode::SUCCESS)
}

/// Select a store backend from its URI. Real deployments plug their store
/// implementation in here; the in-memory backend covers tests and
/// `--build-one` smoke runs.
fn open_store(uri: &str) -> anyhow::Result<Arc<dyn Store>> {
    match uri.strip_prefix("memory://") {
        Some(name) => Ok(Arc::new(MemoryStore::new(name))),
        None => anyhow::bail!("unsupported store URI '{uri}' (supported: memory://<name>)"),
    }
}

/// Build the machine connector. `mem://` machines from the machine list are
/// served in-process; anything else needs a transport implementation
/// plugged in at this seam.
async fn make_connector(config: &RunnerConfig) -> anyhow::Result<Arc<dyn Connector>> {
    let connector = InProcessConnector::new();
    if let Some(path) = &config.machines_file {
        if let Ok(contents) = tokio::fs::read_to_string(path).await {
            for machine in kiln_scheduler::machine::parse_machines(&contents) {
                if machine.store_uri.starts_with("mem://") {
                    connector.add_machine(machine.store_uri.clone());
                }
            }
        }
    }
    Ok(Arc::new(connector))
}
