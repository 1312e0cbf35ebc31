mod config;
mod layout;
mod repair;
mod snapshot;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quota_core::{registry, EntityRef, SqliteQuotaStore};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use config::QuotaTrackerConfig;
use repair::RepairJob;

/// Administrative tooling for hierarchical quotas.
#[derive(Parser, Debug)]
#[command(name = "quota-tracker")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Inventory snapshot to derive quotas from (overrides QUOTA_SNAPSHOT_PATH)
    #[arg(short = 's', long = "snapshot", value_name = "FILE", global = true)]
    snapshot: Option<PathBuf>,

    /// Directory holding the quota database (overrides QUOTA_DATA_DIR)
    #[arg(short = 'd', long = "data-dir", value_name = "DIR", global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Recompute every quota once and print the report.
    Recalculate,

    /// Repair quota drift periodically until interrupted.
    Watch {
        /// Seconds between runs (overrides RECALCULATION_INTERVAL_SECS)
        #[arg(short, long, value_name = "SECS")]
        interval: Option<u64>,
    },

    /// Print the quotas of one scope as JSON.
    Show {
        /// Scope type, e.g. customer
        entity_type: String,
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = QuotaTrackerConfig::from_env()?;
    if let Some(snapshot) = cli.snapshot {
        config.snapshot_path = snapshot;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Commands::Watch {
        interval: Some(secs),
    } = cli.command
    {
        config.recalculation_interval_secs = secs;
    }
    config.validate()?;

    init_tracing(&config.log_level)?;

    registry::init(layout::registry()?);
    let store = Arc::new(
        SqliteQuotaStore::new(&config.data_dir).context("unable to open quota database")?,
    );
    let job = RepairJob::new(config.snapshot_path.clone(), store);

    match cli.command {
        Commands::Recalculate => {
            let report = job.run_once()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Watch { .. } => {
            info!(
                data_dir = %config.data_dir.display(),
                snapshot = %config.snapshot_path.display(),
                interval_secs = config.recalculation_interval_secs,
                "starting quota repair loop"
            );
            let task = job.start_repair_task(config.recalculation_interval());
            shutdown_signal().await;
            task.abort();
            info!("quota repair loop shutting down");
        }
        Commands::Show { entity_type, id } => {
            let engine = job.engine()?;
            if !engine.registry().is_scope_type(&entity_type) {
                anyhow::bail!("{entity_type} has no registered quotas");
            }
            let quotas = engine.quotas(&EntityRef::new(entity_type, id))?;
            println!("{}", serde_json::to_string_pretty(&quotas)?);
        }
    }

    Ok(())
}

fn init_tracing(default_level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err))?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
