use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vmsync_core::{SyncStatus, SyncTrigger};
use vmsync_storage::{PgStore, SyncLogStore};
use vmsync_sync::config::parse_status_filter;
use vmsync_sync::{build_remote_client, SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "vmsync")]
#[command(about = "Vegetation management sync & aggregation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle.
    Sync {
        /// Record the run as manually triggered.
        #[arg(long)]
        manual: bool,
        /// Comma-separated remote status codes, e.g. ACTIV,QC.
        #[arg(long)]
        status: Option<String>,
    },
    /// Apply database migrations.
    Migrate,
    /// Delete aggregates older than the retention window.
    Prune {
        #[arg(long)]
        days: Option<i64>,
    },
    /// Check that the remote system answers.
    Health,
    /// Capture a manual planned-units snapshot for one circuit.
    Snapshot {
        #[arg(long)]
        job_guid: String,
    },
    /// Show the most recent sync runs.
    Logs {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Run the cron scheduler until interrupted.
    Schedule,
}

fn init_tracing() {
    let json = std::env::var("VMSYNC_LOG_JSON").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,vmsync=debug".into()))
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        manual: false,
        status: None,
    }) {
        Commands::Sync { manual, status } => {
            let trigger = if manual {
                SyncTrigger::Manual
            } else {
                SyncTrigger::Scheduled
            };
            let pipeline = SyncPipeline::from_config(config).await?;
            let log = pipeline
                .run(trigger, status.as_deref().map(parse_status_filter))
                .await?;
            println!("{}", serde_json::to_string_pretty(&log)?);
            if log.status == SyncStatus::Failed {
                bail!(
                    "sync run {} failed: {}",
                    log.id,
                    log.error_message.unwrap_or_default()
                );
            }
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Prune { days } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let counts = pipeline.prune(days).await?;
            println!(
                "pruned circuit={} planner={} regional={} total={}",
                counts.circuit_aggregates,
                counts.planner_aggregates,
                counts.regional_aggregates,
                counts.total()
            );
        }
        Commands::Health => {
            let client = build_remote_client(&config)?;
            if !client.health_check().await {
                bail!("remote system at {} is unhealthy", client.base_url());
            }
            println!("remote system at {} is healthy", client.base_url());
        }
        Commands::Snapshot { job_guid } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let snapshot = pipeline.snapshot_circuit(&job_guid).await?;
            println!(
                "snapshot {} created for {} ({} units, hash {})",
                snapshot.id, job_guid, snapshot.unit_count, snapshot.content_hash
            );
        }
        Commands::Logs { limit } => {
            let store = PgStore::connect(&config.database_url).await?;
            for log in store.recent_sync_logs(limit).await? {
                println!(
                    "{} {} {} started={} duration_ms={} circuits={} error={}",
                    log.id,
                    log.trigger.as_str(),
                    log.status.as_str(),
                    log.started_at,
                    log.duration_ms.unwrap_or_default(),
                    log.counters.circuits_processed,
                    log.error_message.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
