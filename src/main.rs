// ABOUTME: CLI entry point for postgres-env-sync
// ABOUTME: Parses commands and routes to appropriate handlers

use anyhow::Context;
use clap::{Parser, Subcommand};
use postgres_env_sync::commands;
use postgres_env_sync::config::Config;
use postgres_env_sync::jobs::{JobStatus, TaskQueue, WorkerContext};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "postgres-env-sync")]
#[command(about = "Stream PostgreSQL data between environments as SQL dumps", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a TOML file overriding environment-variable configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured database environments
    Databases,
    /// Check that an environment is reachable
    TestConnection {
        #[arg(long)]
        database: String,
    },
    /// Export an environment to a SQL dump
    Export {
        #[arg(long)]
        database: String,
        /// Run in this process instead of queueing for a worker
        #[arg(long)]
        local: bool,
    },
    /// Import the newest dump of a source environment into the safe target
    Import {
        #[arg(long)]
        source: String,
        #[arg(long, default_value = "localhost")]
        target: String,
        /// Run in this process instead of queueing for a worker
        #[arg(long)]
        local: bool,
    },
    /// Show one job recorded in the queue database
    Job {
        #[arg(long)]
        id: String,
    },
    /// List every job recorded in the queue database
    Jobs,
    /// Run the worker pool until interrupted
    Worker,
    /// Check that the task queue is reachable
    Ready,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging - default to INFO level if RUST_LOG not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, stopping...");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Databases => {
            let context = WorkerContext::new(config);
            let databases = commands::list_databases(&context.connections);
            println!("{}", serde_json::json!({ "databases": databases }));
            Ok(())
        }
        Commands::TestConnection { database } => {
            let context = WorkerContext::new(config);
            let probe = commands::test_connection(&context.connections, &database, &cancel).await;
            context.connections.close();
            println!("{}", serde_json::to_string_pretty(&probe)?);
            if probe.connected {
                Ok(())
            } else {
                anyhow::bail!("connection test failed for '{}'", database)
            }
        }
        Commands::Export { database, local } => {
            let context = WorkerContext::new(config);
            if local {
                let payload = commands::prepare_export(&context.registry, &database)?;
                finish_local(&context, payload, &cancel).await
            } else {
                let queue = TaskQueue::open(&context.config.queue_path)?;
                let job_id = commands::start_export(&context.registry, &queue, &database).await?;
                print_queued(&job_id);
                Ok(())
            }
        }
        Commands::Import {
            source,
            target,
            local,
        } => {
            let context = WorkerContext::new(config);
            if local {
                let payload =
                    commands::prepare_import(&context.config, &context.registry, &source, &target)
                        .await?;
                finish_local(&context, payload, &cancel).await
            } else {
                let queue = TaskQueue::open(&context.config.queue_path)?;
                let job_id = commands::start_import(
                    &context.config,
                    &context.registry,
                    &queue,
                    &source,
                    &target,
                )
                .await?;
                print_queued(&job_id);
                Ok(())
            }
        }
        Commands::Job { id } => {
            let queue = TaskQueue::open(&config.queue_path)?;
            let job = commands::get_job(&queue, &id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        Commands::Jobs => {
            let queue = TaskQueue::open(&config.queue_path)?;
            let jobs = commands::list_jobs(&queue).await?;
            println!("{}", serde_json::json!({ "jobs": jobs }));
            Ok(())
        }
        Commands::Worker => commands::run_worker(config, cancel).await,
        Commands::Ready => {
            let readiness = commands::ready(&config).await;
            println!("{}", serde_json::to_string_pretty(&readiness)?);
            if readiness.ready {
                Ok(())
            } else {
                anyhow::bail!("task queue is not ready")
            }
        }
    }
}

fn print_queued(job_id: &str) {
    tracing::info!("✓ Job {} queued", job_id);
    println!("{}", serde_json::json!({ "jobId": job_id, "status": "queued" }));
}

async fn finish_local(
    context: &WorkerContext,
    payload: postgres_env_sync::jobs::TaskPayload,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let outcome = commands::run_local(context, payload, cancel).await;
    context.connections.close();
    let job = outcome?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    if job.status != JobStatus::Completed {
        anyhow::bail!("job {} ended as {}", job.id, job.status);
    }
    Ok(())
}
