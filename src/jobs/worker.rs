// ABOUTME: Bounded worker pool draining the task queue into the export and import engines
// ABOUTME: Each task moves its job record through running to completed or failed

use super::job::JobRegistry;
use super::queue::{QueuedTask, TaskPayload, TaskQueue};
use crate::config::Config;
use crate::migration::dumps::{backup_file_name, dump_file_name, prune_backups};
use crate::migration::{export, import, ExportOptions, ImportProgress, TableFilter};
use crate::postgres::ConnectionManager;
use anyhow::{Context, Result};
use chrono::{Local, SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const READ_BUFFER_CAPACITY: usize = 256 * 1024;

/// Everything a task handler needs, shared across workers
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<Config>,
    pub connections: Arc<ConnectionManager>,
    pub registry: Arc<JobRegistry>,
}

impl WorkerContext {
    pub fn new(config: Config) -> Self {
        let connections =
            ConnectionManager::new(config.environments.clone(), config.pool.clone());
        Self {
            config: Arc::new(config),
            connections: Arc::new(connections),
            registry: Arc::new(JobRegistry::new()),
        }
    }

    /// Replace the registry, e.g. with one mirrored into the queue database
    pub fn with_registry(mut self, registry: JobRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }
}

/// Fixed number of workers, each running one task at a time
pub struct WorkerPool {
    queue: TaskQueue,
    context: WorkerContext,
    workers: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(queue: TaskQueue, context: WorkerContext) -> Self {
        let workers = context.config.workers.max(1);
        Self {
            queue,
            context,
            workers,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run until `cancel` fires; tasks already started are allowed to finish
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        self.queue
            .recover_abandoned()
            .await
            .context("Failed to recover task queue")?;

        tracing::info!("Starting {} worker(s)", self.workers);
        let mut set = JoinSet::new();
        for n in 0..self.workers {
            set.spawn(worker_loop(
                n,
                self.queue.clone(),
                self.context.clone(),
                cancel.clone(),
                self.poll_interval,
            ));
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Worker terminated abnormally: {}", e);
            }
        }
        self.context.connections.close();
        tracing::info!("✓ Workers stopped");
        Ok(())
    }
}

async fn worker_loop(
    n: usize,
    queue: TaskQueue,
    context: WorkerContext,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    tracing::debug!("Worker {} started", n);
    while !cancel.is_cancelled() {
        match queue.claim().await {
            Ok(Some(task)) => run_claimed(&queue, &context, task, &cancel).await,
            Ok(None) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = queue.wait_for_work(poll_interval) => {}
                }
            }
            Err(e) => {
                tracing::error!("Worker {} could not claim a task: {:#}", n, e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }
    tracing::debug!("Worker {} stopped", n);
}

async fn run_claimed(
    queue: &TaskQueue,
    context: &WorkerContext,
    task: QueuedTask,
    cancel: &CancellationToken,
) {
    let outcome = process_task(context, &task.payload, cancel).await;
    let recorded = match &outcome {
        Ok(()) => queue.complete(task.id).await,
        Err(e) => queue.fail(task.id, &format!("{:#}", e)).await,
    };
    if let Err(e) = recorded {
        tracing::error!("Failed to record outcome of task {}: {:#}", task.id, e);
    }
}

/// Execute one task, keeping its job record current
///
/// The job is created if this process has not seen it, marked running, and
/// finished exactly once. Errors are captured on the job and also returned.
pub async fn process_task(
    context: &WorkerContext,
    payload: &TaskPayload,
    cancel: &CancellationToken,
) -> Result<()> {
    let job_id = payload.job_id();
    context.registry.start(job_id, payload.database());
    tracing::info!("Job {} started: {} on '{}'", job_id, payload.kind(), payload.database());

    let result = match payload {
        TaskPayload::Export { database, .. } => {
            handle_export(context, job_id, database, cancel).await.map(|_| ())
        }
        TaskPayload::Import {
            source,
            target,
            dump_path,
            dump_size,
            ..
        } => handle_import(context, job_id, source, target, dump_path, *dump_size, cancel).await,
    };

    match &result {
        Ok(()) => {
            context.registry.complete(job_id);
            tracing::info!("✓ Job {} completed", job_id);
        }
        Err(e) => {
            let message = format!("{:#}", e);
            context.registry.fail(job_id, &message);
            tracing::error!("Job {} on '{}' failed: {}", job_id, payload.database(), message);
        }
    }
    result
}

async fn handle_export(
    context: &WorkerContext,
    job_id: &str,
    database: &str,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    let registry = Arc::clone(&context.registry);
    let name = dump_file_name(database, Local::now());
    export_to_file(context, database, &context.config.dump_dir, &name, cancel, |p| {
        registry.update(job_id, |job| {
            job.progress = p.percent();
            job.current_table = Some(p.table.clone());
            job.rows_processed = Some(p.rows);
        });
    })
    .await
}

/// Export `environment` to `dir/name`; a partial file is removed on failure
async fn export_to_file<F>(
    context: &WorkerContext,
    environment: &str,
    dir: &Path,
    name: &str,
    cancel: &CancellationToken,
    on_progress: F,
) -> Result<PathBuf>
where
    F: FnMut(&crate::migration::ExportProgress) + Send,
{
    let pool = context.connections.pool(environment, cancel).await?;

    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    let path = dir.join(name);
    let mut file = tokio::fs::File::create(&path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(
        format!(
            "-- Export started at {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        )
        .as_bytes(),
    )
    .await?;

    let options = ExportOptions::new(environment, TableFilter::from_policy(&context.config.tables));
    let result = export(&pool, &mut file, &options, cancel, on_progress).await;
    let result = match result {
        Ok(summary) => file.sync_all().await.map(|_| summary).map_err(Into::into),
        Err(e) => Err(e),
    };

    match result {
        Ok(summary) => {
            tracing::info!(
                "✓ Wrote {} ({} table(s), {} row(s))",
                path.display(),
                summary.tables,
                summary.rows
            );
            Ok(path)
        }
        Err(e) => {
            drop(file);
            if let Err(rm) = tokio::fs::remove_file(&path).await {
                tracing::warn!("Could not remove partial dump {}: {}", path.display(), rm);
            }
            Err(e)
        }
    }
}

async fn handle_import(
    context: &WorkerContext,
    job_id: &str,
    source: &str,
    target: &str,
    dump_path: &Path,
    dump_size: u64,
    cancel: &CancellationToken,
) -> Result<()> {
    let pool = context.connections.pool(target, cancel).await?;

    if context.config.import.backup_before_import {
        if let Err(e) = backup_target(context, source, target, cancel).await {
            tracing::warn!("Job {}: backup of '{}' failed, continuing: {:#}", job_id, target, e);
        }
    }

    let file = tokio::fs::File::open(dump_path)
        .await
        .with_context(|| format!("Failed to open dump {}", dump_path.display()))?;
    let reader = BufReader::with_capacity(READ_BUFFER_CAPACITY, file);
    tracing::info!(
        "Job {}: importing {} into '{}'",
        job_id,
        dump_path.display(),
        target
    );

    let registry = Arc::clone(&context.registry);
    import(&pool, reader, dump_size, |p| {
        record_import_progress(&registry, job_id, &p)
    })
    .await?;
    Ok(())
}

/// Imports are measured in bytes, so only the percentage reaches the job record
fn record_import_progress(registry: &JobRegistry, job_id: &str, progress: &ImportProgress) {
    registry.update(job_id, |job| {
        job.progress = job.progress.max(progress.percent);
    });
}

async fn backup_target(
    context: &WorkerContext,
    source: &str,
    target: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let dir = &context.config.backup_dir;
    let name = backup_file_name(source, Local::now());
    tracing::info!("Backing up '{}' before import", target);
    export_to_file(context, target, dir, &name, cancel, |_| {}).await?;

    prune_backups(dir, context.config.import.backup_retention).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environments;
    use crate::jobs::job::JobStatus;
    use tempfile::TempDir;

    fn context_in(dir: &Path, environments: Environments) -> WorkerContext {
        let config = Config {
            environments,
            dump_dir: dir.join("dumps"),
            backup_dir: dir.join("dumps/backups"),
            workers: 2,
            ..Config::default()
        };
        WorkerContext::new(config)
    }

    #[tokio::test]
    async fn test_unconfigured_export_fails_job() {
        let dir = TempDir::new().unwrap();
        let context = context_in(dir.path(), Environments::new());
        let job = context.registry.create("staging");
        let payload = TaskPayload::Export {
            database: "staging".into(),
            job_id: job.id.clone(),
        };

        let err = process_task(&context, &payload, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not configured"));

        let job = context.registry.get(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.completed_at.is_some());
        assert_eq!(job.error.as_deref(), Some("database not configured: staging"));
        assert!(!dir.path().join("dumps").exists());
    }

    #[test]
    fn test_import_progress_leaves_row_count_unset() {
        let registry = JobRegistry::new();
        let job = registry.create("localhost");
        registry.start(&job.id, "localhost");

        let at = |percent| ImportProgress {
            bytes_read: 4096,
            total_bytes: 8192,
            percent,
        };
        record_import_progress(&registry, &job.id, &at(50));
        record_import_progress(&registry, &job.id, &at(40));

        let job = registry.get(&job.id).unwrap();
        assert_eq!(job.progress, 50);
        assert_eq!(job.rows_processed, None);
        assert!(serde_json::to_value(&job).unwrap().get("rowsProcessed").is_none());
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let context = context_in(dir.path(), Environments::new());
        let queue = TaskQueue::open_in_memory().unwrap();

        let job = context.registry.create("dev");
        let task_id = queue
            .enqueue(&TaskPayload::Export {
                database: "dev".into(),
                job_id: job.id.clone(),
            })
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let pool = WorkerPool::new(queue.clone(), context.clone())
            .with_poll_interval(Duration::from_millis(20));
        let running = tokio::spawn(pool.run(cancel.clone()));

        let mut status = None;
        for _ in 0..200 {
            status = context.registry.get(&job.id).map(|j| j.status);
            if status == Some(JobStatus::Failed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, Some(JobStatus::Failed));

        cancel.cancel();
        running.await.unwrap().unwrap();
        assert_eq!(queue.status(task_id).await.unwrap().as_deref(), Some("failed"));
    }
}
