// ABOUTME: Worker process, readiness probe, and in-process task execution commands
// ABOUTME: Local runs render the job record as a terminal progress bar

use crate::config::Config;
use crate::jobs::{
    mirrored_registry, process_task, Job, TaskPayload, TaskQueue, WorkerContext, WorkerPool,
};
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run the worker pool against the durable queue until `cancel` fires
///
/// Job records are mirrored into the queue database so `job` and `jobs`
/// queries from other processes see live progress.
pub async fn run_worker(config: Config, cancel: CancellationToken) -> Result<()> {
    let queue = TaskQueue::open(&config.queue_path)?;
    tracing::info!("Task queue: {}", config.queue_path.display());
    let (registry, mirror) = mirrored_registry(queue.clone());
    let context = WorkerContext::new(config).with_registry(registry);

    let result = WorkerPool::new(queue, context).run(cancel).await;
    if let Err(e) = mirror.await {
        tracing::error!("Job mirror terminated abnormally: {}", e);
    }
    result
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Report whether the durable queue can be reached
pub async fn ready(config: &Config) -> Readiness {
    let probe = async {
        let queue = TaskQueue::open(&config.queue_path)?;
        queue.ping().await
    };
    match probe.await {
        Ok(()) => Readiness {
            ready: true,
            error: None,
        },
        Err(e) => Readiness {
            ready: false,
            error: Some(format!("{:#}", e)),
        },
    }
}

/// Execute a task in this process, showing progress, and return the final job record
pub async fn run_local(
    context: &WorkerContext,
    payload: TaskPayload,
    cancel: &CancellationToken,
) -> Result<Job> {
    let job_id = payload.job_id().to_string();
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}% {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("##-"),
    );

    let task = process_task(context, &payload, cancel);
    tokio::pin!(task);
    let mut ticker = tokio::time::interval(Duration::from_millis(200));

    let outcome = loop {
        tokio::select! {
            outcome = &mut task => break outcome,
            _ = ticker.tick() => {
                if let Some(job) = context.registry.get(&job_id) {
                    render(&bar, &job);
                }
            }
        }
    };

    let job = context
        .registry
        .get(&job_id)
        .with_context(|| format!("Job {} disappeared from the registry", job_id))?;
    render(&bar, &job);
    match outcome {
        Ok(()) => {
            bar.finish_with_message("done");
            Ok(job)
        }
        Err(e) => {
            bar.abandon_with_message("failed");
            Err(e)
        }
    }
}

fn render(bar: &ProgressBar, job: &Job) {
    bar.set_position(u64::from(job.progress));
    let message = match (&job.current_table, job.rows_processed) {
        (Some(table), Some(rows)) => format!("{} ({} rows)", table, rows),
        (Some(table), None) => table.clone(),
        (None, Some(rows)) => format!("{} rows", rows),
        (None, None) => job.status.to_string(),
    };
    bar.set_message(message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_ready_with_writable_queue_path() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            queue_path: dir.path().join("nested/queue.sqlite3"),
            ..Config::default()
        };
        let readiness = ready(&config).await;
        assert!(readiness.ready, "{:?}", readiness.error);
    }

    #[tokio::test]
    async fn test_worker_records_job_outcome_for_other_processes() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            queue_path: dir.path().join("queue.sqlite3"),
            dump_dir: dir.path().join("dumps"),
            workers: 1,
            ..Config::default()
        };

        // Queued by a separate short-lived process; "staging" is not configured
        let job_id = {
            let queue = TaskQueue::open(&config.queue_path).unwrap();
            crate::commands::start_export(&crate::jobs::JobRegistry::new(), &queue, "staging")
                .await
                .unwrap()
        };

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(config.clone(), cancel.clone()));

        let observer = TaskQueue::open(&config.queue_path).unwrap();
        let mut status = None;
        for _ in 0..300 {
            status = crate::commands::get_job(&observer, &job_id)
                .await
                .ok()
                .map(|job| job.status);
            if status == Some(crate::jobs::JobStatus::Failed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, Some(crate::jobs::JobStatus::Failed));

        cancel.cancel();
        worker.await.unwrap().unwrap();
        let job = crate::commands::get_job(&observer, &job_id).await.unwrap();
        assert_eq!(job.error.as_deref(), Some("database not configured: staging"));
    }

    #[tokio::test]
    async fn test_not_ready_when_queue_path_is_a_directory() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            queue_path: dir.path().to_path_buf(),
            ..Config::default()
        };
        let readiness = ready(&config).await;
        assert!(!readiness.ready);
        assert!(readiness.error.is_some());
    }
}
