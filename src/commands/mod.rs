// ABOUTME: Collaborator-facing operations: start jobs, query jobs, probe environments
// ABOUTME: Each command is a thin adapter over the engines, registry, and queue

pub mod databases;
pub mod export;
pub mod import;
pub mod jobs;
pub mod worker;

pub use databases::{list_databases, test_connection, ConnectionProbe};
pub use export::{prepare_export, start_export};
pub use import::{prepare_import, start_import};
pub use jobs::{get_job, list_jobs};
pub use worker::{ready, run_local, run_worker, Readiness};

use crate::jobs::{JobRegistry, TaskPayload, TaskQueue};
use anyhow::Result;

/// Record the pending job and enqueue its task
///
/// The job is persisted first so a worker never starts a task whose record
/// other processes cannot see. A job whose task never reached the queue is
/// failed.
async fn enqueue(registry: &JobRegistry, queue: &TaskQueue, payload: TaskPayload) -> Result<String> {
    let job_id = payload.job_id().to_string();
    if let Some(job) = registry.get(&job_id) {
        queue.save_job(&job).await?;
    }
    if let Err(e) = queue.enqueue(&payload).await {
        registry.fail(&job_id, &format!("{:#}", e));
        if let Some(job) = registry.get(&job_id) {
            if let Err(save) = queue.save_job(&job).await {
                tracing::warn!("Could not record failure of job {}: {:#}", job_id, save);
            }
        }
        return Err(e);
    }
    Ok(job_id)
}
