// ABOUTME: Job status queries against the records persisted in the queue database
// ABOUTME: Any process can read what the worker process has recorded

use crate::error::SyncError;
use crate::jobs::{Job, TaskQueue};
use anyhow::Result;

pub async fn get_job(queue: &TaskQueue, id: &str) -> Result<Job> {
    queue
        .load_job(id)
        .await?
        .ok_or_else(|| SyncError::JobNotFound(id.to_string()).into())
}

pub async fn list_jobs(queue: &TaskQueue) -> Result<Vec<Job>> {
    queue.list_jobs().await
}
