// ABOUTME: Start-export command: registers a pending job and builds its task
// ABOUTME: The task is either enqueued for workers or run in-process by the caller

use crate::jobs::{JobRegistry, TaskPayload, TaskQueue};
use anyhow::{bail, Result};

/// Register a pending export job and return the task that performs it
pub fn prepare_export(registry: &JobRegistry, database: &str) -> Result<TaskPayload> {
    let database = database.trim();
    if database.is_empty() {
        bail!("database name is required");
    }
    let job = registry.create(database);
    Ok(TaskPayload::Export {
        database: database.to_string(),
        job_id: job.id,
    })
}

/// Queue an export of `database`, returning the job id
pub async fn start_export(
    registry: &JobRegistry,
    queue: &TaskQueue,
    database: &str,
) -> Result<String> {
    let payload = prepare_export(registry, database)?;
    super::enqueue(registry, queue, payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStatus;

    #[tokio::test]
    async fn test_start_export_queues_task_for_pending_job() {
        let registry = JobRegistry::new();
        let queue = TaskQueue::open_in_memory().unwrap();

        let job_id = start_export(&registry, &queue, " staging ").await.unwrap();

        let job = registry.get(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.database, "staging");

        let task = queue.claim().await.unwrap().unwrap();
        assert_eq!(
            task.payload,
            TaskPayload::Export {
                database: "staging".into(),
                job_id
            }
        );
    }

    #[test]
    fn test_empty_database_rejected() {
        let registry = JobRegistry::new();
        assert!(prepare_export(&registry, "  ").is_err());
        assert!(registry.list().is_empty());
    }
}
