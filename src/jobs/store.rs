// ABOUTME: Persists registry snapshots into the queue database for other processes
// ABOUTME: A background task drains the registry's mirror channel in batches

use super::job::{Job, JobRegistry};
use super::queue::TaskQueue;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;

/// Upper bound on snapshots written in one transaction
const MAX_BATCH: usize = 256;

/// Build a registry whose changes are written to `queue`'s job table
///
/// The returned task finishes once the registry (and every clone of its
/// sender) is dropped and all pending snapshots are written.
pub fn mirrored_registry(queue: TaskQueue) -> (JobRegistry, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(write_snapshots(queue, rx));
    (JobRegistry::new().with_mirror(tx), handle)
}

async fn write_snapshots(queue: TaskQueue, mut rx: UnboundedReceiver<Job>) {
    let mut batch = Vec::with_capacity(MAX_BATCH);
    while rx.recv_many(&mut batch, MAX_BATCH).await > 0 {
        let snapshots = latest_per_job(std::mem::take(&mut batch));
        if let Err(e) = queue.save_jobs(snapshots).await {
            tracing::error!("Failed to persist job snapshots: {:#}", e);
        }
    }
    tracing::debug!("Job mirror stopped");
}

/// Keep only the newest snapshot of each job, in first-seen order
fn latest_per_job(batch: Vec<Job>) -> Vec<Job> {
    let mut latest: Vec<Job> = Vec::with_capacity(batch.len());
    for job in batch {
        match latest.iter_mut().find(|seen| seen.id == job.id) {
            Some(seen) => *seen = job,
            None => latest.push(job),
        }
    }
    latest
}
