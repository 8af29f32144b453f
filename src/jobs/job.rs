// ABOUTME: Job records and the shared in-memory registry that tracks them
// ABOUTME: One reader/writer lock guards the whole registry; terminal jobs are immutable

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Observable state of one export or import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub database: String,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_processed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    fn pending(id: String, database: String) -> Self {
        Self {
            id,
            database,
            status: JobStatus::Pending,
            progress: 0,
            current_table: None,
            rows_processed: None,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

#[derive(Debug, Default)]
struct Jobs {
    by_id: HashMap<String, Job>,
    order: Vec<String>,
}

impl Jobs {
    fn insert(&mut self, job: Job) {
        if self.by_id.insert(job.id.clone(), job.clone()).is_none() {
            self.order.push(job.id);
        }
    }
}

/// Registry of every job known to this process
///
/// Shared by reference between the worker pool and status queries. Lock
/// sections only copy or mutate records and queue snapshots; no I/O happens
/// under the lock.
///
/// With a mirror attached, every change is also sent as a snapshot so it can
/// be persisted for other processes.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<Jobs>,
    mirror: Option<UnboundedSender<Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mirror(mut self, mirror: UnboundedSender<Job>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    fn publish(&self, job: &Job) {
        if let Some(mirror) = &self.mirror {
            if mirror.send(job.clone()).is_err() {
                tracing::debug!("Job mirror closed; snapshot of {} dropped", job.id);
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Jobs> {
        self.jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Jobs> {
        self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a pending job with a fresh identifier
    pub fn create(&self, database: &str) -> Job {
        let job = Job::pending(Uuid::new_v4().to_string(), database.to_string());
        let mut jobs = self.write();
        jobs.insert(job.clone());
        self.publish(&job);
        job
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.read().by_id.get(id).cloned()
    }

    /// Snapshot of every job in creation order
    pub fn list(&self) -> Vec<Job> {
        let jobs = self.read();
        jobs.order
            .iter()
            .filter_map(|id| jobs.by_id.get(id).cloned())
            .collect()
    }

    /// Mark a job running, creating the record if this process has not seen it
    pub fn start(&self, id: &str, database: &str) {
        let mut jobs = self.write();
        if !jobs.by_id.contains_key(id) {
            jobs.insert(Job::pending(id.to_string(), database.to_string()));
        }
        if let Some(job) = jobs.by_id.get_mut(id) {
            if job.status.is_terminal() {
                return;
            }
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            self.publish(job);
        }
    }

    /// Apply a partial update to a non-terminal job
    ///
    /// Returns false when the job is unknown or already finished.
    pub fn update<F>(&self, id: &str, apply: F) -> bool
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.write();
        match jobs.by_id.get_mut(id) {
            Some(job) if !job.status.is_terminal() => {
                apply(job);
                // Sent under the lock so snapshots of one job stay ordered
                self.publish(job);
                true
            }
            _ => false,
        }
    }

    pub fn complete(&self, id: &str) -> bool {
        self.update(id, |job| {
            job.status = JobStatus::Completed;
            job.progress = 100;
            job.completed_at = Some(Utc::now());
        })
    }

    pub fn fail(&self, id: &str, error: &str) -> bool {
        self.update(id, |job| {
            job.status = JobStatus::Failed;
            job.error = Some(error.to_string());
            job.completed_at = Some(Utc::now());
        })
    }
}
