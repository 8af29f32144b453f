// ABOUTME: Durable task queue stored in SQLite, shared by enqueuers and worker processes
// ABOUTME: Tasks are claimed atomically and delivered at most once; job snapshots live alongside

use super::job::Job;
use anyhow::{anyhow, Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sync_tasks (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    kind        TEXT NOT NULL,
    payload     TEXT NOT NULL,
    status      TEXT NOT NULL DEFAULT 'pending',
    error       TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS sync_tasks_status_idx ON sync_tasks (status, id);
CREATE TABLE IF NOT EXISTS sync_jobs (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,
    status      TEXT NOT NULL,
    body        TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
";

/// Insert or refresh a job snapshot; finished jobs are never overwritten
const UPSERT_JOB: &str = "
INSERT INTO sync_jobs (id, status, body, updated_at) VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(id) DO UPDATE SET status = excluded.status, body = excluded.body, updated_at = excluded.updated_at
WHERE sync_jobs.status NOT IN ('completed', 'failed')
";

/// Message that triggers one export or import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    Export {
        database: String,
        job_id: String,
    },
    Import {
        source: String,
        target: String,
        dump_path: PathBuf,
        job_id: String,
        dump_size: u64,
    },
}

impl TaskPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskPayload::Export { .. } => "database:export",
            TaskPayload::Import { .. } => "database:import",
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            TaskPayload::Export { job_id, .. } | TaskPayload::Import { job_id, .. } => job_id,
        }
    }

    /// Environment the job record is filed under
    pub fn database(&self) -> &str {
        match self {
            TaskPayload::Export { database, .. } => database,
            TaskPayload::Import { target, .. } => target,
        }
    }
}

/// A claimed task; the claimer must call `complete` or `fail`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub id: i64,
    pub payload: TaskPayload,
}

/// SQLite-backed queue
///
/// States: `pending` → `running` on claim, then deleted on success or kept
/// as `failed`. A task still `running` when a queue is recovered belonged to
/// a process that died mid-task; it is marked `abandoned` and never retried,
/// since re-running an import would replay destructive statements.
#[derive(Clone)]
pub struct TaskQueue {
    conn: Arc<Mutex<Connection>>,
    notify: Arc<Notify>,
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl TaskQueue {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create queue directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open task queue at {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to create task queue schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            notify: Arc::new(Notify::new()),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| anyhow!("task queue lock poisoned"))?;
            f(&conn)
        })
        .await
        .context("Task queue operation panicked")?
    }

    pub async fn enqueue(&self, payload: &TaskPayload) -> Result<i64> {
        let kind = payload.kind();
        let body = serde_json::to_string(payload).context("Failed to encode task payload")?;
        let id = self
            .with_conn(move |conn| {
                let ts = now();
                conn.execute(
                    "INSERT INTO sync_tasks (kind, payload, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                    params![kind, body, ts],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .context("Failed to enqueue task")?;

        tracing::info!("Enqueued task {} ({}) for job {}", id, kind, payload.job_id());
        self.notify.notify_one();
        Ok(id)
    }

    /// Claim the oldest pending task, if any
    pub async fn claim(&self) -> Result<Option<QueuedTask>> {
        let claimed: Option<(i64, String)> = self
            .with_conn(|conn| {
                let row = conn
                    .query_row(
                        "UPDATE sync_tasks SET status = 'running', updated_at = ?1
                         WHERE id = (SELECT id FROM sync_tasks WHERE status = 'pending' ORDER BY id LIMIT 1)
                         RETURNING id, payload",
                        params![now()],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .context("Failed to claim task")?;

        let Some((id, body)) = claimed else {
            return Ok(None);
        };
        match serde_json::from_str::<TaskPayload>(&body) {
            Ok(payload) => Ok(Some(QueuedTask { id, payload })),
            Err(e) => {
                let reason = format!("undecodable payload: {}", e);
                self.fail(id, &reason).await?;
                Err(anyhow!("Task {} has an {}", id, reason))
            }
        }
    }

    /// Remove a finished task
    pub async fn complete(&self, id: i64) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM sync_tasks WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
        .with_context(|| format!("Failed to complete task {}", id))
    }

    pub async fn fail(&self, id: i64, error: &str) -> Result<()> {
        let error = error.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE sync_tasks SET status = 'failed', error = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, error, now()],
            )?;
            Ok(())
        })
        .await
        .with_context(|| format!("Failed to record failure of task {}", id))
    }

    /// Mark tasks left `running` by a dead process as abandoned
    pub async fn recover_abandoned(&self) -> Result<usize> {
        let count = self
            .with_conn(|conn| {
                let n = conn.execute(
                    "UPDATE sync_tasks SET status = 'abandoned', error = 'worker stopped before the task finished', updated_at = ?1
                     WHERE status = 'running'",
                    params![now()],
                )?;
                Ok(n)
            })
            .await?;
        if count > 0 {
            tracing::warn!("Marked {} interrupted task(s) as abandoned", count);
        }
        Ok(count)
    }

    /// State of a task, or `None` once it has been completed and removed
    pub async fn status(&self, id: i64) -> Result<Option<String>> {
        self.with_conn(move |conn| {
            let status = conn
                .query_row(
                    "SELECT status FROM sync_tasks WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(status)
        })
        .await
    }

    /// Readiness probe: the queue database answers a trivial query
    pub async fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
        .context("Task queue is not reachable")
    }

    /// Persist job snapshots so other processes can read them
    ///
    /// Snapshots are written in order inside one transaction.
    pub async fn save_jobs(&self, jobs: Vec<Job>) -> Result<()> {
        let rows = jobs
            .iter()
            .map(|job| {
                serde_json::to_string(job)
                    .map(|body| (job.id.clone(), job.status.to_string(), body))
                    .context("Failed to encode job")
            })
            .collect::<Result<Vec<_>>>()?;

        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare_cached(UPSERT_JOB)?;
                let ts = now();
                for (id, status, body) in &rows {
                    stmt.execute(params![id, status, body, ts])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .context("Failed to save job records")
    }

    pub async fn save_job(&self, job: &Job) -> Result<()> {
        self.save_jobs(vec![job.clone()]).await
    }

    /// Latest persisted snapshot of a job
    pub async fn load_job(&self, id: &str) -> Result<Option<Job>> {
        let id = id.to_string();
        let body: Option<String> = self
            .with_conn(move |conn| {
                let body = conn
                    .query_row(
                        "SELECT body FROM sync_jobs WHERE id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(body)
            })
            .await
            .context("Failed to load job record")?;

        body.map(|body| serde_json::from_str(&body).context("Failed to decode job record"))
            .transpose()
    }

    /// Every persisted job, in creation order
    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let bodies: Vec<String> = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT body FROM sync_jobs ORDER BY seq")?;
                let bodies = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(bodies)
            })
            .await
            .context("Failed to list job records")?;

        bodies
            .iter()
            .map(|body| serde_json::from_str(body).context("Failed to decode job record"))
            .collect()
    }

    /// Sleep until a task is enqueued in this process or `timeout` elapses
    pub async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}
