// ABOUTME: Job orchestration: job registry, durable task queue, and worker pool
// ABOUTME: Turns export and import requests into tracked background tasks

pub mod job;
pub mod queue;
pub mod store;
pub mod worker;

pub use job::{Job, JobRegistry, JobStatus};
pub use queue::{QueuedTask, TaskPayload, TaskQueue};
pub use store::mirrored_registry;
pub use worker::{process_task, WorkerContext, WorkerPool};
