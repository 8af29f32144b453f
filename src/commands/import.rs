// ABOUTME: Start-import command: validates source and target, then picks the newest dump
// ABOUTME: Only the configured safe target may be written by an import

use crate::config::{is_known_environment, Config};
use crate::error::SyncError;
use crate::jobs::{JobRegistry, TaskPayload, TaskQueue};
use crate::migration::latest_dump;
use anyhow::Result;

/// Validate the request and register a pending import job
///
/// # Errors
///
/// - [`SyncError::InvalidSource`] if `source` is not a known environment label
/// - [`SyncError::InvalidImportTarget`] if `target` is not the safe import target
/// - [`SyncError::NoDumpFound`] if no dump for `source` exists in the dump directory
pub async fn prepare_import(
    config: &Config,
    registry: &JobRegistry,
    source: &str,
    target: &str,
) -> Result<TaskPayload> {
    let source = source.trim().to_lowercase();
    let target = target.trim().to_lowercase();

    if !is_known_environment(&source) {
        return Err(SyncError::InvalidSource(source).into());
    }
    if target != config.import.target {
        return Err(SyncError::InvalidImportTarget {
            target,
            allowed: config.import.target.clone(),
        }
        .into());
    }

    let dump = latest_dump(&config.dump_dir, &source)
        .await?
        .ok_or_else(|| SyncError::NoDumpFound(source.clone()))?;
    tracing::info!(
        "Using dump {} ({} bytes) for import from '{}'",
        dump.path.display(),
        dump.size,
        source
    );

    let job = registry.create(&target);
    Ok(TaskPayload::Import {
        source,
        target,
        dump_path: dump.path,
        job_id: job.id,
        dump_size: dump.size,
    })
}

/// Queue an import of the newest `source` dump into `target`, returning the job id
pub async fn start_import(
    config: &Config,
    registry: &JobRegistry,
    queue: &TaskQueue,
    source: &str,
    target: &str,
) -> Result<String> {
    let payload = prepare_import(config, registry, source, target).await?;
    super::enqueue(registry, queue, payload).await
}
