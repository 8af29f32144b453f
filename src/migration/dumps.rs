// ABOUTME: Dump artifact naming, lookup of the newest dump, and backup retention
// ABOUTME: Names follow {environment}_{YYYYMMDD_HHMMSS}.sql and backup_{ts}_from_{source}.sql

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// A dump artifact found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

pub fn dump_file_name(environment: &str, at: DateTime<Local>) -> String {
    format!("{}_{}.sql", environment, at.format(TIMESTAMP_FORMAT))
}

pub fn backup_file_name(source: &str, at: DateTime<Local>) -> String {
    format!("backup_{}_from_{}.sql", at.format(TIMESTAMP_FORMAT), source)
}

/// Newest dump for `source` in `dir`, by modification time
///
/// Returns `None` when the directory is missing or holds no matching file.
pub async fn latest_dump(dir: &Path, source: &str) -> Result<Option<DumpFile>> {
    let prefix = format!("{}_", source);
    let dumps = list_matching(dir, |name| {
        name.starts_with(&prefix) && name.ends_with(".sql")
    })
    .await?;
    Ok(dumps.into_iter().next())
}

/// Delete all but the `keep` newest backups in `dir`, returning how many were removed
pub async fn prune_backups(dir: &Path, keep: usize) -> Result<usize> {
    let backups = list_matching(dir, |name| {
        name.starts_with("backup_") && name.ends_with(".sql")
    })
    .await?;

    let mut removed = 0;
    for old in backups.into_iter().skip(keep) {
        tracing::info!("Removing old backup {}", old.path.display());
        tokio::fs::remove_file(&old.path)
            .await
            .with_context(|| format!("Failed to remove {}", old.path.display()))?;
        removed += 1;
    }
    Ok(removed)
}

/// Regular files whose name passes `matches`, newest first
async fn list_matching<F>(dir: &Path, matches: F) -> Result<Vec<DumpFile>>
where
    F: Fn(&str) -> bool,
{
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read directory {}", dir.display()))
        }
    };

    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !matches(name) {
            continue;
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        found.push(DumpFile {
            path: entry.path(),
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }

    found.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));
    Ok(found)
}
