// ABOUTME: Typed error taxonomy for environment sync jobs
// ABOUTME: Lets callers tell configuration, connectivity, and execution failures apart

use thiserror::Error;

/// Errors that callers need to distinguish from generic failures.
///
/// Engine code propagates these wrapped in `anyhow::Error`; use
/// `err.downcast_ref::<SyncError>()` to recover the kind.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No connection string was configured for the environment
    #[error("database not configured: {0}")]
    NotConfigured(String),

    /// Pool creation or the health check failed after all retries
    #[error("database '{environment}' is unreachable: {reason}")]
    Unreachable { environment: String, reason: String },

    /// A catalog metadata query failed
    #[error("schema introspection failed: {0}")]
    Introspection(String),

    /// A dump statement failed during import
    #[error("exec failed: {reason}; stmt: {statement}")]
    Execution { statement: String, reason: String },

    /// No dump artifact exists for the requested source
    #[error("no export found for '{0}', please export first")]
    NoDumpFound(String),

    /// Import target is not the designated safe target
    #[error("invalid target '{target}'; only '{allowed}' is allowed")]
    InvalidImportTarget { target: String, allowed: String },

    /// Import source label is not a known environment
    #[error("invalid source '{0}'")]
    InvalidSource(String),

    #[error("job not found: {0}")]
    JobNotFound(String),
}
