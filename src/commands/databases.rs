// ABOUTME: Environment listing and connectivity probe commands
// ABOUTME: The probe reports reachability and server version instead of failing

use crate::error::SyncError;
use crate::postgres::ConnectionManager;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Outcome of a connectivity test
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionProbe {
    pub database: String,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// True when the environment has no connection string at all
    #[serde(skip)]
    pub not_configured: bool,
}

pub fn list_databases(manager: &ConnectionManager) -> Vec<String> {
    manager.list_databases()
}

/// Check that an environment is reachable and report its server version
pub async fn test_connection(
    manager: &ConnectionManager,
    database: &str,
    cancel: &CancellationToken,
) -> ConnectionProbe {
    tracing::info!("Testing connection to '{}'...", database);
    match manager.test_connection(database, cancel).await {
        Ok(version) => {
            tracing::info!("✓ '{}' is reachable", database);
            ConnectionProbe {
                database: database.to_string(),
                connected: true,
                version: Some(version),
                error: None,
                not_configured: false,
            }
        }
        Err(e) => {
            let not_configured =
                matches!(e.downcast_ref::<SyncError>(), Some(SyncError::NotConfigured(_)));
            tracing::warn!("⚠ '{}' is not reachable: {:#}", database, e);
            ConnectionProbe {
                database: database.to_string(),
                connected: false,
                version: None,
                error: Some(format!("{:#}", e)),
                not_configured,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Environments, PoolSettings};

    #[tokio::test]
    async fn test_probe_unconfigured() {
        let manager = ConnectionManager::new(Environments::new(), PoolSettings::default());
        let probe = test_connection(&manager, "production", &CancellationToken::new()).await;

        assert!(!probe.connected);
        assert!(probe.not_configured);
        assert_eq!(
            probe.error.as_deref(),
            Some("database not configured: production")
        );

        let json = serde_json::to_value(&probe).unwrap();
        assert_eq!(json["connected"], false);
        assert!(json.get("version").is_none());
        assert!(json.get("not_configured").is_none());
    }
}
