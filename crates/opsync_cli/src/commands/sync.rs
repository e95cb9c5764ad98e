//! One-shot sync command implementation.

use opsync_engine::{
    HttpNetwork, QueueStoragePort, ReqwestClient, SyncConfig, SyncOrchestrator, SyncStats,
    SyncStatus,
};
use opsync_storage::FileStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Arguments of the sync command.
#[derive(Debug, Clone)]
pub struct SyncArgs {
    /// Server base URL.
    pub server: String,
    /// Project to sync.
    pub project: String,
    /// This client's device id.
    pub device: String,
    /// Bearer token.
    pub token: Option<String>,
    /// Optional JSON settings file.
    pub config: Option<PathBuf>,
}

/// Runs the sync command.
pub fn run(path: &Path, args: SyncArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_deref())?;
    let store = Arc::new(FileStore::open(path)?);

    let runtime = tokio::runtime::Runtime::new()?;
    let (status, stats) = runtime.block_on(sync_once(store, config, &args))?;

    print_summary(&args.project, status, &stats);
    check_outcome(status, &stats)
}

/// Reads sync settings from a JSON file, or returns the defaults.
pub fn load_config(path: Option<&Path>) -> Result<SyncConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
            serde_json::from_str::<SyncConfig>(&text)
                .map_err(|e| format!("invalid config {}: {e}", path.display()))?
        }
        None => SyncConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

async fn sync_once(
    store: Arc<FileStore>,
    config: SyncConfig,
    args: &SyncArgs,
) -> Result<(SyncStatus, SyncStats), Box<dyn std::error::Error>> {
    let client = ReqwestClient::new(config.request_timeout())?;
    let network = HttpNetwork::new(args.server.clone(), client);
    network.set_bearer_token(args.token.clone());

    let orchestrator = SyncOrchestrator::builder(args.project.clone(), args.device.clone())
        .config(config)
        .storage(Arc::new(QueueStoragePort::new(
            store.clone(),
            args.project.clone(),
        )))
        .network(Arc::new(network))
        .versions(store)
        .build()?;

    info!(project_id = %args.project, server = %args.server, "running one sync cycle");
    orchestrator.start();
    orchestrator.force_sync().await;

    let result = (orchestrator.status(), orchestrator.stats());
    orchestrator.stop();
    Ok(result)
}

fn print_summary(project: &str, status: SyncStatus, stats: &SyncStats) {
    println!("Project: {project}");
    println!("Status:  {status}");
    println!("Synced:  {} operation(s)", stats.total_processed);
    println!("Pending: {} operation(s)", stats.pending_operations);
    if let Some(error) = &stats.last_error {
        println!("Error:   {error}");
    }
}

/// Turns the cycle outcome into the command's exit result.
pub fn check_outcome(status: SyncStatus, stats: &SyncStats) -> Result<(), Box<dyn std::error::Error>> {
    let failed = matches!(status, SyncStatus::Error | SyncStatus::Stopped)
        || stats.current_retry_count > 0;
    match (&stats.last_error, failed) {
        (Some(error), true) => Err(format!("sync failed: {error}").into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn config_defaults_without_file() {
        let config = load_config(None).unwrap();
        assert_eq!(config.batch_size, 50);
    }

    #[test]
    fn config_from_json_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(&path, r#"{"batchSize": 5, "maxRetries": 1}"#).unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.sync_interval(), Duration::from_millis(5000));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(&path, r#"{"batchSize": 0}"#).unwrap();
        assert!(load_config(Some(&path)).is_err());
        assert!(load_config(Some(&dir.path().join("missing.json"))).is_err());
    }

    #[test]
    fn outcome_reflects_failures() {
        let clean = SyncStats::default();
        assert!(check_outcome(SyncStatus::Running, &clean).is_ok());

        let failed = SyncStats {
            last_error: Some("HTTP 500: boom".into()),
            current_retry_count: 1,
            ..SyncStats::default()
        };
        assert!(check_outcome(SyncStatus::Running, &failed).is_err());
        assert!(check_outcome(SyncStatus::Error, &failed).is_err());

        let recovered = SyncStats {
            last_error: Some("old".into()),
            ..SyncStats::default()
        };
        assert!(check_outcome(SyncStatus::Running, &recovered).is_ok());
    }
}
