//! Dump queue command implementation.

use opsync_engine::operation_from_record;
use opsync_storage::{FileStore, OperationQueue};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

/// Queued operation representation for output.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperationInfo {
    /// Queue id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Owning project.
    pub project_id: String,
    /// Operation type.
    pub op_type: String,
    /// Timeline id.
    pub timeline_id: String,
    /// Layer id.
    pub layer_id: String,
    /// Originating device.
    pub device_id: String,
    /// Creation time (RFC 3339).
    pub timestamp: String,
    /// Payload as stored.
    pub payload: Value,
}

/// Runs the dump-queue command.
pub fn run(
    path: &Path,
    project: Option<&str>,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_existing(path)?;
    let operations = read_queue(&store, project, limit)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&operations)?);
        }
        _ => {
            print_text_output(&operations);
        }
    }

    Ok(())
}

/// Reads queued operations in FIFO order, project by project.
pub fn read_queue(
    store: &FileStore,
    project: Option<&str>,
    limit: Option<usize>,
) -> Result<Vec<QueuedOperationInfo>, Box<dyn std::error::Error>> {
    let projects = match project {
        Some(project) => vec![project.to_string()],
        None => store.projects()?,
    };
    let max_records = limit.unwrap_or(usize::MAX);

    let mut operations = Vec::new();
    for project_id in projects {
        for record in store.pull_oldest(&project_id, max_records)? {
            let op = operation_from_record(&record, &project_id);
            operations.push(QueuedOperationInfo {
                id: op.id,
                layer_id: op.layer_id().to_string(),
                project_id: op.project_id,
                op_type: op.op_type,
                timeline_id: op.timeline_id,
                device_id: op.device_id,
                timestamp: op.timestamp.to_rfc3339(),
                payload: op.payload,
            });
        }
    }
    Ok(operations)
}

fn print_text_output(operations: &[QueuedOperationInfo]) {
    if operations.is_empty() {
        println!("Queue is empty.");
        return;
    }

    println!("{:>8}  {:<16}  {:<20}  {:<12}  TIMESTAMP", "ID", "PROJECT", "TYPE", "DEVICE");
    for op in operations {
        let id = op.id.map_or_else(|| "-".to_string(), |id| id.to_string());
        println!(
            "{:>8}  {:<16}  {:<20}  {:<12}  {}",
            id, op.project_id, op.op_type, op.device_id, op.timestamp
        );
    }
    println!();
    println!("{} operation(s)", operations.len());
}
