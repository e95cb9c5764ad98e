//! Enqueue command implementation.

use opsync_protocol::Operation;
use opsync_storage::{FileStore, OperationQueue};
use serde_json::Value;
use std::path::Path;

/// Arguments of the enqueue command.
#[derive(Debug, Clone)]
pub struct EnqueueArgs {
    /// Owning project.
    pub project: String,
    /// Operation type.
    pub op_type: String,
    /// JSON payload text.
    pub payload: String,
    /// Timeline id.
    pub timeline: String,
    /// Layer id.
    pub layer: Option<String>,
    /// Originating device.
    pub device: String,
}

/// Runs the enqueue command.
pub fn run(path: &Path, args: EnqueueArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileStore::open(path)?;
    let id = enqueue(&store, args)?;
    println!("Queued operation {id}");
    Ok(())
}

/// Builds the operation and appends it to the queue.
pub fn enqueue(store: &FileStore, args: EnqueueArgs) -> Result<u64, Box<dyn std::error::Error>> {
    if args.project.is_empty() {
        return Err("project must not be empty".into());
    }
    let payload: Value = serde_json::from_str(&args.payload)
        .map_err(|e| format!("payload is not valid JSON: {e}"))?;

    let mut op = Operation::new(
        args.op_type,
        args.project,
        args.timeline,
        payload,
        args.device,
    );
    if let Some(layer) = args.layer {
        op = op.with_layer(layer);
    }
    Ok(store.push(&op)?)
}
