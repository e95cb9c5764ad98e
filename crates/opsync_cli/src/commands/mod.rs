//! CLI command implementations.

pub mod dump_queue;
pub mod enqueue;
pub mod inspect;
pub mod reset_version;
pub mod sync;

use opsync_storage::FileStore;
use std::path::Path;

/// Opens a queue directory that must already exist.
pub fn open_existing(path: &Path) -> Result<FileStore, Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No queue found at {:?}", path).into());
    }
    Ok(FileStore::open(path)?)
}
