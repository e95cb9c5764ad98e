//! Version store trait definition.

use crate::error::StorageResult;

/// A durable scalar per project: the last server version the client has
/// acknowledged.
///
/// Only the sync orchestrator writes it. The store itself does not enforce
/// monotonicity.
pub trait VersionStore: Send + Sync {
    /// Loads the stored version, or `None` if the project has never synced.
    fn load_version(&self, project_id: &str) -> StorageResult<Option<u64>>;

    /// Stores a version.
    ///
    /// After this returns successfully the value survives process restarts
    /// (for durable implementations).
    fn save_version(&self, project_id: &str, version: u64) -> StorageResult<()>;
}
