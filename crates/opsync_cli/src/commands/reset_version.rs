//! Reset-version command implementation.

use opsync_storage::VersionStore;
use std::path::Path;

/// Runs the reset-version command.
///
/// The next sync from this directory sends `version` as its last known
/// server version; a server that is ahead answers with a catch-up.
pub fn run(path: &Path, project: &str, version: u64) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_existing(path)?;
    let previous = store.load_version(project)?;
    store.save_version(project, version)?;

    match previous {
        Some(previous) => println!("{project}: version {previous} -> {version}"),
        None => println!("{project}: version set to {version}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_storage::FileStore;
    use tempfile::tempdir;

    #[test]
    fn overwrites_stored_version() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.save_version("p", 12).unwrap();
        }
        run(dir.path(), "p", 0).unwrap();

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.load_version("p").unwrap(), Some(0));
    }
}
