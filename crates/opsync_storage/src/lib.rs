//! # opsync Storage
//!
//! Durable operation queue and version store for the opsync engine.
//!
//! Stores here are **dumb**: they keep raw JSON records in append order and a
//! version scalar per project. They never interpret operations beyond the
//! owning project id. Rebuilding canonical operations from raw records is the
//! engine's job.
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For testing and ephemeral sessions
//! - [`FileStore`] - Directory-backed store that survives restarts
//!
//! Both implement [`OperationQueue`] and [`VersionStore`].
//!
//! ## Example
//!
//! ```rust
//! use opsync_protocol::Operation;
//! use opsync_storage::{InMemoryStore, OperationQueue, VersionStore};
//! use serde_json::json;
//!
//! let store = InMemoryStore::new();
//! let op = Operation::new("node.create", "p1", "main", json!({}), "dev");
//! let id = store.push(&op).unwrap();
//! assert_eq!(store.count("p1").unwrap(), 1);
//!
//! store.delete(&[id]).unwrap();
//! store.save_version("p1", 4).unwrap();
//! assert_eq!(store.load_version("p1").unwrap(), Some(4));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod memory;
mod queue;
mod version;

pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::InMemoryStore;
pub use queue::{OperationQueue, QueueEntry};
pub use version::VersionStore;
