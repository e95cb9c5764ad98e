//! # opsync Sync Server
//!
//! Reference in-process sync server for opsync clients.
//!
//! This crate provides:
//! - Request/response handling for `/sync/operations` (sync and catch-up)
//! - A per-project server oplog with a monotonic version counter
//! - Authentication (HMAC-SHA256 bearer tokens)
//! - A push-channel hub that acknowledges and relays operations
//!
//! # Architecture
//!
//! The server is transport-agnostic: an HTTP frontend (or a test harness)
//! forwards requests to [`SyncServer::handle_http`], and a socket frontend
//! feeds text frames to [`ChannelHub::handle_frame`]. Both share one
//! [`ServerOplog`].
//!
//! # Authentication
//!
//! Authentication is optional but recommended for production:
//!
//! ```rust
//! use opsync_server::{ServerConfig, SyncServer};
//!
//! let secret = b"my-secure-secret-32-bytes-long!".to_vec();
//! let server = SyncServer::new(ServerConfig::default().with_auth(secret));
//!
//! let token = server.issue_token("device-1").unwrap().unwrap();
//! assert!(!token.is_empty());
//! ```
//!
//! # Protocol
//!
//! Each sync request carries the client's `lastSyncVersion`:
//! 1. If it is current, the batch is applied and the new version returned
//! 2. If it is behind, the batch is refused with the current version so the
//!    client can catch up and retry
//! 3. Operations a client already delivered are acknowledged, not reapplied

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod hub;
mod oplog;
mod server;

pub use auth::{AuthConfig, TokenValidator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use hub::{ChannelHub, ClientId};
pub use oplog::{Appended, HistoryPage, ServerOplog};
pub use server::{HttpReply, SyncServer, OPERATIONS_ROUTE};
