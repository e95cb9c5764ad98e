//! Request handlers for sync endpoints.

use crate::auth::{AuthConfig, TokenValidator};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::oplog::ServerOplog;
use opsync_protocol::{OperationsResponse, SyncRequest, SyncResponse};
use std::sync::Arc;
use tracing::{debug, info};

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Server oplog (shared across all handlers).
    pub oplog: Arc<ServerOplog>,
    validator: Option<TokenValidator>,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig, oplog: Arc<ServerOplog>) -> Self {
        let validator = match (&config.auth_secret, config.require_auth) {
            (Some(secret), true) => Some(TokenValidator::new(
                AuthConfig::new(secret.clone()).with_expiry(config.token_expiry),
            )),
            _ => None,
        };
        Self {
            config,
            oplog,
            validator,
        }
    }

    /// Returns the token validator when authentication is enabled.
    pub fn validator(&self) -> Option<&TokenValidator> {
        self.validator.as_ref()
    }

    /// Checks a bearer token.
    ///
    /// Returns the token subject, or `None` when authentication is off.
    pub fn authorize(&self, bearer: Option<&str>) -> ServerResult<Option<String>> {
        if !self.config.require_auth {
            return Ok(None);
        }
        let Some(validator) = &self.validator else {
            return Err(ServerError::Internal(
                "authentication required but no secret configured".into(),
            ));
        };
        let token = bearer
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ServerError::AuthenticationFailed("missing bearer token".into()))?;
        validator.validate_token(token).map(Some)
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles a batch sent by a client.
    ///
    /// A client whose `lastSyncVersion` is behind the project gets a
    /// rejection carrying the current version (and, when configured, the
    /// operations it is missing). That rejection is a normal response, not
    /// an error.
    pub fn handle_sync(&self, request: SyncRequest) -> ServerResult<SyncResponse> {
        if request.project_id.is_empty() {
            return Err(ServerError::InvalidRequest("projectId is required".into()));
        }
        let max = self.context.config.max_push_batch;
        if request.operations.len() > max {
            return Err(ServerError::InvalidRequest(format!(
                "too many operations: {} > {}",
                request.operations.len(),
                max
            )));
        }

        let project_id = request.project_id;
        let count = request.operations.len();
        match self.context.oplog.append(
            &project_id,
            request.operations,
            Some(request.last_sync_version),
        ) {
            Ok(appended) => {
                info!(
                    project_id = %project_id,
                    device_id = %request.device_id,
                    count,
                    version = appended.version,
                    "applied sync batch"
                );
                Ok(SyncResponse {
                    success: true,
                    sync_version: Some(appended.version),
                    applied_operations: appended.applied,
                    ..SyncResponse::default()
                })
            }
            Err(err @ ServerError::VersionConflict { expected, actual }) => {
                debug!(
                    project_id = %project_id,
                    device_id = %request.device_id,
                    expected,
                    actual,
                    "rejected stale sync batch"
                );
                let mut response = SyncResponse {
                    success: false,
                    sync_version: Some(expected),
                    errors: vec![err.to_string()],
                    ..SyncResponse::default()
                };
                if self.context.config.include_server_operations {
                    let page = self.context.oplog.operations_since(
                        &project_id,
                        actual,
                        self.context.config.max_pull_batch,
                    );
                    response.sync_version = Some(page.version);
                    response.server_operations = page.operations;
                }
                Ok(response)
            }
            Err(e) => Err(e),
        }
    }

    /// Handles a catch-up fetch.
    pub fn handle_operations(
        &self,
        project_id: &str,
        since: u64,
    ) -> ServerResult<OperationsResponse> {
        if project_id.is_empty() {
            return Err(ServerError::InvalidRequest("projectId is required".into()));
        }
        let page = self.context.oplog.operations_since(
            project_id,
            since,
            self.context.config.max_pull_batch,
        );
        debug!(
            project_id,
            since,
            count = page.operations.len(),
            version = page.version,
            "served catch-up"
        );
        Ok(OperationsResponse {
            success: true,
            sync_version: Some(page.version),
            operations: page.operations,
            errors: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use opsync_protocol::{WireId, WireOperation};
    use serde_json::json;

    fn make_op(id: u64, device: &str) -> WireOperation {
        WireOperation {
            id: Some(WireId::from_id(id)),
            op_type: "node.create".into(),
            project_id: None,
            timeline_id: "main".into(),
            layer_id: Some("base".into()),
            payload: json!({"n": id}),
            device_id: device.into(),
            timestamp: Utc::now(),
        }
    }

    fn request(ops: Vec<WireOperation>, last: u64, device: &str) -> SyncRequest {
        SyncRequest {
            operations: ops,
            project_id: "p".into(),
            last_sync_version: last,
            device_id: device.into(),
        }
    }

    fn create_handler(config: ServerConfig) -> RequestHandler {
        let oplog = Arc::new(ServerOplog::new());
        let context = Arc::new(HandlerContext::new(config, oplog));
        RequestHandler::new(context)
    }

    #[test]
    fn sync_applies_batch() {
        let handler = create_handler(ServerConfig::default());
        let response = handler
            .handle_sync(request(vec![make_op(1, "a"), make_op(2, "a")], 0, "a"))
            .unwrap();
        assert!(response.success);
        assert_eq!(response.sync_version, Some(2));
        assert_eq!(response.applied_operations.len(), 2);
    }

    #[test]
    fn stale_client_is_rejected_with_current_version() {
        let handler = create_handler(ServerConfig::default());
        handler
            .handle_sync(request(vec![make_op(1, "a")], 0, "a"))
            .unwrap();

        let response = handler
            .handle_sync(request(vec![make_op(1, "b")], 0, "b"))
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.sync_version, Some(1));
        assert!(response.applied_operations.is_empty());
        assert!(response.server_operations.is_empty());
        assert!(response.errors[0].contains("version conflict"));
    }

    #[test]
    fn rejection_can_carry_missing_operations() {
        let handler = create_handler(ServerConfig::default().with_server_operations(true));
        handler
            .handle_sync(request(vec![make_op(1, "a"), make_op(2, "a")], 0, "a"))
            .unwrap();

        let response = handler
            .handle_sync(request(vec![make_op(1, "b")], 1, "b"))
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.sync_version, Some(2));
        assert_eq!(response.server_operations.len(), 1);
        assert_eq!(response.server_operations[0].id, Some(WireId::from_id(2)));
    }

    #[test]
    fn oversized_batch_is_invalid() {
        let handler = create_handler(ServerConfig::default().with_max_push_batch(1));
        let err = handler
            .handle_sync(request(vec![make_op(1, "a"), make_op(2, "a")], 0, "a"))
            .unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn catch_up_returns_history() {
        let handler = create_handler(ServerConfig::default());
        handler
            .handle_sync(request(vec![make_op(1, "a"), make_op(2, "a")], 0, "a"))
            .unwrap();

        let response = handler.handle_operations("p", 1).unwrap();
        assert!(response.success);
        assert_eq!(response.sync_version, Some(2));
        assert_eq!(response.operations.len(), 1);
        assert_eq!(response.operations[0].project_id.as_deref(), Some("p"));
    }

    #[test]
    fn authorize_checks_tokens() {
        let secret = b"secret".to_vec();
        let context = HandlerContext::new(
            ServerConfig::default().with_auth(secret),
            Arc::new(ServerOplog::new()),
        );
        let token = context.validator().unwrap().create_token("alice").unwrap();

        assert_eq!(
            context.authorize(Some(&token)).unwrap(),
            Some("alice".to_string())
        );
        assert!(matches!(
            context.authorize(None),
            Err(ServerError::AuthenticationFailed(_))
        ));
        assert!(context.authorize(Some("alice.1.00")).is_err());
    }

    #[test]
    fn authorize_is_open_without_auth() {
        let context = HandlerContext::new(ServerConfig::default(), Arc::new(ServerOplog::new()));
        assert_eq!(context.authorize(None).unwrap(), None);
    }
}
