//! Main sync server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use crate::hub::ChannelHub;
use crate::oplog::ServerOplog;
use opsync_protocol::{from_json, to_json, OperationsResponse, SyncRequest, SyncResponse};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;
use url::form_urlencoded;

/// Path served for both sync and catch-up requests.
pub const OPERATIONS_ROUTE: &str = "/sync/operations";

/// A raw HTTP reply.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpReply {
    /// Status code.
    pub status: u16,
    /// JSON body.
    pub body: Vec<u8>,
}

/// The sync server.
///
/// This server handles synchronization requests from clients. It maintains
/// a per-project oplog and serves the request/response endpoints as well
/// as a push-channel hub.
///
/// # Example
///
/// ```
/// use opsync_server::{SyncServer, ServerConfig};
///
/// let server = SyncServer::new(ServerConfig::default());
/// assert_eq!(server.version("project-1"), 0);
///
/// // An HTTP frontend forwards requests to server.handle_http(...)
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
    hub: ChannelHub,
}

impl SyncServer {
    /// Creates a new sync server.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_oplog(config, Arc::new(ServerOplog::new()))
    }

    /// Creates a sync server with an existing oplog.
    pub fn with_oplog(config: ServerConfig, oplog: Arc<ServerOplog>) -> Self {
        let context = Arc::new(HandlerContext::new(config, oplog));
        let handler = RequestHandler::new(Arc::clone(&context));
        let hub = ChannelHub::new(Arc::clone(&context));

        Self {
            handler,
            context,
            hub,
        }
    }

    /// Handles a sync request.
    pub fn handle_sync(&self, request: SyncRequest) -> ServerResult<SyncResponse> {
        self.handler.handle_sync(request)
    }

    /// Handles a catch-up fetch.
    pub fn handle_operations(
        &self,
        project_id: &str,
        since: u64,
    ) -> ServerResult<OperationsResponse> {
        self.handler.handle_operations(project_id, since)
    }

    /// Routes a raw HTTP request.
    ///
    /// `path_and_query` is the request target without scheme or host.
    pub fn handle_http(
        &self,
        method: &str,
        path_and_query: &str,
        bearer: Option<&str>,
        body: Option<&[u8]>,
    ) -> HttpReply {
        match self.route(method, path_and_query, bearer, body) {
            Ok(body) => HttpReply { status: 200, body },
            Err(e) => {
                if e.is_server_error() {
                    warn!(method, path = path_and_query, error = %e, "request failed");
                }
                let body = json!({ "success": false, "errors": [e.to_string()] });
                HttpReply {
                    status: e.status_code(),
                    body: body.to_string().into_bytes(),
                }
            }
        }
    }

    fn route(
        &self,
        method: &str,
        path_and_query: &str,
        bearer: Option<&str>,
        body: Option<&[u8]>,
    ) -> ServerResult<Vec<u8>> {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, query),
            None => (path_and_query, ""),
        };
        if path != OPERATIONS_ROUTE {
            return Err(ServerError::NotFound(path.to_string()));
        }

        self.context.authorize(bearer)?;

        match method.to_ascii_uppercase().as_str() {
            "POST" => {
                let body = body
                    .ok_or_else(|| ServerError::InvalidRequest("missing request body".into()))?;
                let request: SyncRequest = from_json(body)?;
                Ok(to_json(&self.handle_sync(request)?)?)
            }
            "GET" => {
                let mut project_id = None;
                let mut since = 0;
                for (key, value) in form_urlencoded::parse(query.as_bytes()) {
                    match key.as_ref() {
                        "projectId" => project_id = Some(value.into_owned()),
                        "since" => {
                            since = value.parse().map_err(|_| {
                                ServerError::InvalidRequest(format!("invalid since: {value}"))
                            })?
                        }
                        _ => {}
                    }
                }
                let project_id = project_id
                    .ok_or_else(|| ServerError::InvalidRequest("projectId is required".into()))?;
                Ok(to_json(&self.handle_operations(&project_id, since)?)?)
            }
            other => Err(ServerError::InvalidRequest(format!(
                "method {other} not allowed"
            ))),
        }
    }

    /// Returns the push-channel hub.
    pub fn hub(&self) -> &ChannelHub {
        &self.hub
    }

    /// Issues a bearer token when authentication is enabled.
    pub fn issue_token(&self, subject: &str) -> Option<ServerResult<String>> {
        self.context
            .validator()
            .map(|validator| validator.create_token(subject))
    }

    /// Returns the current version of a project.
    pub fn version(&self, project_id: &str) -> u64 {
        self.context.oplog.version(project_id)
    }

    /// Returns the number of operations stored for a project.
    pub fn operation_count(&self, project_id: &str) -> usize {
        self.context.oplog.len(project_id)
    }

    /// Returns the shared oplog.
    pub fn oplog(&self) -> &Arc<ServerOplog> {
        &self.context.oplog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use opsync_protocol::{WireId, WireOperation};
    use serde_json::Value;

    fn make_op(id: u64) -> WireOperation {
        WireOperation {
            id: Some(WireId::from_id(id)),
            op_type: "node.create".into(),
            project_id: None,
            timeline_id: "main".into(),
            layer_id: None,
            payload: json!({"n": id}),
            device_id: "dev-a".into(),
            timestamp: Utc::now(),
        }
    }

    fn sync_body(project: &str, last: u64, ids: &[u64]) -> Vec<u8> {
        let request = SyncRequest {
            operations: ids.iter().map(|id| make_op(*id)).collect(),
            project_id: project.into(),
            last_sync_version: last,
            device_id: "dev-a".into(),
        };
        to_json(&request).unwrap()
    }

    fn body_json(reply: &HttpReply) -> Value {
        serde_json::from_slice(&reply.body).unwrap()
    }

    #[test]
    fn server_lifecycle() {
        let server = SyncServer::new(ServerConfig::default());
        assert_eq!(server.version("p"), 0);
        assert_eq!(server.operation_count("p"), 0);
        assert!(server.issue_token("alice").is_none());
    }

    #[test]
    fn full_sync_flow() {
        let server = SyncServer::new(ServerConfig::default());

        let body = sync_body("p", 0, &[1, 2]);
        let reply = server.handle_http("POST", OPERATIONS_ROUTE, None, Some(&body));
        assert_eq!(reply.status, 200);
        let body = body_json(&reply);
        assert_eq!(body["success"], true);
        assert_eq!(body["syncVersion"], 2);
        assert_eq!(body["appliedOperations"], json!([1, 2]));

        let reply =
            server.handle_http("GET", "/sync/operations?projectId=p&since=1", None, None);
        assert_eq!(reply.status, 200);
        let body = body_json(&reply);
        assert_eq!(body["syncVersion"], 2);
        assert_eq!(body["operations"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn project_id_is_percent_decoded() {
        let server = SyncServer::new(ServerConfig::default());
        let body = sync_body("my proj", 0, &[1]);
        server.handle_http("POST", OPERATIONS_ROUTE, None, Some(&body));

        let path = "/sync/operations?projectId=my%20proj&since=0";
        let reply = server.handle_http("GET", path, None, None);
        assert_eq!(body_json(&reply)["operations"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn bad_requests() {
        let server = SyncServer::new(ServerConfig::default());
        let status = |method: &str, path: &str, body: Option<&[u8]>| {
            server.handle_http(method, path, None, body).status
        };
        assert_eq!(status("GET", "/nope", None), 404);
        assert_eq!(status("POST", OPERATIONS_ROUTE, None), 400);
        assert_eq!(status("POST", OPERATIONS_ROUTE, Some(b"{")), 400);
        assert_eq!(status("DELETE", OPERATIONS_ROUTE, None), 400);
        assert_eq!(status("GET", "/sync/operations?since=x&projectId=p", None), 400);
        assert_eq!(status("GET", "/sync/operations?since=1", None), 400);
    }

    #[test]
    fn authentication_is_enforced() {
        let server = SyncServer::new(ServerConfig::default().with_auth(b"secret".to_vec()));
        let body = sync_body("p", 0, &[1]);

        let reply = server.handle_http("POST", OPERATIONS_ROUTE, None, Some(&body));
        assert_eq!(reply.status, 401);
        assert_eq!(body_json(&reply)["success"], false);

        let token = server.issue_token("alice").unwrap().unwrap();
        let reply = server.handle_http("POST", OPERATIONS_ROUTE, Some(&token), Some(&body));
        assert_eq!(reply.status, 200);
    }

    #[test]
    fn query_plus_and_escapes_decode() {
        let server = SyncServer::new(ServerConfig::default());
        let body = sync_body("café team", 0, &[1]);
        server.handle_http("POST", OPERATIONS_ROUTE, None, Some(&body));

        for path in [
            "/sync/operations?projectId=caf%C3%A9+team&since=0",
            "/sync/operations?projectId=caf%C3%A9%20team&since=0",
        ] {
            let reply = server.handle_http("GET", path, None, None);
            assert_eq!(reply.status, 200, "{path}");
            assert_eq!(body_json(&reply)["operations"].as_array().unwrap().len(), 1);
        }
    }
}
