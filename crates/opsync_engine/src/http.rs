//! Request/response network port.
//!
//! The actual HTTP client is abstracted via a trait so the port works with
//! reqwest (behind the `reqwest` feature), with an in-process server for
//! tests, or with anything else that can carry a JSON body.

use crate::error::{message_indicates_auth, EngineResult, SyncError};
use crate::transport::NetworkPort;
use async_trait::async_trait;
use opsync_protocol::{
    from_json, to_json, OperationBatch, OperationId, OperationsResponse, SyncRequest,
    SyncResponse, SyncResult, WireId,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Path of the batch and catch-up endpoints.
pub const OPERATIONS_PATH: &str = "/sync/operations";

/// HTTP method used by the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET.
    Get,
    /// POST.
    Post,
}

impl HttpMethod {
    /// Returns the method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Absolute URL including any query string.
    pub url: String,
    /// Bearer token for the `Authorization` header.
    pub bearer_token: Option<String>,
    /// JSON body.
    pub body: Option<Vec<u8>>,
}

/// A received response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// `execute` returns `Err` only when no response was received at all
/// (connection refused, DNS failure, timeout).
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request and returns the response.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, String>;

    /// Checks if the client is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

enum ExchangeError {
    Unauthorized(String),
    Failed(String),
}

/// Network port speaking JSON over HTTP.
///
/// Stateless apart from the bearer token, an online switch and the last
/// error, which is kept for diagnostics.
pub struct HttpNetwork<C: HttpClient> {
    base_url: String,
    client: C,
    bearer_token: RwLock<Option<String>>,
    online: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpNetwork<C> {
    /// Creates a port for the server at `base_url` (e.g. `https://sync.example.com`).
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            bearer_token: RwLock::new(None),
            online: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Sets the bearer token sent with every request.
    pub fn with_bearer_token(self, token: impl Into<String>) -> Self {
        *self.bearer_token.write() = Some(token.into());
        self
    }

    /// Replaces the bearer token, e.g. after the user signs in again.
    pub fn set_bearer_token(&self, token: Option<String>) {
        *self.bearer_token.write() = token;
    }

    /// Marks the port offline or online (e.g. from OS connectivity events).
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn set_error(&self, err: &str) {
        *self.last_error.write() = Some(err.to_string());
    }

    fn clear_error(&self) {
        *self.last_error.write() = None;
    }

    async fn exchange<Res>(
        &self,
        method: HttpMethod,
        path_and_query: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Res, ExchangeError>
    where
        Res: DeserializeOwned,
    {
        let request = HttpRequest {
            method,
            url: format!("{}{}", self.base_url, path_and_query),
            bearer_token: self.bearer_token.read().clone(),
            body,
        };
        debug!(method = method.as_str(), url = %request.url, "sending sync request");

        let response = match self.client.execute(request).await {
            Ok(response) => response,
            Err(e) if message_indicates_auth(&e) => {
                self.set_error(&e);
                return Err(ExchangeError::Unauthorized(e));
            }
            Err(e) => {
                let message = format!("network error: {e}");
                self.set_error(&message);
                return Err(ExchangeError::Failed(message));
            }
        };

        if response.status == 401 || response.status == 403 {
            let message = format!("HTTP {}: {}", response.status, body_excerpt(&response.body));
            self.set_error(&message);
            return Err(ExchangeError::Unauthorized(message));
        }

        if !response.is_success() {
            let message = format!("HTTP {}: {}", response.status, body_excerpt(&response.body));
            self.set_error(&message);
            return Err(ExchangeError::Failed(message));
        }

        match from_json::<Res>(&response.body) {
            Ok(decoded) => {
                self.clear_error();
                Ok(decoded)
            }
            Err(e) => {
                let message = format!("invalid response: {e}");
                self.set_error(&message);
                Err(ExchangeError::Failed(message))
            }
        }
    }
}

#[async_trait]
impl<C: HttpClient> NetworkPort for HttpNetwork<C> {
    async fn send_operations(&self, batch: &OperationBatch) -> EngineResult<SyncResult> {
        let request = SyncRequest::from_batch(batch);
        let body = to_json(&request)?;

        let response: SyncResponse = match self
            .exchange(HttpMethod::Post, OPERATIONS_PATH, Some(body))
            .await
        {
            Ok(response) => response,
            Err(ExchangeError::Unauthorized(message)) => {
                return Err(SyncError::AuthenticationFailed(message))
            }
            Err(ExchangeError::Failed(message)) => return Ok(SyncResult::failure(message)),
        };

        let mut processed = acknowledged_ids(&response.applied_operations);
        processed.retain(|id| {
            let known = batch.contains(*id);
            if !known {
                warn!(id, batch_id = %batch.id, "server acknowledged an id outside the batch");
            }
            known
        });

        Ok(SyncResult {
            success: response.success,
            processed_operations: processed,
            sync_version: response.sync_version,
            errors: response.errors,
            conflicts: response.conflicts,
            server_operations: response
                .server_operations
                .into_iter()
                .map(|op| op.into_operation(&batch.project_id))
                .collect(),
        })
    }

    async fn get_operations(
        &self,
        project_id: &str,
        since_version: u64,
    ) -> EngineResult<SyncResult> {
        let path = format!(
            "{}?projectId={}&since={}",
            OPERATIONS_PATH,
            urlencoding::encode(project_id),
            since_version
        );

        let response: OperationsResponse = match self.exchange(HttpMethod::Get, &path, None).await
        {
            Ok(response) => response,
            Err(ExchangeError::Unauthorized(message)) => {
                return Err(SyncError::AuthenticationFailed(message))
            }
            Err(ExchangeError::Failed(message)) => return Ok(SyncResult::failure(message)),
        };

        Ok(SyncResult {
            success: response.success,
            processed_operations: Vec::new(),
            sync_version: response.sync_version,
            errors: response.errors,
            conflicts: Vec::new(),
            server_operations: response
                .operations
                .into_iter()
                .map(|op| op.into_operation(project_id))
                .collect(),
        })
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst) && self.client.is_healthy()
    }
}

/// Maps server-reported ids back to persisted operation ids.
///
/// Temporary ids and anything that is not a non-negative integer are
/// dropped; order is preserved.
pub fn acknowledged_ids(applied: &[WireId]) -> Vec<OperationId> {
    applied.iter().filter_map(WireId::as_operation_id).collect()
}

fn body_excerpt(body: &[u8]) -> String {
    const LIMIT: usize = 200;
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return "no response body".to_string();
    }
    match text.char_indices().nth(LIMIT) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer {
    /// Handles a request whose URL has been reduced to path and query.
    fn handle(&self, request: &HttpRequest) -> HttpResponse;
}

/// A loopback HTTP client that routes requests directly to a sync server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
    healthy: AtomicBool,
}

impl<S: LoopbackServer + Send + Sync> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self {
            server,
            healthy: AtomicBool::new(true),
        }
    }

    /// Simulates losing or regaining the connection.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Returns the server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

#[async_trait]
impl<S: LoopbackServer + Send + Sync> HttpClient for LoopbackClient<S> {
    async fn execute(&self, mut request: HttpRequest) -> Result<HttpResponse, String> {
        if !self.is_healthy() {
            return Err("connection refused".to_string());
        }

        // Extract path from URL
        if let Some(i) = request.url.find("/sync/") {
            request.url = request.url[i..].to_string();
        }

        Ok(self.server.handle(&request))
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// HTTP client backed by reqwest.
#[cfg(feature = "reqwest")]
pub struct ReqwestClient {
    client: reqwest::Client,
}

#[cfg(feature = "reqwest")]
impl ReqwestClient {
    /// Creates a client with a per-request timeout.
    pub fn new(timeout: std::time::Duration) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

#[cfg(feature = "reqwest")]
#[async_trait]
impl HttpClient for ReqwestClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self
                .client
                .post(&request.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json"),
        };
        if let Some(token) = &request.bearer_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| e.to_string())?;

        Ok(HttpResponse::new(status, body.to_vec()))
    }
}
