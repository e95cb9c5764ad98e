//! Push-channel hub.
//!
//! Each connected client gets an unbounded queue of outbound text frames.
//! An operation pushed by one client is appended to the project's oplog,
//! acknowledged to the sender and relayed to every other client of the
//! same project with the new version attached.

use crate::error::{ServerError, ServerResult};
use crate::handler::HandlerContext;
use opsync_protocol::{
    BroadcastEnvelope, OperationAck, OperationRejection, ServerFrame, OPERATION_BROADCAST,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// Identifies one connection to the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

struct Connection {
    user_id: String,
    project_id: String,
    sender: UnboundedSender<String>,
}

/// Fan-out point for push-channel clients.
pub struct ChannelHub {
    context: Arc<HandlerContext>,
    clients: RwLock<HashMap<ClientId, Connection>>,
    next_id: AtomicU64,
}

impl ChannelHub {
    /// Creates a hub over the shared handler context.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self {
            context,
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Opens a connection for `user_id` on `project_id`.
    ///
    /// When authentication is enabled the token subject replaces `user_id`.
    pub fn connect(
        &self,
        project_id: &str,
        user_id: &str,
        token: Option<&str>,
    ) -> ServerResult<(ClientId, UnboundedReceiver<String>)> {
        if project_id.is_empty() {
            return Err(ServerError::InvalidRequest("projectId is required".into()));
        }
        let subject = self.context.authorize(token)?;
        let user_id = subject.unwrap_or_else(|| user_id.to_string());

        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = unbounded_channel();
        info!(client = %id, project_id, user_id = %user_id, "channel client connected");
        self.clients.write().insert(
            id,
            Connection {
                user_id,
                project_id: project_id.to_string(),
                sender,
            },
        );
        Ok((id, receiver))
    }

    /// Closes a connection. Returns false for unknown ids.
    pub fn disconnect(&self, id: ClientId) -> bool {
        let removed = self.clients.write().remove(&id).is_some();
        if removed {
            info!(client = %id, "channel client disconnected");
        }
        removed
    }

    /// Number of open connections on a project.
    pub fn client_count(&self, project_id: &str) -> usize {
        self.clients
            .read()
            .values()
            .filter(|c| c.project_id == project_id)
            .count()
    }

    /// Handles one text frame sent by `from`.
    pub fn handle_frame(&self, from: ClientId, text: &str) {
        let Some((user_id, project_id)) = self
            .clients
            .read()
            .get(&from)
            .map(|c| (c.user_id.clone(), c.project_id.clone()))
        else {
            warn!(client = %from, "frame from unknown client");
            return;
        };

        let envelope: BroadcastEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                match correlation_id(text) {
                    Some(operation_id) => self.reject(from, operation_id, format!("invalid frame: {e}")),
                    None => warn!(client = %from, error = %e, "dropping undecodable frame"),
                }
                return;
            }
        };

        let Some(operation_id) = envelope.operation_id() else {
            warn!(client = %from, "dropping frame without operation id");
            return;
        };
        if envelope.kind != OPERATION_BROADCAST {
            self.reject(from, operation_id, format!("unknown envelope type: {}", envelope.kind));
            return;
        }
        if envelope.project_id != project_id {
            self.reject(
                from,
                operation_id,
                format!("connection is bound to project {project_id}"),
            );
            return;
        }

        let appended =
            match self
                .context
                .oplog
                .append(&project_id, vec![envelope.payload.operation], None)
            {
                Ok(appended) => appended,
                Err(e) => {
                    self.reject(from, operation_id, e.to_string());
                    return;
                }
            };

        debug!(
            client = %from,
            project_id = %project_id,
            operation_id = %operation_id,
            version = appended.version,
            "applied pushed operation"
        );
        self.send_to(
            from,
            &ServerFrame::Ack(OperationAck {
                operation_id,
                success: true,
                sync_version: Some(appended.version),
                conflicts: Vec::new(),
            }),
        );

        for operation in appended.stored {
            let mut relay = BroadcastEnvelope::new(operation, user_id.clone(), project_id.clone());
            relay.payload.sync_version = Some(appended.version);
            self.broadcast(from, &project_id, &ServerFrame::Broadcast(relay));
        }
    }

    fn reject(&self, to: ClientId, operation_id: String, error: String) {
        debug!(client = %to, operation_id = %operation_id, error = %error, "rejecting pushed operation");
        self.send_to(
            to,
            &ServerFrame::Rejection(OperationRejection {
                operation_id,
                error,
            }),
        );
    }

    fn send_to(&self, to: ClientId, frame: &ServerFrame) {
        let Some(text) = encode(frame) else { return };
        let delivered = self
            .clients
            .read()
            .get(&to)
            .map(|c| c.sender.send(text).is_ok());
        if delivered == Some(false) {
            self.disconnect(to);
        }
    }

    fn broadcast(&self, from: ClientId, project_id: &str, frame: &ServerFrame) {
        let Some(text) = encode(frame) else { return };
        let mut closed = Vec::new();
        for (id, client) in self.clients.read().iter() {
            if *id == from || client.project_id != project_id {
                continue;
            }
            if client.sender.send(text.clone()).is_err() {
                closed.push(*id);
            }
        }
        for id in closed {
            self.disconnect(id);
        }
    }
}

fn encode(frame: &ServerFrame) -> Option<String> {
    match frame.encode() {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(error = %e, "failed to encode channel frame");
            None
        }
    }
}

/// Best-effort lookup of `payload.operation.id` in an undecodable frame.
fn correlation_id(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    match value.pointer("/payload/operation/id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::oplog::ServerOplog;
    use chrono::Utc;
    use opsync_protocol::{WireId, WireOperation};
    use serde_json::json;

    fn hub(config: ServerConfig) -> ChannelHub {
        ChannelHub::new(Arc::new(HandlerContext::new(
            config,
            Arc::new(ServerOplog::new()),
        )))
    }

    fn envelope(id: &str, project: &str, device: &str) -> String {
        let op = WireOperation {
            id: Some(WireId::from(id)),
            op_type: "node.create".into(),
            project_id: None,
            timeline_id: "main".into(),
            layer_id: Some("base".into()),
            payload: json!({"n": 1}),
            device_id: device.into(),
            timestamp: Utc::now(),
        };
        BroadcastEnvelope::new(op, "user", project).encode().unwrap()
    }

    fn next_frame(rx: &mut UnboundedReceiver<String>) -> ServerFrame {
        ServerFrame::decode(&rx.try_recv().unwrap()).unwrap()
    }

    #[test]
    fn push_is_acked_and_relayed() {
        let hub = hub(ServerConfig::default());
        let (a, mut rx_a) = hub.connect("p", "alice", None).unwrap();
        let (_b, mut rx_b) = hub.connect("p", "bob", None).unwrap();
        let (_c, mut rx_c) = hub.connect("q", "carol", None).unwrap();

        hub.handle_frame(a, &envelope("temp_1", "p", "dev-a"));

        match next_frame(&mut rx_a) {
            ServerFrame::Ack(ack) => {
                assert_eq!(ack.operation_id, "temp_1");
                assert!(ack.success);
                assert_eq!(ack.sync_version, Some(1));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        match next_frame(&mut rx_b) {
            ServerFrame::Broadcast(env) => {
                assert_eq!(env.payload.sync_version, Some(1));
                assert_eq!(env.payload.operation.device_id, "dev-a");
                assert_eq!(env.payload.operation.project_id.as_deref(), Some("p"));
                assert_eq!(env.user_id, "alice");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(rx_a.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn wrong_project_is_rejected() {
        let hub = hub(ServerConfig::default());
        let (a, mut rx_a) = hub.connect("p", "alice", None).unwrap();

        hub.handle_frame(a, &envelope("5", "other", "dev-a"));
        match next_frame(&mut rx_a) {
            ServerFrame::Rejection(rejection) => assert_eq!(rejection.operation_id, "5"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn malformed_frame_with_id_is_rejected() {
        let hub = hub(ServerConfig::default());
        let (a, mut rx_a) = hub.connect("p", "alice", None).unwrap();

        hub.handle_frame(a, r#"{"payload":{"operation":{"id":9}}}"#);
        match next_frame(&mut rx_a) {
            ServerFrame::Rejection(rejection) => assert_eq!(rejection.operation_id, "9"),
            other => panic!("unexpected frame: {other:?}"),
        }

        hub.handle_frame(a, "not json");
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn connect_requires_token_when_auth_enabled() {
        let hub = hub(ServerConfig::default().with_auth(b"secret".to_vec()));
        assert!(hub.connect("p", "alice", None).is_err());

        let token = hub
            .context
            .validator()
            .unwrap()
            .create_token("alice")
            .unwrap();
        assert!(hub.connect("p", "ignored", Some(&token)).is_ok());
        assert_eq!(hub.client_count("p"), 1);
    }

    #[test]
    fn dropped_receiver_disconnects_client() {
        let hub = hub(ServerConfig::default());
        let (a, _rx_a) = hub.connect("p", "alice", None).unwrap();
        let (_b, rx_b) = hub.connect("p", "bob", None).unwrap();
        drop(rx_b);

        hub.handle_frame(a, &envelope("1", "p", "dev-a"));
        assert_eq!(hub.client_count("p"), 1);
        assert!(hub.disconnect(a));
        assert!(!hub.disconnect(a));
    }
}
