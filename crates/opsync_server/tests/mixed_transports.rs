//! HTTP and push-channel clients sharing one project.

use chrono::Utc;
use opsync_protocol::{
    to_json, BroadcastEnvelope, OperationsResponse, ServerFrame, SyncRequest, SyncResponse,
    WireId, WireOperation,
};
use opsync_server::{ServerConfig, SyncServer, OPERATIONS_ROUTE};
use serde_json::json;

fn op(id: &str, device: &str) -> WireOperation {
    WireOperation {
        id: Some(WireId::from(id)),
        op_type: "node.create".into(),
        project_id: None,
        timeline_id: "main".into(),
        layer_id: Some("base".into()),
        payload: json!({"id": id}),
        device_id: device.into(),
        timestamp: Utc::now(),
    }
}

fn post(server: &SyncServer, last: u64, ops: Vec<WireOperation>) -> SyncResponse {
    let request = SyncRequest {
        operations: ops,
        project_id: "board".into(),
        last_sync_version: last,
        device_id: "http-dev".into(),
    };
    let body = to_json(&request).unwrap();
    let reply = server.handle_http("POST", OPERATIONS_ROUTE, None, Some(&body));
    assert_eq!(reply.status, 200);
    serde_json::from_slice(&reply.body).unwrap()
}

#[tokio::test]
async fn pushed_operation_moves_http_clients_forward() {
    let server = SyncServer::new(ServerConfig::default());
    let (pusher, mut pusher_rx) = server.hub().connect("board", "alice", None).unwrap();
    let (_watcher, mut watcher_rx) = server.hub().connect("board", "bob", None).unwrap();

    let envelope = BroadcastEnvelope::new(op("temp_a", "ws-dev"), "alice", "board");
    server.hub().handle_frame(pusher, &envelope.encode().unwrap());

    let ack = ServerFrame::decode(&pusher_rx.recv().await.unwrap()).unwrap();
    assert!(matches!(ack, ServerFrame::Ack(ref a) if a.sync_version == Some(1)));
    let relay = ServerFrame::decode(&watcher_rx.recv().await.unwrap()).unwrap();
    assert!(matches!(relay, ServerFrame::Broadcast(_)));

    // An HTTP client still at version 0 is refused, catches up and retries.
    let refused = post(&server, 0, vec![op("1", "http-dev")]);
    assert!(!refused.success);
    assert_eq!(refused.sync_version, Some(1));

    let path = "/sync/operations?projectId=board&since=0";
    let reply = server.handle_http("GET", path, None, None);
    let history: OperationsResponse = serde_json::from_slice(&reply.body).unwrap();
    assert_eq!(history.operations.len(), 1);
    assert_eq!(history.operations[0].device_id, "ws-dev");

    let accepted = post(&server, 1, vec![op("1", "http-dev")]);
    assert!(accepted.success);
    assert_eq!(accepted.sync_version, Some(2));
    assert_eq!(accepted.applied_operations, vec![WireId::from("1")]);

    // HTTP writes are not relayed over the channel.
    assert!(watcher_rx.try_recv().is_err());
}

#[test]
fn redelivered_batch_is_acknowledged_once() {
    let server = SyncServer::new(ServerConfig::default());
    let first = post(&server, 0, vec![op("1", "http-dev"), op("2", "http-dev")]);
    assert_eq!(first.sync_version, Some(2));

    // The acknowledgment was lost; the client retries from the new version.
    let again = post(&server, 2, vec![op("1", "http-dev"), op("2", "http-dev")]);
    assert!(again.success);
    assert_eq!(again.sync_version, Some(2));
    assert_eq!(again.applied_operations.len(), 2);
    assert_eq!(server.operation_count("board"), 2);
}
