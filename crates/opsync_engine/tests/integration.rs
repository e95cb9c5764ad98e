//! End-to-end sync against the reference server.

use opsync_engine::{
    ChannelFrameSink, HttpNetwork, HttpRequest, HttpResponse, LoopbackClient, LoopbackServer,
    NetworkPort, PushChannelNetwork, QueueStoragePort, SyncConfig, SyncEvent, SyncEventKind,
    SyncOrchestrator, SyncStatus,
};
use opsync_protocol::{Operation, OperationId};
use opsync_server::{ServerConfig, SyncServer};
use opsync_storage::{InMemoryStore, OperationQueue, VersionStore};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const PROJECT: &str = "shared-board";

/// Routes loopback requests into the in-process server.
#[derive(Clone)]
struct ServerAdapter(Arc<SyncServer>);

impl LoopbackServer for ServerAdapter {
    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        let reply = self.0.handle_http(
            request.method.as_str(),
            &request.url,
            request.bearer_token.as_deref(),
            request.body.as_deref(),
        );
        HttpResponse::new(reply.status, reply.body)
    }
}

type HttpPort = HttpNetwork<LoopbackClient<ServerAdapter>>;

struct Client {
    store: Arc<InMemoryStore>,
    orchestrator: SyncOrchestrator,
    received: Arc<Mutex<Vec<(Vec<Operation>, Option<u64>)>>>,
}

impl Client {
    fn enqueue(&self, count: usize) -> Vec<OperationId> {
        (0..count)
            .map(|i| {
                let op = Operation::new(
                    "shape.move",
                    PROJECT,
                    "main",
                    json!({ "seq": i, "from": self.orchestrator.device_id() }),
                    self.orchestrator.device_id(),
                );
                self.store.push(&op).unwrap()
            })
            .collect()
    }

    fn received_operations(&self) -> Vec<Operation> {
        self.received
            .lock()
            .iter()
            .flat_map(|(ops, _)| ops.clone())
            .collect()
    }
}

fn http_port(server: &Arc<SyncServer>, token: Option<String>) -> Arc<HttpPort> {
    let client = LoopbackClient::new(ServerAdapter(Arc::clone(server)));
    let network = HttpNetwork::new("http://sync.test/", client);
    network.set_bearer_token(token);
    Arc::new(network)
}

fn client(device: &str, network: Arc<dyn NetworkPort>) -> Client {
    let store = Arc::new(InMemoryStore::new());
    let orchestrator = SyncOrchestrator::builder(PROJECT, device)
        .config(SyncConfig::default().with_batch_size(10))
        .storage(Arc::new(QueueStoragePort::new(store.clone(), PROJECT)))
        .network(network)
        .versions(store.clone())
        .build()
        .unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    orchestrator.on(SyncEventKind::ServerOperationsReceived, move |event| {
        if let SyncEvent::ServerOperationsReceived {
            operations,
            version,
        } = event
        {
            sink.lock().push((operations.clone(), *version));
        }
    });
    orchestrator.start();

    Client {
        store,
        orchestrator,
        received,
    }
}

#[tokio::test]
async fn clients_converge_through_catch_up() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let alice = client("device-alice", http_port(&server, None));
    let bob = client("device-bob", http_port(&server, None));

    alice.enqueue(2);
    assert!(alice.orchestrator.force_sync().await);
    assert_eq!(alice.orchestrator.last_sync_version(), 2);
    assert_eq!(alice.store.count(PROJECT).unwrap(), 0);
    assert_eq!(server.version(PROJECT), 2);

    // Bob is still at version 0: refused, catches up, retries the same batch.
    bob.enqueue(1);
    assert!(bob.orchestrator.force_sync().await);

    assert_eq!(bob.store.count(PROJECT).unwrap(), 0);
    assert_eq!(bob.orchestrator.last_sync_version(), 3);
    assert_eq!(bob.store.load_version(PROJECT).unwrap(), Some(3));
    assert_eq!(server.version(PROJECT), 3);

    let fetched = bob.received_operations();
    assert_eq!(fetched.len(), 2);
    assert!(fetched.iter().all(|op| op.device_id == "device-alice"));
    assert!(fetched.iter().all(|op| op.project_id == PROJECT));
    assert_eq!(bob.received.lock()[0].1, Some(2));

    let stats = bob.orchestrator.stats();
    assert_eq!(stats.successful_syncs, 1);
    assert_eq!(stats.failed_syncs, 0);
    assert_eq!(stats.current_retry_count, 0);
    assert_eq!(bob.orchestrator.status(), SyncStatus::Running);
}

#[tokio::test]
async fn rejection_can_carry_missing_operations() {
    let server = Arc::new(SyncServer::new(
        ServerConfig::default().with_server_operations(true),
    ));
    let alice = client("device-alice", http_port(&server, None));
    let bob = client("device-bob", http_port(&server, None));

    alice.enqueue(3);
    alice.orchestrator.force_sync().await;

    bob.enqueue(2);
    bob.orchestrator.force_sync().await;

    assert_eq!(bob.store.count(PROJECT).unwrap(), 0);
    assert_eq!(bob.orchestrator.last_sync_version(), 5);
    let received = bob.received.lock().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0.len(), 3);
    assert_eq!(received[0].1, Some(3));
}

#[tokio::test]
async fn offline_client_keeps_its_queue() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let network = http_port(&server, None);
    let alice = client("device-alice", network.clone());

    alice.enqueue(2);
    network.set_online(false);
    alice.orchestrator.force_sync().await;
    assert_eq!(alice.store.count(PROJECT).unwrap(), 2);
    assert_eq!(server.operation_count(PROJECT), 0);

    network.set_online(true);
    alice.orchestrator.force_sync().await;
    assert_eq!(alice.store.count(PROJECT).unwrap(), 0);
    assert_eq!(server.operation_count(PROJECT), 2);
}

#[tokio::test]
async fn bad_token_stops_sync() {
    let server = Arc::new(SyncServer::new(
        ServerConfig::default().with_auth(b"server-secret".to_vec()),
    ));
    let failures = Arc::new(Mutex::new(Vec::new()));

    let mallory = client("device-mallory", http_port(&server, Some("forged.1.00".into())));
    let sink = Arc::clone(&failures);
    mallory.orchestrator.on(SyncEventKind::SyncFailed, move |event| {
        if let SyncEvent::SyncFailed { reason, .. } = event {
            sink.lock().push(reason.clone());
        }
    });

    mallory.enqueue(1);
    mallory.orchestrator.force_sync().await;

    assert_eq!(mallory.orchestrator.status(), SyncStatus::Stopped);
    assert_eq!(mallory.store.count(PROJECT).unwrap(), 1);
    assert_eq!(failures.lock().len(), 1);
    assert!(failures.lock()[0].contains("Sign in again"));

    let token = server.issue_token("alice").unwrap().unwrap();
    let alice = client("device-alice", http_port(&server, Some(token)));
    alice.enqueue(1);
    alice.orchestrator.force_sync().await;
    assert_eq!(alice.store.count(PROJECT).unwrap(), 0);
    assert_eq!(server.version(PROJECT), 1);
}

/// Wires a push-channel port to the server hub through two pump tasks.
fn push_port(
    server: &Arc<SyncServer>,
    user: &str,
    device: &str,
) -> Arc<PushChannelNetwork> {
    let (client_id, from_server) = server.hub().connect(PROJECT, user, None).unwrap();
    let (sink, mut to_server) = ChannelFrameSink::new();

    let port = Arc::new(
        PushChannelNetwork::new(Arc::new(sink), user, device)
            .with_config(&SyncConfig::default().with_operation_timeout(Duration::from_secs(5)))
            .with_catch_up(http_port(server, None)),
    );
    port.spawn_reader(from_server);

    let hub_server = Arc::clone(server);
    tokio::spawn(async move {
        while let Some(frame) = to_server.recv().await {
            hub_server.hub().handle_frame(client_id, &frame);
        }
        hub_server.hub().disconnect(client_id);
    });

    port
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn push_channel_relays_between_collaborators() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let alice = client("device-alice", push_port(&server, "alice", "device-alice"));
    let bob = client("device-bob", push_port(&server, "bob", "device-bob"));

    alice.enqueue(2);
    assert!(alice.orchestrator.force_sync().await);
    assert_eq!(alice.store.count(PROJECT).unwrap(), 0);
    assert_eq!(alice.orchestrator.last_sync_version(), 2);

    wait_for(|| bob.received_operations().len() == 2).await;
    wait_for(|| bob.orchestrator.last_sync_version() == 2).await;
    assert!(bob
        .received_operations()
        .iter()
        .all(|op| op.device_id == "device-alice"));

    // Alice never sees her own operations come back.
    assert!(alice.received_operations().is_empty());

    bob.enqueue(1);
    assert!(bob.orchestrator.force_sync().await);
    assert_eq!(bob.orchestrator.last_sync_version(), 3);
    wait_for(|| alice.orchestrator.last_sync_version() == 3).await;
    assert_eq!(server.operation_count(PROJECT), 3);
}

#[tokio::test]
async fn push_channel_client_catches_up_over_http() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()));

    // History written before Bob connected.
    let alice = client("device-alice", http_port(&server, None));
    alice.enqueue(2);
    alice.orchestrator.force_sync().await;

    let port = push_port(&server, "bob", "device-bob");
    let fetched = port.get_operations(PROJECT, 0).await.unwrap();
    assert!(fetched.success);
    assert_eq!(fetched.sync_version, Some(2));
    assert_eq!(fetched.server_operations.len(), 2);
}
