//! End-to-end tests over real sockets.
//!
//! Each test starts a real server on a free port and drives it with raw
//! WebSocket clients speaking the JSON wire protocol, verifying the
//! full pipeline: identification, subscriptions, actions, CRDT sync,
//! privacy filtering, durability, and rate limiting.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use tandem_core::{
    apply_list_action, DocHandle, ListAction, ListEntry, SyncState, Visibility,
};
use tandem_server::{ServerConfig, SyncServer};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server over `data_dir`, return its port and a handle for
/// aborting it (simulated shutdown).
async fn start_server(data_dir: &Path) -> (u16, Arc<SyncServer>, JoinHandle<()>) {
    let port = free_port().await;
    let config = ServerConfig::for_testing(format!("127.0.0.1:{port}"), data_dir);
    let server = Arc::new(SyncServer::new(config).unwrap());
    let runner = server.clone();
    let handle = tokio::spawn(async move {
        let _ = runner.run().await;
    });
    // Give the server time to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, server, handle)
}

async fn connect(port: u16, username: &str) -> Ws {
    let url = format!("ws://127.0.0.1:{port}/ws?username={username}");
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn send_json(ws: &mut Ws, frame: Value) {
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
}

async fn recv_frame(ws: &mut Ws) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Read frames until one matches, panicking after a bounded number.
async fn recv_until(ws: &mut Ws, pred: impl Fn(&Value) -> bool) -> Value {
    for _ in 0..64 {
        let frame = recv_frame(ws).await;
        if pred(&frame) {
            return frame;
        }
    }
    panic!("expected frame never arrived");
}

fn is_snapshot_of(frame: &Value, doc: &Value) -> bool {
    frame["type"] == "snapshot" && frame["doc"] == *doc
}

/// Connect and drain the welcome plus the two initial snapshots.
/// Returns the connection and the initial registry snapshot state.
async fn connect_ready(port: u16, username: &str) -> (Ws, Value) {
    let mut ws = connect(port, username).await;
    let welcome = recv_frame(&mut ws).await;
    assert_eq!(welcome["type"], "welcome");
    assert_eq!(welcome["userId"], format!("user-{username}"));
    let registry = recv_until(&mut ws, |f| is_snapshot_of(f, &json!("registry"))).await;
    recv_until(&mut ws, |f| is_snapshot_of(f, &json!("bulletins"))).await;
    (ws, registry["state"].clone())
}

fn create_list_frame(name: &str, visibility: &str) -> Value {
    json!({
        "type": "registry_action",
        "action": {"type": "create_list", "name": name, "visibility": visibility}
    })
}

fn add_bulletin_frame(text: &str, visibility: &str) -> Value {
    json!({
        "type": "bulletin_action",
        "action": {"type": "add_bulletin", "text": text, "visibility": visibility}
    })
}

#[tokio::test]
async fn test_e1_public_list_visible_to_everyone() {
    let dir = tempfile::tempdir().unwrap();
    let (port, _server, _handle) = start_server(dir.path()).await;

    let (mut alice, _) = connect_ready(port, "alice").await;
    let (mut bob, _) = connect_ready(port, "bob").await;

    send_json(&mut alice, create_list_frame("Groceries", "public")).await;

    for ws in [&mut alice, &mut bob] {
        let snap = recv_until(ws, |f| {
            is_snapshot_of(f, &json!("registry")) && f["state"]["lists"][0].is_object()
        })
        .await;
        let lists = snap["state"]["lists"].as_array().unwrap();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0]["name"], "Groceries");
        assert_eq!(lists[0]["ownerId"], "user-alice");
        assert_eq!(lists[0]["visibility"], "public");
    }
}

#[tokio::test]
async fn test_e2_private_list_invisible_and_subscribe_forbidden() {
    let dir = tempfile::tempdir().unwrap();
    let (port, _server, _handle) = start_server(dir.path()).await;

    let (mut alice, _) = connect_ready(port, "alice").await;
    let (mut bob, _) = connect_ready(port, "bob").await;

    send_json(&mut alice, create_list_frame("Diary", "private")).await;

    let snap = recv_until(&mut alice, |f| {
        is_snapshot_of(f, &json!("registry")) && f["state"]["lists"][0].is_object()
    })
    .await;
    let list_id = snap["state"]["lists"][0]["id"].as_str().unwrap().to_string();

    // Bob gets the broadcast too, filtered down to nothing.
    let snap = recv_until(&mut bob, |f| is_snapshot_of(f, &json!("registry"))).await;
    assert!(snap["state"]["lists"].as_array().unwrap().is_empty());

    send_json(&mut bob, json!({"type": "subscribe", "doc": {"listId": list_id}})).await;
    let err = recv_until(&mut bob, |f| f["type"] == "error").await;
    assert_eq!(err["code"], "FORBIDDEN");
}

#[tokio::test]
async fn test_e3_collaborative_item_edit_via_sync() {
    let dir = tempfile::tempdir().unwrap();
    let (port, _server, _handle) = start_server(dir.path()).await;

    // Alice creates a public list with one item.
    let (mut alice, _) = connect_ready(port, "alice").await;
    send_json(&mut alice, create_list_frame("Groceries", "public")).await;
    let snap = recv_until(&mut alice, |f| {
        is_snapshot_of(f, &json!("registry")) && f["state"]["lists"][0].is_object()
    })
    .await;
    let list_id = Uuid::parse_str(snap["state"]["lists"][0]["id"].as_str().unwrap()).unwrap();
    let doc_sel = json!({"listId": list_id});

    send_json(&mut alice, json!({"type": "subscribe", "doc": doc_sel})).await;
    recv_until(&mut alice, |f| is_snapshot_of(f, &doc_sel)).await;

    send_json(
        &mut alice,
        json!({
            "type": "list_action",
            "listId": list_id,
            "action": {"type": "add_item", "label": "Milk"}
        }),
    )
    .await;
    recv_until(&mut alice, |f| {
        is_snapshot_of(f, &doc_sel) && f["state"]["items"][0]["label"] == "Milk"
    })
    .await;

    // Bob subscribes and mirrors the list into a local replica.
    let (mut bob, _) = connect_ready(port, "bob").await;
    send_json(&mut bob, json!({"type": "subscribe", "doc": doc_sel})).await;
    let snap = recv_until(&mut bob, |f| is_snapshot_of(f, &doc_sel)).await;
    let item_id = Uuid::parse_str(snap["state"]["items"][0]["id"].as_str().unwrap()).unwrap();

    let replica = DocHandle::new_list(list_id);
    let mut replica_state = SyncState::new();
    let sync = recv_until(&mut bob, |f| f["type"] == "sync" && f["doc"] == doc_sel).await;
    let payload = base64_decode(sync["data"].as_str().unwrap());
    replica.receive_sync(&mut replica_state, &payload).unwrap();

    // Bob renames the item locally and sends the delta as a sync frame.
    let entry = ListEntry {
        id: list_id,
        owner_id: "user-alice".to_string(),
        name: "Groceries".to_string(),
        created_at: String::new(),
        updated_at: None,
        visibility: Visibility::Public,
        collaborators: Vec::new(),
        archived: false,
    };
    let before = replica.state_vector();
    apply_list_action(
        &replica,
        &entry,
        "user-bob",
        &ListAction::UpdateItem {
            item_id,
            label: "Milk 2%".to_string(),
        },
    )
    .unwrap();
    let delta = replica.sync_update_since(&before);
    send_json(
        &mut bob,
        json!({"type": "sync", "doc": doc_sel, "data": base64_encode(&delta)}),
    )
    .await;

    // Alice sees the merged rename: snapshot first, then a sync frame.
    let snap = recv_until(&mut alice, |f| {
        is_snapshot_of(f, &doc_sel) && f["state"]["items"][0]["label"] == "Milk 2%"
    })
    .await;
    assert_eq!(snap["state"]["items"][0]["id"], item_id.to_string());
    recv_until(&mut alice, |f| f["type"] == "sync" && f["doc"] == doc_sel).await;
}

#[tokio::test]
async fn test_e4_bulletin_privacy() {
    let dir = tempfile::tempdir().unwrap();
    let (port, _server, _handle) = start_server(dir.path()).await;

    let (mut alice, _) = connect_ready(port, "alice").await;
    let (mut bob, _) = connect_ready(port, "bob").await;

    send_json(&mut alice, add_bulletin_frame("hi", "public")).await;
    send_json(&mut alice, add_bulletin_frame("secret", "private")).await;

    let snap = recv_until(&mut alice, |f| {
        is_snapshot_of(f, &json!("bulletins"))
            && f["state"]["bulletins"].as_array().unwrap().len() == 2
    })
    .await;
    let texts: Vec<&str> = snap["state"]["bulletins"]
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["text"].as_str().unwrap())
        .collect();
    assert!(texts.contains(&"hi") && texts.contains(&"secret"));

    // Bob's second bulletins broadcast still carries only the public one.
    recv_until(&mut bob, |f| is_snapshot_of(f, &json!("bulletins"))).await;
    let snap = recv_until(&mut bob, |f| is_snapshot_of(f, &json!("bulletins"))).await;
    let bulletins = snap["state"]["bulletins"].as_array().unwrap();
    assert_eq!(bulletins.len(), 1);
    assert_eq!(bulletins[0]["text"], "hi");
}

#[tokio::test]
async fn test_e5_restart_durability() {
    let dir = tempfile::tempdir().unwrap();

    let (port, server, handle) = start_server(dir.path()).await;
    let (mut alice, _) = connect_ready(port, "alice").await;
    send_json(&mut alice, create_list_frame("Groceries", "public")).await;
    let snap = recv_until(&mut alice, |f| {
        is_snapshot_of(f, &json!("registry")) && f["state"]["lists"][0].is_object()
    })
    .await;
    let list_id = snap["state"]["lists"][0]["id"].as_str().unwrap().to_string();
    send_json(
        &mut alice,
        json!({
            "type": "list_action",
            "listId": list_id,
            "action": {"type": "add_item", "label": "Milk", "quantity": "2"}
        }),
    )
    .await;
    // Wait for the action to land before flushing.
    recv_until(&mut alice, |f| {
        is_snapshot_of(f, &json!("registry")) && f["state"]["lists"][0]["updatedAt"].is_string()
    })
    .await;

    assert!(server.flush_all().await >= 1);
    drop(alice);
    handle.abort();

    // A new server over the same data dir serves the same state.
    let (port2, _server2, _handle2) = start_server(dir.path()).await;
    let (mut carol, registry) = connect_ready(port2, "carol").await;
    let lists = registry["lists"].as_array().unwrap();
    assert_eq!(lists.len(), 1);
    assert_eq!(lists[0]["name"], "Groceries");

    send_json(&mut carol, json!({"type": "subscribe", "doc": {"listId": list_id}})).await;
    let snap = recv_until(&mut carol, |f| {
        is_snapshot_of(f, &json!({"listId": list_id}))
    })
    .await;
    let items = snap["state"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["label"], "Milk");
    assert_eq!(items[0]["quantity"], "2");
}

#[tokio::test]
async fn test_e6_rate_limit_trips_on_burst() {
    let dir = tempfile::tempdir().unwrap();
    let (port, server, _handle) = start_server(dir.path()).await;

    let (mut alice, _) = connect_ready(port, "alice").await;
    for i in 0..50 {
        send_json(&mut alice, add_bulletin_frame(&format!("post {i}"), "public")).await;
    }

    let err = recv_until(&mut alice, |f| f["type"] == "error").await;
    assert_eq!(err["code"], "RATE_LIMITED");

    // The burst capacity bounds how many posts landed.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let dump = server.debug_state().await;
    let count = dump["bulletins"].as_array().unwrap().len();
    assert!((40..50).contains(&count), "got {count} bulletins");
}

#[tokio::test]
async fn test_registry_sync_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (port, _server, _handle) = start_server(dir.path()).await;

    let (mut alice, _) = connect_ready(port, "alice").await;
    send_json(&mut alice, json!({"type": "sync", "doc": "registry", "data": ""})).await;
    let err = recv_until(&mut alice, |f| f["type"] == "error").await;
    assert_eq!(err["code"], "BAD_REQUEST");
    assert!(err["message"].as_str().unwrap().contains("registry sync"));
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_open() {
    let dir = tempfile::tempdir().unwrap();
    let (port, _server, _handle) = start_server(dir.path()).await;

    let (mut alice, _) = connect_ready(port, "alice").await;
    alice
        .send(Message::Text("this is not json".to_string().into()))
        .await
        .unwrap();
    let err = recv_frame(&mut alice).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "BAD_REQUEST");

    // Still usable afterwards.
    send_json(&mut alice, add_bulletin_frame("still here", "public")).await;
    recv_until(&mut alice, |f| {
        is_snapshot_of(f, &json!("bulletins"))
            && f["state"]["bulletins"][0]["text"] == "still here"
    })
    .await;
}

#[tokio::test]
async fn test_healthz_and_debug_state_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let (port, _server, _handle) = start_server(dir.path()).await;

    let body = http_get(port, "/healthz").await;
    assert!(body.contains("200 OK"), "got: {body}");
    assert!(body.contains("{\"ok\":true}"));

    let body = http_get(port, "/debug/state").await;
    assert!(body.contains("200 OK"));
    assert!(body.contains("\"registry\""));

    let body = http_get(port, "/nowhere").await;
    assert!(body.contains("404"));
}

async fn http_get(port: u16, path: &str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut response = Vec::new();
    timeout(Duration::from_secs(3), stream.read_to_end(&mut response))
        .await
        .expect("timed out reading response")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.encode(bytes)
}

fn base64_decode(data: &str) -> Vec<u8> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.decode(data).unwrap()
}
