//! Per-connection session handling and broadcast fan-out.
//!
//! Every inbound frame is handled under the single server-state lock:
//! parse, charge the rate bucket (in the socket task), dispatch here,
//! and enqueue any resulting frames onto per-connection outboxes. The
//! writer task behind each outbox drains onto the socket outside the
//! lock, so a slow peer never stalls a mutation.
//!
//! Broadcast rule: after any mutation of a document, every subscriber
//! receives a privacy-filtered snapshot followed by the outbound sync
//! loop run to quiescence, in that order.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use tandem_core::snapshot::registry_entries;
use tandem_core::{
    access, apply_bulletin_action, apply_list_action, apply_registry_action, project_bulletins,
    project_list, project_registry, read_entry, touch_entry, ActionError, BulletinAction,
    DocHandle, DocKey, ListAction, ListEntry, RegistryAction, RegistryEffect, SyncState,
};

use crate::docs::DocumentRegistry;
use crate::protocol::{decode_sync_data, encode_sync_data, ClientFrame, ErrorCode, ServerFrame};
use crate::server::ServerStats;

/// One live connection: identity, subscriptions, and the send queue
/// drained by its writer task.
pub(crate) struct ConnEntry {
    pub user_id: String,
    pub subs: HashMap<DocKey, SyncState>,
    pub outbox: mpsc::UnboundedSender<Message>,
}

impl ConnEntry {
    fn send(&self, frame: &ServerFrame) {
        match serde_json::to_string(frame) {
            Ok(json) => {
                // A closed outbox just means the writer task is gone;
                // the reader side tears the connection down.
                let _ = self.outbox.send(Message::Text(json.into()));
            }
            Err(e) => log::error!("failed to encode server frame: {e}"),
        }
    }
}

/// Everything the state lock guards: documents, dirty set, connection
/// table, counters.
pub(crate) struct ServerState {
    pub docs: DocumentRegistry,
    pub conns: HashMap<u64, ConnEntry>,
    pub stats: ServerStats,
}

impl ServerState {
    pub fn new(docs: DocumentRegistry) -> Self {
        Self {
            docs,
            conns: HashMap::new(),
            stats: ServerStats::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Identity

/// Derive the user id for a new connection.
///
/// A valid `username` query parameter wins; a bearer token hashes to a
/// stable pseudonym; anything else is anonymous.
pub(crate) fn derive_user_id(query: Option<&str>, bearer: Option<&str>) -> String {
    if let Some(name) = query.and_then(username_from_query) {
        return format!("user-{name}");
    }
    if let Some(token) = bearer {
        let digest = Sha256::digest(token.as_bytes());
        return format!("user-{}", short_hex(&digest));
    }
    format!("anon-{}", &Uuid::new_v4().simple().to_string()[..8])
}

fn username_from_query(query: &str) -> Option<&str> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("username="))
        .filter(|name| valid_username(name))
}

fn valid_username(name: &str) -> bool {
    (1..=32).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn short_hex(bytes: &[u8]) -> String {
    bytes.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Connection lifecycle

/// Register a connection: welcome frame, then auto-subscribe to the
/// registry and the bulletin board with initial snapshots.
pub(crate) fn handle_connect(
    state: &mut ServerState,
    conn_id: u64,
    user_id: String,
    outbox: mpsc::UnboundedSender<Message>,
) {
    state.conns.insert(
        conn_id,
        ConnEntry {
            user_id: user_id.clone(),
            subs: HashMap::new(),
            outbox,
        },
    );
    state.stats.total_connections += 1;
    state.stats.active_connections += 1;

    if let Some(conn) = state.conns.get(&conn_id) {
        conn.send(&ServerFrame::Welcome { user_id });
    }
    subscribe(state, conn_id, DocKey::Registry);
    subscribe(state, conn_id, DocKey::Bulletins);
}

/// Release a connection and all of its subscriptions.
pub(crate) fn handle_disconnect(state: &mut ServerState, conn_id: u64) {
    if state.conns.remove(&conn_id).is_some() {
        state.stats.active_connections = state.stats.active_connections.saturating_sub(1);
    }
}

// ---------------------------------------------------------------------------
// Frame dispatch

pub(crate) fn handle_frame(state: &mut ServerState, conn_id: u64, frame: ClientFrame) {
    match frame {
        ClientFrame::Hello { client_version } => {
            log::debug!("conn {conn_id}: hello from client version {client_version}");
        }
        ClientFrame::Subscribe { doc } => subscribe(state, conn_id, doc),
        ClientFrame::Unsubscribe { doc } => {
            if let Some(conn) = state.conns.get_mut(&conn_id) {
                conn.subs.remove(&doc);
            }
        }
        ClientFrame::RegistryAction { action } => registry_action(state, conn_id, &action),
        ClientFrame::ListAction { list_id, action } => {
            list_action(state, conn_id, list_id, &action)
        }
        ClientFrame::BulletinAction { action } => bulletin_action(state, conn_id, &action),
        ClientFrame::Sync { doc, data } => sync_frame(state, conn_id, doc, &data),
        ClientFrame::RequestFullState { doc } => request_full_state(state, conn_id, doc),
    }
}

fn user_of(state: &ServerState, conn_id: u64) -> Option<String> {
    state.conns.get(&conn_id).map(|c| c.user_id.clone())
}

pub(crate) fn send_error(
    state: &ServerState,
    conn_id: u64,
    code: ErrorCode,
    message: impl Into<String>,
) {
    if let Some(conn) = state.conns.get(&conn_id) {
        conn.send(&ServerFrame::error(code, message));
    }
}

fn send_action_error(state: &ServerState, conn_id: u64, err: ActionError) {
    let code = match err {
        ActionError::BadRequest(_) => ErrorCode::BadRequest,
        ActionError::Forbidden(_) => ErrorCode::Forbidden,
        ActionError::NotFound(_) => ErrorCode::NotFound,
    };
    send_error(state, conn_id, code, err.to_string());
}

/// Load a document, reporting failure to the requesting connection.
fn load_doc(state: &mut ServerState, conn_id: u64, key: DocKey) -> Option<DocHandle> {
    match state.docs.get_or_load(key) {
        Ok(doc) => Some(doc),
        Err(e) => {
            log::error!("failed to load {key}: {e}");
            send_error(state, conn_id, ErrorCode::BadRequest, "failed to load document");
            None
        }
    }
}

fn snapshot_frame(doc: &DocHandle, key: DocKey, user_id: &str) -> ServerFrame {
    let state = match key {
        DocKey::Registry => serde_json::to_value(project_registry(doc, user_id)),
        DocKey::Bulletins => serde_json::to_value(project_bulletins(doc, user_id)),
        DocKey::List(_) => serde_json::to_value(project_list(doc)),
    }
    .unwrap_or(serde_json::Value::Null);
    ServerFrame::Snapshot { doc: key, state }
}

/// Run the outbound sync loop for one subscription until quiescent.
fn run_outbound(doc: &DocHandle, conn: &mut ConnEntry, key: &DocKey) {
    loop {
        let payload = match conn.subs.get_mut(key) {
            Some(sync) => doc.generate_sync(sync),
            None => None,
        };
        match payload {
            Some(bytes) => conn.send(&ServerFrame::Sync {
                doc: *key,
                data: encode_sync_data(&bytes),
            }),
            None => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriptions

fn subscribe(state: &mut ServerState, conn_id: u64, key: DocKey) {
    let Some(user_id) = user_of(state, conn_id) else {
        return;
    };

    // Visibility is enforced here, at the subscription boundary; the
    // sync path afterwards streams the authoritative document.
    if let DocKey::List(list_id) = key {
        let Some(registry) = load_doc(state, conn_id, DocKey::Registry) else {
            return;
        };
        match read_entry(&registry, &list_id) {
            None => {
                send_error(
                    state,
                    conn_id,
                    ErrorCode::NotFound,
                    format!("list {list_id} not found"),
                );
                return;
            }
            Some(entry) if !access::visible_to(&entry, &user_id) => {
                send_error(state, conn_id, ErrorCode::Forbidden, "list is not visible");
                return;
            }
            Some(_) => {}
        }
    }

    let Some(doc) = load_doc(state, conn_id, key) else {
        return;
    };
    let Some(conn) = state.conns.get_mut(&conn_id) else {
        return;
    };
    conn.subs.insert(key, SyncState::new());
    conn.send(&snapshot_frame(&doc, key, &user_id));
    if key.sync_enabled() {
        run_outbound(&doc, conn, &key);
    }
}

/// Drop list subscriptions whose entry vanished or whose visibility no
/// longer admits the subscriber. Run after every registry mutation.
fn prune_list_subscriptions(state: &mut ServerState) {
    let Ok(registry) = state.docs.get_or_load(DocKey::Registry) else {
        return;
    };
    let entries: HashMap<Uuid, ListEntry> = registry_entries(&registry)
        .into_iter()
        .map(|e| (e.id, e))
        .collect();
    for conn in state.conns.values_mut() {
        let user_id = conn.user_id.clone();
        conn.subs.retain(|key, _| match key {
            DocKey::List(id) => entries
                .get(id)
                .is_some_and(|e| access::visible_to(e, &user_id)),
            _ => true,
        });
    }
}

// ---------------------------------------------------------------------------
// Broadcast

/// Fan a mutated document out to its subscribers: privacy-filtered
/// snapshot, then the outbound sync loop, per connection.
pub(crate) fn broadcast_document(state: &mut ServerState, key: DocKey) {
    let doc = match state.docs.get_or_load(key) {
        Ok(doc) => doc,
        Err(e) => {
            log::error!("broadcast of {key} skipped, load failed: {e}");
            return;
        }
    };
    let entry = match key {
        DocKey::List(list_id) => match state.docs.get_or_load(DocKey::Registry) {
            Ok(registry) => read_entry(&registry, &list_id),
            Err(e) => {
                log::error!("broadcast of {key} skipped, registry load failed: {e}");
                return;
            }
        },
        _ => None,
    };

    for conn in state.conns.values_mut() {
        if !conn.subs.contains_key(&key) {
            continue;
        }
        if matches!(key, DocKey::List(_)) {
            let visible = entry
                .as_ref()
                .is_some_and(|e| access::visible_to(e, &conn.user_id));
            if !visible {
                conn.subs.remove(&key);
                continue;
            }
        }
        conn.send(&snapshot_frame(&doc, key, &conn.user_id));
        if key.sync_enabled() {
            run_outbound(&doc, conn, &key);
        }
        state.stats.broadcasts += 1;
    }
}

// ---------------------------------------------------------------------------
// Actions

fn registry_action(state: &mut ServerState, conn_id: u64, action: &RegistryAction) {
    let Some(user_id) = user_of(state, conn_id) else {
        return;
    };
    let Some(registry) = load_doc(state, conn_id, DocKey::Registry) else {
        return;
    };
    match apply_registry_action(&registry, &user_id, action) {
        Err(e) => send_action_error(state, conn_id, e),
        Ok(effect) => {
            state.docs.mark_dirty(DocKey::Registry);
            match effect {
                RegistryEffect::CreatedList(id) => {
                    state.docs.create_list(id);
                }
                RegistryEffect::DeletedList(id) => {
                    let key = DocKey::List(id);
                    state.docs.forget(&key);
                    let store = state.docs.store().clone();
                    if let Err(e) = store.delete(&key) {
                        log::warn!("failed to delete blob for {key}: {e}");
                    }
                }
                RegistryEffect::Updated => {}
            }
            prune_list_subscriptions(state);
            broadcast_document(state, DocKey::Registry);
        }
    }
}

fn list_action(state: &mut ServerState, conn_id: u64, list_id: Uuid, action: &ListAction) {
    let Some(user_id) = user_of(state, conn_id) else {
        return;
    };
    let Some(registry) = load_doc(state, conn_id, DocKey::Registry) else {
        return;
    };
    let Some(entry) = read_entry(&registry, &list_id) else {
        send_error(
            state,
            conn_id,
            ErrorCode::NotFound,
            format!("list {list_id} not found"),
        );
        return;
    };
    let key = DocKey::List(list_id);
    let Some(doc) = load_doc(state, conn_id, key) else {
        return;
    };
    match apply_list_action(&doc, &entry, &user_id, action) {
        Err(e) => send_action_error(state, conn_id, e),
        Ok(()) => {
            state.docs.mark_dirty(key);
            // Item edits are content-visible on the list index too.
            touch_entry(&registry, &list_id);
            state.docs.mark_dirty(DocKey::Registry);
            broadcast_document(state, key);
            broadcast_document(state, DocKey::Registry);
        }
    }
}

fn bulletin_action(state: &mut ServerState, conn_id: u64, action: &BulletinAction) {
    let Some(user_id) = user_of(state, conn_id) else {
        return;
    };
    let Some(doc) = load_doc(state, conn_id, DocKey::Bulletins) else {
        return;
    };
    match apply_bulletin_action(&doc, &user_id, action) {
        Err(e) => send_action_error(state, conn_id, e),
        Ok(()) => {
            state.docs.mark_dirty(DocKey::Bulletins);
            broadcast_document(state, DocKey::Bulletins);
        }
    }
}

// ---------------------------------------------------------------------------
// Sync

fn sync_frame(state: &mut ServerState, conn_id: u64, key: DocKey, data: &str) {
    if !key.sync_enabled() {
        send_error(
            state,
            conn_id,
            ErrorCode::BadRequest,
            "registry sync not supported",
        );
        return;
    }
    let payload = match decode_sync_data(data) {
        Ok(payload) => payload,
        Err(e) => {
            send_error(
                state,
                conn_id,
                ErrorCode::BadRequest,
                format!("invalid sync payload: {e}"),
            );
            return;
        }
    };
    let subscribed = state
        .conns
        .get(&conn_id)
        .is_some_and(|c| c.subs.contains_key(&key));
    if !subscribed {
        send_error(
            state,
            conn_id,
            ErrorCode::BadRequest,
            format!("not subscribed to {key}"),
        );
        return;
    }
    let Some(doc) = load_doc(state, conn_id, key) else {
        return;
    };

    let result = {
        let Some(conn) = state.conns.get_mut(&conn_id) else {
            return;
        };
        let Some(sync) = conn.subs.get_mut(&key) else {
            return;
        };
        doc.receive_sync(sync, &payload)
    };

    match result {
        Err(e) => send_error(state, conn_id, ErrorCode::BadRequest, e.to_string()),
        Ok(true) => {
            state.docs.mark_dirty(key);
            // Every subscriber, the originator included; their sync
            // state makes the echo a no-op.
            broadcast_document(state, key);
        }
        Ok(false) => {
            // A state-vector announcement: answer the originator with a
            // snapshot and whatever delta it is missing.
            if let Some(conn) = state.conns.get_mut(&conn_id) {
                conn.send(&snapshot_frame(&doc, key, &conn.user_id));
                run_outbound(&doc, conn, &key);
            }
        }
    }
}

fn request_full_state(state: &mut ServerState, conn_id: u64, doc: Option<DocKey>) {
    let keys: Vec<DocKey> = match doc {
        Some(key) => {
            let subscribed = state
                .conns
                .get(&conn_id)
                .is_some_and(|c| c.subs.contains_key(&key));
            if !subscribed {
                send_error(
                    state,
                    conn_id,
                    ErrorCode::BadRequest,
                    format!("not subscribed to {key}"),
                );
                return;
            }
            vec![key]
        }
        None => state
            .conns
            .get(&conn_id)
            .map(|c| c.subs.keys().copied().collect())
            .unwrap_or_default(),
    };
    for key in keys {
        let Some(doc) = load_doc(state, conn_id, key) else {
            continue;
        };
        if let Some(conn) = state.conns.get(&conn_id) {
            conn.send(&snapshot_frame(&doc, key, &conn.user_id));
        }
    }
}
