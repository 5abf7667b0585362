//! The sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                 ┌── ConnEntry (subs + outbox) ── writer task
//!             ├── TcpListener ─┤
//! Client B ──┘                 └── ConnEntry ...
//!                  │
//!                  ▼
//!        Mutex<ServerState>  ── DocumentRegistry ── BlobStore (fs | RocksDB)
//!        (docs, dirty set,          │
//!         connections, stats)       └── flush timer (~1 s) + shutdown flush
//! ```
//!
//! One mutex serializes all document mutations and subscription-table
//! changes; it is held across the handling of a single frame and
//! released before any socket I/O. Plain HTTP (`/healthz`,
//! `/debug/state`) is answered on the same listener by peeking the
//! request head before the WebSocket handshake.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

use tandem_core::snapshot::{bulletin_entries, registry_entries};
use tandem_core::{project_list, DocKey};

use crate::config::ServerConfig;
use crate::docs::DocumentRegistry;
use crate::protocol::{ClientFrame, ErrorCode};
use crate::ratelimit::{frame_cost, TokenBucket};
use crate::session::{self, ServerState};
use crate::storage::{BlobStore, FsStore, RocksStore, StoreError};

/// Server-wide counters, guarded by the state lock.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub frames_rejected: u64,
    pub broadcasts: u64,
    pub flushes: u64,
}

/// The sync server. Spawn [`Self::run`] and it accepts connections
/// until dropped; call [`Self::flush_all`] on the way out.
pub struct SyncServer {
    config: ServerConfig,
    state: Arc<Mutex<ServerState>>,
    next_conn_id: AtomicU64,
}

impl SyncServer {
    /// Create a server over the backend the config selects.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn BlobStore> = match &config.db_path {
            Some(path) => Arc::new(RocksStore::open(path.clone())?),
            None => Arc::new(FsStore::open(&config.data_dir)?),
        };
        Ok(Self {
            config,
            state: Arc::new(Mutex::new(ServerState::new(DocumentRegistry::new(store)))),
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// Bind and serve. Loads the registry and bulletin documents
    /// eagerly, starts the flush timer, then accepts forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        {
            let mut st = self.state.lock().await;
            st.docs.get_or_load(DocKey::Registry)?;
            st.docs.get_or_load(DocKey::Bulletins)?;
        }

        // The timer holds only a weak handle: when the server (and its
        // connections) go away, the flusher stops and the store closes.
        let flush_state = Arc::downgrade(&self.state);
        let flush_interval = self.config.flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(state) = flush_state.upgrade() else {
                    break;
                };
                let mut st = state.lock().await;
                let flushed = st.docs.flush_all();
                if flushed > 0 {
                    st.stats.flushes += 1;
                    log::debug!("flushed {flushed} dirty documents");
                }
            }
        });

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("tandem server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            let state = self.state.clone();
            let config = self.config.clone();
            let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if let Err(e) = handle_socket(stream, addr, state, config, conn_id).await {
                    log::debug!("connection {conn_id} from {addr} ended: {e}");
                }
            });
        }
    }

    /// Flush every dirty document now. The shutdown hook and tests call
    /// this directly.
    pub async fn flush_all(&self) -> usize {
        let mut st = self.state.lock().await;
        let flushed = st.docs.flush_all();
        if flushed > 0 {
            st.stats.flushes += 1;
        }
        flushed
    }

    /// Snapshot of the server counters.
    pub async fn stats(&self) -> ServerStats {
        self.state.lock().await.stats.clone()
    }

    /// The configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Unfiltered dump of every document, for `/debug/state`.
    pub async fn debug_state(&self) -> serde_json::Value {
        debug_dump(&self.state).await
    }
}

async fn debug_dump(state: &Arc<Mutex<ServerState>>) -> serde_json::Value {
    let mut st = state.lock().await;
    let registry = st
        .docs
        .get_or_load(DocKey::Registry)
        .map(|doc| serde_json::to_value(registry_entries(&doc)).unwrap_or(serde_json::Value::Null))
        .unwrap_or(serde_json::Value::Null);
    let bulletins = st
        .docs
        .get_or_load(DocKey::Bulletins)
        .map(|doc| serde_json::to_value(bulletin_entries(&doc)).unwrap_or(serde_json::Value::Null))
        .unwrap_or(serde_json::Value::Null);

    let ids = st.docs.store().list_lists().unwrap_or_default();
    let mut lists = serde_json::Map::new();
    for id in ids {
        if let Ok(doc) = st.docs.get_or_load(DocKey::List(id)) {
            lists.insert(
                id.to_string(),
                serde_json::to_value(project_list(&doc)).unwrap_or(serde_json::Value::Null),
            );
        }
    }

    serde_json::json!({
        "registry": registry,
        "bulletins": bulletins,
        "lists": serde_json::Value::Object(lists),
    })
}

/// Handle one accepted TCP connection: route plain HTTP, or upgrade to
/// a WebSocket session.
async fn handle_socket(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
    config: ServerConfig,
    conn_id: u64,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let head = peek_request_head(&stream).await?;
    let target = request_target(&head);
    if !target.starts_with("/ws") {
        return serve_http(stream, &target, &state, &config).await;
    }

    let mut query: Option<String> = None;
    let mut bearer: Option<String> = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        query = req.uri().query().map(str::to_string);
        bearer = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);
        Ok(resp)
    })
    .await?;

    let user_id = session::derive_user_id(query.as_deref(), bearer.as_deref());
    log::info!("conn {conn_id} from {addr} identified as {user_id}");

    let (mut ws_sender, mut ws_receiver) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Writer task drains the outbox outside the state lock, so a slow
    // peer cannot stall frame handling.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    {
        let mut st = state.lock().await;
        session::handle_connect(&mut st, conn_id, user_id, tx.clone());
    }

    let mut bucket = TokenBucket::new(config.rate);
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let mut st = state.lock().await;
                st.stats.frames_received += 1;
                match serde_json::from_str::<ClientFrame>(text.as_str()) {
                    Err(e) => session::send_error(
                        &st,
                        conn_id,
                        ErrorCode::BadRequest,
                        format!("malformed frame: {e}"),
                    ),
                    Ok(frame) => {
                        if bucket.try_consume(frame_cost(&frame)) {
                            session::handle_frame(&mut st, conn_id, frame);
                        } else {
                            st.stats.frames_rejected += 1;
                            session::send_error(
                                &st,
                                conn_id,
                                ErrorCode::RateLimited,
                                "rate limit exceeded",
                            );
                        }
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                let st = state.lock().await;
                session::send_error(
                    &st,
                    conn_id,
                    ErrorCode::BadRequest,
                    "binary frames not supported",
                );
            }
            Ok(Message::Ping(data)) => {
                let _ = tx.send(Message::Pong(data));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::debug!("socket error on conn {conn_id}: {e}");
                break;
            }
        }
    }

    {
        let mut st = state.lock().await;
        session::handle_disconnect(&mut st, conn_id);
    }
    drop(tx);
    let _ = writer.await;
    log::info!("conn {conn_id} from {addr} closed");
    Ok(())
}

/// Peek the request head without consuming it, so the WebSocket
/// handshake still sees the full request. Re-peeks briefly when the
/// first packet did not yet carry a complete request line.
async fn peek_request_head(stream: &TcpStream) -> std::io::Result<String> {
    let mut buf = [0u8; 1024];
    let mut n = 0;
    for _ in 0..32 {
        n = stream.peek(&mut buf).await?;
        if n == 0 || n == buf.len() || buf[..n].windows(2).any(|w| w == b"\r\n") {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}

/// The request target from an HTTP request line (`GET /ws?x=y HTTP/1.1`).
fn request_target(head: &str) -> String {
    head.split_whitespace().nth(1).unwrap_or("").to_string()
}

async fn serve_http(
    mut stream: TcpStream,
    target: &str,
    state: &Arc<Mutex<ServerState>>,
    config: &ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Consume the head we only peeked before answering.
    let mut buf = [0u8; 1024];
    let _ = stream.read(&mut buf).await?;

    let path = target.split('?').next().unwrap_or("");
    let (status, body) = match path {
        "/healthz" => ("200 OK", "{\"ok\":true}".to_string()),
        "/debug/state" if config.expose_debug_state => {
            ("200 OK", debug_dump(state).await.to_string())
        }
        _ => ("404 Not Found", "{\"error\":\"not found\"}".to_string()),
    };
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
