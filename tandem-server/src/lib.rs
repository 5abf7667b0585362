//! # tandem-server — centralized CRDT synchronization server
//!
//! Serves three collaborative document families over one WebSocket
//! endpoint: a registry of lists, one item document per list, and a
//! bulletin board. Clients hold local replicas; this server holds the
//! authoritative documents, validates typed actions, relays CRDT sync
//! frames, and persists opaque blobs with atomic replacement.
//!
//! ```text
//! Client ──ws /ws──► session loop ──► actions / sync  (tandem-core)
//!                        │                  │
//!                        │            DocumentRegistry (cache + dirty)
//!                        │                  │
//!                   broadcast          BlobStore (fs | RocksDB)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire frames and error codes
//! - [`session`] — frame dispatch, subscriptions, broadcast fan-out
//! - [`server`] — accept loop, HTTP endpoints, flush timer
//! - [`docs`] — live document cache with dirty tracking
//! - [`storage`] — blob persistence backends
//! - [`ratelimit`] — per-connection token bucket
//! - [`config`] — env-driven configuration

pub mod config;
pub mod docs;
pub mod protocol;
pub mod ratelimit;
mod session;
pub mod server;
pub mod storage;

pub use config::ServerConfig;
pub use docs::{DocsError, DocumentRegistry};
pub use protocol::{ClientFrame, ErrorCode, ServerFrame};
pub use ratelimit::{RateConfig, TokenBucket};
pub use server::{ServerStats, SyncServer};
pub use storage::{BlobStore, FsStore, RocksStore, StoreError};
