//! # tandem-core — document model for the Tandem sync server
//!
//! Pure library: CRDT document shapes, typed domain actions, access
//! control, snapshot projection, and the per-peer sync-state machine.
//! No I/O lives here; `tandem-server` supplies sockets and persistence.
//!
//! ```text
//!            actions ──┐                ┌── snapshot (per-viewer)
//!                      ▼                ▼
//!              ┌─────────────────────────────┐
//!              │  DocHandle (yrs document)   │
//!              │  registry | bulletins | list│
//!              └───────┬─────────────┬───────┘
//!                      │             │
//!              save/load (blobs)   sync (per-peer SyncState)
//! ```
//!
//! ## Modules
//!
//! - [`doc`] — document selector, handle, opaque save/load
//! - [`actions`] — validated mutations, one CRDT transaction each
//! - [`access`] — visibility/editability predicates
//! - [`snapshot`] — privacy-filtered plain-data projections
//! - [`sync`] — inbound/outbound sync payloads per subscription

pub mod access;
pub mod actions;
pub mod doc;
pub mod snapshot;
pub mod sync;

pub use actions::{
    apply_bulletin_action, apply_list_action, apply_registry_action, touch_entry, ActionError,
    BulletinAction, ListAction, RegistryAction, RegistryEffect,
};
pub use doc::{DocError, DocHandle, DocKey};
pub use snapshot::{
    project_bulletins, project_list, project_registry, read_entry, BulletinView,
    BulletinsSnapshot, ItemView, ListEntry, ListSnapshot, RegistrySnapshot, Visibility,
};
pub use sync::{SyncError, SyncState};
