//! Document identity and the CRDT document handle.
//!
//! Three document kinds share one server:
//! ```text
//! registry   — root array "lists"     of entry maps (name: Text)
//! bulletins  — root array "bulletins" of bulletin maps (text: Text)
//! list(id)   — root map "meta" { listId } + root array "items" (label/notes: Text)
//! ```
//!
//! [`DocHandle`] wraps the underlying `yrs::Doc` and is the only place the
//! rest of the workspace touches the CRDT engine's encodings: per-kind
//! empty construction, opaque binary `load`/`save`, and the field helpers
//! the action and projection layers build on. Sync-state operations live
//! in [`crate::sync`].

use std::fmt;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{
    Any, Array, ArrayRef, Doc, GetString, Map, MapPrelim, MapRef, Out, ReadTxn, Text, TextPrelim,
    Transact, TransactionMut, Update,
};

/// Root array holding registry entries.
pub(crate) const REGISTRY_ROOT: &str = "lists";
/// Root array holding bulletins.
pub(crate) const BULLETINS_ROOT: &str = "bulletins";
/// Root array holding a list document's items.
pub(crate) const ITEMS_ROOT: &str = "items";
/// Root map holding a list document's fixed metadata.
pub(crate) const META_ROOT: &str = "meta";

/// Selector naming one of the three document kinds.
///
/// Wire form (JSON): the string `"registry"`, the string `"bulletins"`,
/// or the object `{"listId": "<uuid>"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocKey {
    Registry,
    Bulletins,
    List(Uuid),
}

impl DocKey {
    /// Stable storage key: `registry`, `bulletins`, or `list/<uuid>`.
    pub fn storage_key(&self) -> String {
        match self {
            DocKey::Registry => "registry".to_string(),
            DocKey::Bulletins => "bulletins".to_string(),
            DocKey::List(id) => format!("list/{id}"),
        }
    }

    /// Whether bidirectional CRDT sync is allowed for this document.
    ///
    /// The registry is action-only: its entries carry the access-control
    /// metadata itself, so mutations must pass validation.
    pub fn sync_enabled(&self) -> bool {
        !matches!(self, DocKey::Registry)
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

impl Serialize for DocKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        match self {
            DocKey::Registry => serializer.serialize_str("registry"),
            DocKey::Bulletins => serializer.serialize_str("bulletins"),
            DocKey::List(id) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("listId", id)?;
                map.end()
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DocKeyWire {
    Named(String),
    List {
        #[serde(rename = "listId")]
        list_id: Uuid,
    },
}

impl<'de> Deserialize<'de> for DocKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match DocKeyWire::deserialize(deserializer)? {
            DocKeyWire::Named(name) => match name.as_str() {
                "registry" => Ok(DocKey::Registry),
                "bulletins" => Ok(DocKey::Bulletins),
                other => Err(D::Error::custom(format!(
                    "unknown document selector: {other:?}"
                ))),
            },
            DocKeyWire::List { list_id } => Ok(DocKey::List(list_id)),
        }
    }
}

/// Errors raised while decoding or validating a persisted document.
#[derive(Debug, Error)]
pub enum DocError {
    #[error("failed to decode document update: {0}")]
    Decode(String),
    #[error("failed to apply document update: {0}")]
    Apply(String),
    #[error("list document {found} stored under key for {expected}")]
    ListIdMismatch { expected: Uuid, found: String },
}

/// An authoritative CRDT document.
///
/// Cloning is shallow: clones share the same underlying document, which
/// is what the registry cache hands out to message handlers.
#[derive(Clone)]
pub struct DocHandle {
    doc: Doc,
}

impl fmt::Debug for DocHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocHandle").finish_non_exhaustive()
    }
}

impl DocHandle {
    /// Empty registry document: `{lists: []}`.
    pub fn new_registry() -> Self {
        let doc = Doc::new();
        doc.get_or_insert_array(REGISTRY_ROOT);
        Self { doc }
    }

    /// Empty bulletin board document: `{bulletins: []}`.
    pub fn new_bulletins() -> Self {
        let doc = Doc::new();
        doc.get_or_insert_array(BULLETINS_ROOT);
        Self { doc }
    }

    /// Empty list document: `{listId, items: []}`.
    pub fn new_list(list_id: Uuid) -> Self {
        let doc = Doc::new();
        let meta = doc.get_or_insert_map(META_ROOT);
        doc.get_or_insert_array(ITEMS_ROOT);
        let mut txn = doc.transact_mut();
        meta.insert(&mut txn, "listId", list_id.to_string());
        drop(txn);
        Self { doc }
    }

    fn load(bytes: &[u8]) -> Result<Self, DocError> {
        let doc = Doc::new();
        let update = Update::decode_v1(bytes).map_err(|e| DocError::Decode(e.to_string()))?;
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DocError::Apply(e.to_string()))?;
        }
        Ok(Self { doc })
    }

    /// Deserialize a persisted registry blob.
    pub fn load_registry(bytes: &[u8]) -> Result<Self, DocError> {
        let handle = Self::load(bytes)?;
        handle.doc.get_or_insert_array(REGISTRY_ROOT);
        Ok(handle)
    }

    /// Deserialize a persisted bulletin board blob.
    pub fn load_bulletins(bytes: &[u8]) -> Result<Self, DocError> {
        let handle = Self::load(bytes)?;
        handle.doc.get_or_insert_array(BULLETINS_ROOT);
        Ok(handle)
    }

    /// Deserialize a persisted list blob, checking the embedded `listId`
    /// against the blob key it was stored under.
    pub fn load_list(list_id: Uuid, bytes: &[u8]) -> Result<Self, DocError> {
        let handle = Self::load(bytes)?;
        handle.doc.get_or_insert_map(META_ROOT);
        handle.doc.get_or_insert_array(ITEMS_ROOT);
        let found = handle.list_id_field();
        match found {
            Some(found) if found == list_id.to_string() => Ok(handle),
            other => Err(DocError::ListIdMismatch {
                expected: list_id,
                found: other.unwrap_or_default(),
            }),
        }
    }

    /// Opaque full-state encoding, suitable for [`Self::load`]-family
    /// constructors and for the persistence layer.
    pub fn save(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&yrs::StateVector::default())
    }

    pub(crate) fn doc(&self) -> &Doc {
        &self.doc
    }

    /// The `listId` recorded in a list document's metadata, if any.
    pub fn list_id_field(&self) -> Option<String> {
        let txn = self.doc.transact();
        let meta = txn.get_map(META_ROOT)?;
        read_str(&meta, &txn, "listId")
    }
}

// ---------------------------------------------------------------------------
// Field helpers shared by the action and projection layers.

/// Read a plain string attribute.
pub(crate) fn read_str<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<String> {
    match map.get(txn, key)? {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

/// Read a collaborative text attribute rendered to a plain string.
pub(crate) fn read_text<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<String> {
    match map.get(txn, key)? {
        Out::YText(text) => Some(text.get_string(txn)),
        _ => None,
    }
}

/// Read a boolean attribute, defaulting to `false` when absent.
pub(crate) fn read_bool<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> bool {
    matches!(map.get(txn, key), Some(Out::Any(Any::Bool(true))))
}

/// Read a plain array-of-strings attribute.
pub(crate) fn read_str_list<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Vec<String> {
    match map.get(txn, key) {
        Some(Out::Any(Any::Array(values))) => values
            .iter()
            .filter_map(|v| match v {
                Any::String(s) => Some(s.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Locate the entry map whose `id` attribute equals `id`.
pub(crate) fn find_by_id<T: ReadTxn>(
    array: &ArrayRef,
    txn: &T,
    id: &Uuid,
) -> Option<(u32, MapRef)> {
    let wanted = id.to_string();
    for (index, value) in array.iter(txn).enumerate() {
        if let Out::YMap(map) = value {
            if read_str(&map, txn, "id").as_deref() == Some(wanted.as_str()) {
                return Some((index as u32, map));
            }
        }
    }
    None
}

/// Append a fresh entry map to `array`.
pub(crate) fn push_map(array: &ArrayRef, txn: &mut TransactionMut<'_>) -> MapRef {
    array.push_back(txn, MapPrelim::default())
}

/// Replace the full content of a collaborative text attribute, creating
/// it when missing. Replacement is delete-all + insert so concurrent
/// character edits merge through the CRDT rather than clobbering.
pub(crate) fn replace_text(map: &MapRef, txn: &mut TransactionMut<'_>, key: &str, value: &str) {
    match map.get(txn, key) {
        Some(Out::YText(text)) => {
            let len = text.len(txn);
            if len > 0 {
                text.remove_range(txn, 0, len);
            }
            if !value.is_empty() {
                text.insert(txn, 0, value);
            }
        }
        _ => {
            map.insert(txn, key, TextPrelim::new(value));
        }
    }
}

/// Write or clear an optional plain string attribute.
pub(crate) fn set_opt_str(map: &MapRef, txn: &mut TransactionMut<'_>, key: &str, value: Option<&str>) {
    match value {
        Some(v) => {
            map.insert(txn, key, v.to_string());
        }
        None => {
            map.remove(txn, key);
        }
    }
}
