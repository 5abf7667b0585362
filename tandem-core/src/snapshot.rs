//! Privacy-filtered plain-data projections.
//!
//! Snapshots are what clients render: collaborative text rendered to
//! `String`, absent optionals omitted, entries the viewer may not see
//! filtered out. They are values with no ties to the CRDT documents they
//! were projected from.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use yrs::{Array, ReadTxn, Transact};

use crate::access;
use crate::doc::{
    find_by_id, read_bool, read_str, read_str_list, read_text, DocHandle, BULLETINS_ROOT,
    ITEMS_ROOT, META_ROOT, REGISTRY_ROOT,
};

/// Who may see a list or bulletin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    #[default]
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Visibility::Public),
            "private" => Some(Visibility::Private),
            _ => None,
        }
    }
}

/// Registry entry: per-list metadata and access-control facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEntry {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    pub visibility: Visibility,
    pub collaborators: Vec<String>,
    pub archived: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    pub lists: Vec<ListEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemView {
    pub id: Uuid,
    pub label: String,
    pub created_at: String,
    pub added_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub checked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSnapshot {
    pub list_id: Uuid,
    pub items: Vec<ItemView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulletinView {
    pub id: Uuid,
    pub author_id: String,
    pub text: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<String>,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulletinsSnapshot {
    pub bulletins: Vec<BulletinView>,
}

fn entry_from_map<T: ReadTxn>(map: &yrs::MapRef, txn: &T) -> Option<ListEntry> {
    let id = Uuid::parse_str(&read_str(map, txn, "id")?).ok()?;
    Some(ListEntry {
        id,
        owner_id: read_str(map, txn, "ownerId").unwrap_or_default(),
        name: read_text(map, txn, "name").unwrap_or_default(),
        created_at: read_str(map, txn, "createdAt").unwrap_or_default(),
        updated_at: read_str(map, txn, "updatedAt"),
        visibility: read_str(map, txn, "visibility")
            .and_then(|v| Visibility::parse(&v))
            .unwrap_or_default(),
        collaborators: read_str_list(map, txn, "collaborators"),
        archived: read_bool(map, txn, "archived"),
    })
}

fn item_from_map<T: ReadTxn>(map: &yrs::MapRef, txn: &T) -> Option<ItemView> {
    let id = Uuid::parse_str(&read_str(map, txn, "id")?).ok()?;
    Some(ItemView {
        id,
        label: read_text(map, txn, "label").unwrap_or_default(),
        created_at: read_str(map, txn, "createdAt").unwrap_or_default(),
        added_by: read_str(map, txn, "addedBy").unwrap_or_default(),
        quantity: read_str(map, txn, "quantity"),
        vendor: read_str(map, txn, "vendor"),
        notes: read_text(map, txn, "notes"),
        checked: read_bool(map, txn, "checked"),
    })
}

fn bulletin_from_map<T: ReadTxn>(map: &yrs::MapRef, txn: &T) -> Option<BulletinView> {
    let id = Uuid::parse_str(&read_str(map, txn, "id")?).ok()?;
    Some(BulletinView {
        id,
        author_id: read_str(map, txn, "authorId").unwrap_or_default(),
        text: read_text(map, txn, "text").unwrap_or_default(),
        created_at: read_str(map, txn, "createdAt").unwrap_or_default(),
        edited_at: read_str(map, txn, "editedAt"),
        visibility: read_str(map, txn, "visibility")
            .and_then(|v| Visibility::parse(&v))
            .unwrap_or_default(),
    })
}

/// All registry entries, unfiltered. For access checks and debug dumps.
pub fn registry_entries(doc: &DocHandle) -> Vec<ListEntry> {
    let txn = doc.doc().transact();
    let Some(lists) = txn.get_array(REGISTRY_ROOT) else {
        return Vec::new();
    };
    lists
        .iter(&txn)
        .filter_map(|value| match value {
            yrs::Out::YMap(map) => entry_from_map(&map, &txn),
            _ => None,
        })
        .collect()
}

/// The registry entry for `list_id`, if present.
pub fn read_entry(doc: &DocHandle, list_id: &Uuid) -> Option<ListEntry> {
    let txn = doc.doc().transact();
    let lists = txn.get_array(REGISTRY_ROOT)?;
    let (_, map) = find_by_id(&lists, &txn, list_id)?;
    entry_from_map(&map, &txn)
}

/// Registry snapshot for `viewer`: entries filtered by visibility.
pub fn project_registry(doc: &DocHandle, viewer: &str) -> RegistrySnapshot {
    let lists = registry_entries(doc)
        .into_iter()
        .filter(|entry| access::visible_to(entry, viewer))
        .collect();
    RegistrySnapshot { lists }
}

/// List snapshot. The caller is responsible for the visibility check
/// against the registry entry; item projection itself is viewer-blind.
pub fn project_list(doc: &DocHandle) -> ListSnapshot {
    let txn = doc.doc().transact();
    let list_id = txn
        .get_map(META_ROOT)
        .and_then(|meta| read_str(&meta, &txn, "listId"))
        .and_then(|s| Uuid::parse_str(&s).ok())
        .unwrap_or(Uuid::nil());
    let items = match txn.get_array(ITEMS_ROOT) {
        Some(items) => items
            .iter(&txn)
            .filter_map(|value| match value {
                yrs::Out::YMap(map) => item_from_map(&map, &txn),
                _ => None,
            })
            .collect(),
        None => Vec::new(),
    };
    ListSnapshot { list_id, items }
}

/// All bulletins, unfiltered. For author lookups and debug dumps.
pub fn bulletin_entries(doc: &DocHandle) -> Vec<BulletinView> {
    let txn = doc.doc().transact();
    let Some(bulletins) = txn.get_array(BULLETINS_ROOT) else {
        return Vec::new();
    };
    bulletins
        .iter(&txn)
        .filter_map(|value| match value {
            yrs::Out::YMap(map) => bulletin_from_map(&map, &txn),
            _ => None,
        })
        .collect()
}

/// Bulletin snapshot for `viewer`: public bulletins plus the viewer's own.
pub fn project_bulletins(doc: &DocHandle, viewer: &str) -> BulletinsSnapshot {
    let bulletins = bulletin_entries(doc)
        .into_iter()
        .filter(|b| access::bulletin_visible_to(b, viewer))
        .collect();
    BulletinsSnapshot { bulletins }
}
