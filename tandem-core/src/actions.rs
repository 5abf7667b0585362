//! Typed domain actions.
//!
//! Every mutation that is not raw CRDT sync flows through here: an action
//! validates its payload, checks authorization against the access-control
//! predicates, and applies all of its semantic mutations in exactly one
//! CRDT transaction. Failures are typed and map 1:1 onto wire error codes.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use yrs::{Any, Array, Map, TextPrelim, Transact};

use crate::access;
use crate::doc::{
    find_by_id, push_map, read_bool, read_str, replace_text, set_opt_str, DocHandle,
    BULLETINS_ROOT, ITEMS_ROOT, REGISTRY_ROOT,
};
use crate::snapshot::{ListEntry, Visibility};

/// Bound on list names and item labels, in characters.
pub const MAX_NAME_LEN: usize = 200;
/// Bound on item notes and bulletin text, in characters.
pub const MAX_LONG_TEXT_LEN: usize = 2000;
/// Bound on plain optional strings (quantity, vendor), in characters.
pub const MAX_PLAIN_LEN: usize = 200;
/// Cap on owned, non-archived lists per user.
pub const MAX_LISTS_PER_USER: usize = 200;
/// Cap on items per list.
pub const MAX_ITEMS_PER_LIST: usize = 1000;

/// A rejected action. The session loop turns these into error frames;
/// the connection stays open.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
}

fn bad(msg: impl Into<String>) -> ActionError {
    ActionError::BadRequest(msg.into())
}

fn forbidden(msg: impl Into<String>) -> ActionError {
    ActionError::Forbidden(msg.into())
}

fn not_found(msg: impl Into<String>) -> ActionError {
    ActionError::NotFound(msg.into())
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Trim and bound-check a required text field.
fn required_text(field: &str, value: &str, max: usize) -> Result<String, ActionError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(bad(format!("{field} must not be empty")));
    }
    if trimmed.chars().count() > max {
        return Err(bad(format!("{field} exceeds {max} characters")));
    }
    Ok(trimmed.to_string())
}

/// Trim and bound-check an optional text field. Empty after trimming
/// means absent.
fn optional_text(
    field: &str,
    value: Option<&str>,
    max: usize,
) -> Result<Option<String>, ActionError> {
    match value {
        None => Ok(None),
        Some(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            if trimmed.chars().count() > max {
                return Err(bad(format!("{field} exceeds {max} characters")));
            }
            Ok(Some(trimmed.to_string()))
        }
    }
}

/// Registry-level operations. Metadata ops are owner-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RegistryAction {
    CreateList {
        name: String,
        #[serde(default)]
        visibility: Visibility,
    },
    RenameList {
        list_id: Uuid,
        name: String,
    },
    UpdateListVisibility {
        list_id: Uuid,
        visibility: Visibility,
    },
    SetCollaborators {
        list_id: Uuid,
        collaborators: Vec<String>,
    },
    ArchiveList {
        list_id: Uuid,
    },
    RestoreList {
        list_id: Uuid,
    },
    DeleteList {
        list_id: Uuid,
    },
}

/// Item-level operations inside one list document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ListAction {
    AddItem {
        label: String,
        #[serde(default)]
        quantity: Option<String>,
        #[serde(default)]
        vendor: Option<String>,
    },
    UpdateItem {
        item_id: Uuid,
        label: String,
    },
    SetItemQuantity {
        item_id: Uuid,
        #[serde(default)]
        quantity: Option<String>,
    },
    SetItemVendor {
        item_id: Uuid,
        #[serde(default)]
        vendor: Option<String>,
    },
    SetItemNotes {
        item_id: Uuid,
        #[serde(default)]
        notes: Option<String>,
    },
    ToggleItemChecked {
        item_id: Uuid,
        checked: bool,
    },
    RemoveItem {
        item_id: Uuid,
    },
}

/// Bulletin-board operations. Edits and deletes are author-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BulletinAction {
    AddBulletin {
        text: String,
        #[serde(default)]
        visibility: Visibility,
    },
    EditBulletin {
        bulletin_id: Uuid,
        text: String,
    },
    DeleteBulletin {
        bulletin_id: Uuid,
    },
}

/// What the session loop must do after a registry action besides
/// broadcasting: create or destroy the backing list document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEffect {
    Updated,
    CreatedList(Uuid),
    DeletedList(Uuid),
}

/// Apply a registry action for `caller`. One transaction per call.
pub fn apply_registry_action(
    registry: &DocHandle,
    caller: &str,
    action: &RegistryAction,
) -> Result<RegistryEffect, ActionError> {
    let lists = registry.doc().get_or_insert_array(REGISTRY_ROOT);
    let mut txn = registry.doc().transact_mut();

    // Owner-only resolution for everything but create.
    let resolve_owned = |txn: &yrs::TransactionMut<'_>, list_id: &Uuid| {
        let (index, map) = find_by_id(&lists, txn, list_id)
            .ok_or_else(|| not_found(format!("list {list_id} not found")))?;
        let owner = read_str(&map, txn, "ownerId").unwrap_or_default();
        if owner != caller {
            return Err(forbidden("only the owner may change list settings"));
        }
        Ok((index, map))
    };

    match action {
        RegistryAction::CreateList { name, visibility } => {
            let name = required_text("name", name, MAX_NAME_LEN)?;
            let owned = lists
                .iter(&txn)
                .filter_map(|value| match value {
                    yrs::Out::YMap(map) => Some(map),
                    _ => None,
                })
                .filter(|map| {
                    read_str(map, &txn, "ownerId").as_deref() == Some(caller)
                        && !read_bool(map, &txn, "archived")
                })
                .count();
            if owned >= MAX_LISTS_PER_USER {
                return Err(bad(format!(
                    "list limit of {MAX_LISTS_PER_USER} reached"
                )));
            }

            let id = Uuid::new_v4();
            let entry = push_map(&lists, &mut txn);
            entry.insert(&mut txn, "id", id.to_string());
            entry.insert(&mut txn, "ownerId", caller.to_string());
            entry.insert(&mut txn, "createdAt", now_iso());
            entry.insert(&mut txn, "visibility", visibility.as_str().to_string());
            entry.insert(&mut txn, "collaborators", Any::Array(Vec::new().into()));
            entry.insert(&mut txn, "archived", false);
            entry.insert(&mut txn, "name", TextPrelim::new(name.as_str()));
            Ok(RegistryEffect::CreatedList(id))
        }

        RegistryAction::RenameList { list_id, name } => {
            let name = required_text("name", name, MAX_NAME_LEN)?;
            let (_, entry) = resolve_owned(&txn, list_id)?;
            replace_text(&entry, &mut txn, "name", &name);
            entry.insert(&mut txn, "updatedAt", now_iso());
            Ok(RegistryEffect::Updated)
        }

        RegistryAction::UpdateListVisibility {
            list_id,
            visibility,
        } => {
            let (_, entry) = resolve_owned(&txn, list_id)?;
            entry.insert(&mut txn, "visibility", visibility.as_str().to_string());
            entry.insert(&mut txn, "updatedAt", now_iso());
            Ok(RegistryEffect::Updated)
        }

        RegistryAction::SetCollaborators {
            list_id,
            collaborators,
        } => {
            let mut cleaned: Vec<String> = Vec::new();
            for raw in collaborators {
                let id = raw.trim();
                if id.is_empty() {
                    continue;
                }
                if id.chars().count() > MAX_PLAIN_LEN {
                    return Err(bad(format!(
                        "collaborator id exceeds {MAX_PLAIN_LEN} characters"
                    )));
                }
                if id != caller && !cleaned.iter().any(|c| c == id) {
                    cleaned.push(id.to_string());
                }
            }
            let (_, entry) = resolve_owned(&txn, list_id)?;
            let values: Vec<Any> = cleaned.into_iter().map(Any::from).collect();
            entry.insert(&mut txn, "collaborators", Any::Array(values.into()));
            entry.insert(&mut txn, "updatedAt", now_iso());
            Ok(RegistryEffect::Updated)
        }

        RegistryAction::ArchiveList { list_id } => {
            let (_, entry) = resolve_owned(&txn, list_id)?;
            entry.insert(&mut txn, "archived", true);
            entry.insert(&mut txn, "updatedAt", now_iso());
            Ok(RegistryEffect::Updated)
        }

        RegistryAction::RestoreList { list_id } => {
            let (_, entry) = resolve_owned(&txn, list_id)?;
            entry.insert(&mut txn, "archived", false);
            entry.insert(&mut txn, "updatedAt", now_iso());
            Ok(RegistryEffect::Updated)
        }

        RegistryAction::DeleteList { list_id } => {
            let (index, _) = resolve_owned(&txn, list_id)?;
            lists.remove(&mut txn, index);
            Ok(RegistryEffect::DeletedList(*list_id))
        }
    }
}

/// Refresh a registry entry's `updatedAt` after a content-visible item
/// mutation. Returns false when the entry vanished meanwhile.
pub fn touch_entry(registry: &DocHandle, list_id: &Uuid) -> bool {
    let lists = registry.doc().get_or_insert_array(REGISTRY_ROOT);
    let mut txn = registry.doc().transact_mut();
    match find_by_id(&lists, &txn, list_id) {
        Some((_, entry)) => {
            entry.insert(&mut txn, "updatedAt", now_iso());
            true
        }
        None => false,
    }
}

/// Apply an item action for `caller`. The session loop resolves `entry`
/// from the registry first; the edit check covers archival.
pub fn apply_list_action(
    list: &DocHandle,
    entry: &ListEntry,
    caller: &str,
    action: &ListAction,
) -> Result<(), ActionError> {
    if !access::editable_to(entry, caller) {
        if entry.archived {
            return Err(forbidden("list is archived"));
        }
        return Err(forbidden("not allowed to edit this list"));
    }

    let items = list.doc().get_or_insert_array(ITEMS_ROOT);
    let mut txn = list.doc().transact_mut();

    let resolve_item = |txn: &yrs::TransactionMut<'_>, item_id: &Uuid| {
        find_by_id(&items, txn, item_id)
            .ok_or_else(|| not_found(format!("item {item_id} not found")))
    };

    match action {
        ListAction::AddItem {
            label,
            quantity,
            vendor,
        } => {
            let label = required_text("label", label, MAX_NAME_LEN)?;
            let quantity = optional_text("quantity", quantity.as_deref(), MAX_PLAIN_LEN)?;
            let vendor = optional_text("vendor", vendor.as_deref(), MAX_PLAIN_LEN)?;
            if items.len(&txn) as usize >= MAX_ITEMS_PER_LIST {
                return Err(bad(format!("item limit of {MAX_ITEMS_PER_LIST} reached")));
            }

            let id = Uuid::new_v4();
            let item = push_map(&items, &mut txn);
            item.insert(&mut txn, "id", id.to_string());
            item.insert(&mut txn, "createdAt", now_iso());
            item.insert(&mut txn, "addedBy", caller.to_string());
            item.insert(&mut txn, "checked", false);
            item.insert(&mut txn, "label", TextPrelim::new(label.as_str()));
            set_opt_str(&item, &mut txn, "quantity", quantity.as_deref());
            set_opt_str(&item, &mut txn, "vendor", vendor.as_deref());
            Ok(())
        }

        ListAction::UpdateItem { item_id, label } => {
            let label = required_text("label", label, MAX_NAME_LEN)?;
            let (_, item) = resolve_item(&txn, item_id)?;
            replace_text(&item, &mut txn, "label", &label);
            Ok(())
        }

        ListAction::SetItemQuantity { item_id, quantity } => {
            let quantity = optional_text("quantity", quantity.as_deref(), MAX_PLAIN_LEN)?;
            let (_, item) = resolve_item(&txn, item_id)?;
            set_opt_str(&item, &mut txn, "quantity", quantity.as_deref());
            Ok(())
        }

        ListAction::SetItemVendor { item_id, vendor } => {
            let vendor = optional_text("vendor", vendor.as_deref(), MAX_PLAIN_LEN)?;
            let (_, item) = resolve_item(&txn, item_id)?;
            set_opt_str(&item, &mut txn, "vendor", vendor.as_deref());
            Ok(())
        }

        ListAction::SetItemNotes { item_id, notes } => {
            let notes = optional_text("notes", notes.as_deref(), MAX_LONG_TEXT_LEN)?;
            let (_, item) = resolve_item(&txn, item_id)?;
            match notes {
                Some(notes) => replace_text(&item, &mut txn, "notes", &notes),
                None => {
                    item.remove(&mut txn, "notes");
                }
            }
            Ok(())
        }

        ListAction::ToggleItemChecked { item_id, checked } => {
            // Explicit target value, so redelivery is idempotent.
            let (_, item) = resolve_item(&txn, item_id)?;
            item.insert(&mut txn, "checked", *checked);
            Ok(())
        }

        ListAction::RemoveItem { item_id } => {
            let (index, _) = resolve_item(&txn, item_id)?;
            items.remove(&mut txn, index);
            Ok(())
        }
    }
}

/// Apply a bulletin action for `caller`. One transaction per call.
pub fn apply_bulletin_action(
    bulletins: &DocHandle,
    caller: &str,
    action: &BulletinAction,
) -> Result<(), ActionError> {
    let board = bulletins.doc().get_or_insert_array(BULLETINS_ROOT);
    let mut txn = bulletins.doc().transact_mut();

    let resolve_authored = |txn: &yrs::TransactionMut<'_>, bulletin_id: &Uuid| {
        let (index, map) = find_by_id(&board, txn, bulletin_id)
            .ok_or_else(|| not_found(format!("bulletin {bulletin_id} not found")))?;
        let author = read_str(&map, txn, "authorId").unwrap_or_default();
        if author != caller {
            return Err(forbidden("only the author may change a bulletin"));
        }
        Ok((index, map))
    };

    match action {
        BulletinAction::AddBulletin { text, visibility } => {
            let text = required_text("text", text, MAX_LONG_TEXT_LEN)?;
            let id = Uuid::new_v4();
            let bulletin = push_map(&board, &mut txn);
            bulletin.insert(&mut txn, "id", id.to_string());
            bulletin.insert(&mut txn, "authorId", caller.to_string());
            bulletin.insert(&mut txn, "createdAt", now_iso());
            bulletin.insert(&mut txn, "visibility", visibility.as_str().to_string());
            bulletin.insert(&mut txn, "text", TextPrelim::new(text.as_str()));
            Ok(())
        }

        BulletinAction::EditBulletin { bulletin_id, text } => {
            let text = required_text("text", text, MAX_LONG_TEXT_LEN)?;
            let (_, bulletin) = resolve_authored(&txn, bulletin_id)?;
            replace_text(&bulletin, &mut txn, "text", &text);
            bulletin.insert(&mut txn, "editedAt", now_iso());
            Ok(())
        }

        BulletinAction::DeleteBulletin { bulletin_id } => {
            let (index, _) = resolve_authored(&txn, bulletin_id)?;
            board.remove(&mut txn, index);
            Ok(())
        }
    }
}
