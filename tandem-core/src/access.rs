//! Access-control predicates.
//!
//! Pure functions over projected registry entries and bulletins. The
//! session loop evaluates these before subscribing, before applying
//! actions, and again on every list broadcast.

use crate::snapshot::{BulletinView, ListEntry, Visibility};

/// May `user_id` see this list at all?
///
/// Public lists are visible to every signed-in user; private lists only
/// to their owner and explicit collaborators.
pub fn visible_to(entry: &ListEntry, user_id: &str) -> bool {
    entry.visibility == Visibility::Public
        || entry.owner_id == user_id
        || entry.collaborators.iter().any(|c| c == user_id)
}

/// May `user_id` mutate this list's items?
///
/// Archived lists are read-only for everyone, owner included. Public
/// lists accept item edits from any signed-in user.
pub fn editable_to(entry: &ListEntry, user_id: &str) -> bool {
    if entry.archived {
        return false;
    }
    entry.visibility == Visibility::Public || visible_to(entry, user_id)
}

/// Registry-metadata operations (rename, visibility, collaborators,
/// archive, delete) are owner-only.
pub fn is_owner(entry: &ListEntry, user_id: &str) -> bool {
    entry.owner_id == user_id
}

/// May `user_id` see this bulletin?
pub fn bulletin_visible_to(bulletin: &BulletinView, user_id: &str) -> bool {
    bulletin.visibility == Visibility::Public || bulletin.author_id == user_id
}

/// Bulletin edits and deletes are author-only.
pub fn is_author(bulletin: &BulletinView, user_id: &str) -> bool {
    bulletin.author_id == user_id
}
