//! Per-peer synchronization state machine.
//!
//! Every (connection, document) subscription owns one [`SyncState`]
//! recording which portion of the document the peer is known to have.
//! Sync payloads travel as opaque bytes over the wire; the first byte
//! tags the content:
//!
//! ```text
//! 0x00 | state vector  — "here is what I have", requests a diff back
//! 0x01 | update        — CRDT update to merge into the receiver
//! ```
//!
//! Inbound: [`DocHandle::receive_sync`] ingests either form. Outbound:
//! [`DocHandle::generate_sync`] is called in a loop after every mutation
//! and emits the minimal delta the peer is missing, returning `None`
//! once the peer's recorded state covers the document.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact, Update};

use crate::doc::DocHandle;

const TAG_STATE_VECTOR: u8 = 0x00;
const TAG_UPDATE: u8 = 0x01;

/// What one peer is known to have seen of one document.
#[derive(Debug, Default)]
pub struct SyncState {
    remote: StateVector,
}

impl SyncState {
    /// Fresh state: the peer is assumed to have nothing, so the first
    /// outbound pass transmits the full document.
    pub fn new() -> Self {
        Self::default()
    }
}

/// A sync payload the server could not ingest. Maps to `BAD_REQUEST`.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("empty sync payload")]
    Empty,
    #[error("unknown sync payload tag {0:#04x}")]
    UnknownTag(u8),
    #[error("failed to decode sync payload: {0}")]
    Decode(String),
    #[error("failed to apply remote update: {0}")]
    Apply(String),
}

/// True when `remote` already accounts for every client clock in `local`.
fn covered(local: &StateVector, remote: &StateVector) -> bool {
    local
        .iter()
        .all(|(client, clock)| remote.get(client) >= *clock)
}

impl DocHandle {
    /// Current state vector of the authoritative document.
    pub fn state_vector(&self) -> StateVector {
        self.doc().transact().state_vector()
    }

    /// Tagged announcement of this document's state vector. Sent by a
    /// replica to ask its peer for everything it is missing.
    pub fn sync_announce(&self) -> Vec<u8> {
        let sv = self.state_vector().encode_v1();
        let mut payload = Vec::with_capacity(sv.len() + 1);
        payload.push(TAG_STATE_VECTOR);
        payload.extend_from_slice(&sv);
        payload
    }

    /// Tagged update carrying everything this document has beyond `since`.
    pub fn sync_update_since(&self, since: &StateVector) -> Vec<u8> {
        let txn = self.doc().transact();
        let diff = txn.encode_diff_v1(since);
        let mut payload = Vec::with_capacity(diff.len() + 1);
        payload.push(TAG_UPDATE);
        payload.extend_from_slice(&diff);
        payload
    }

    /// Ingest one inbound sync payload from the peer behind `state`.
    ///
    /// Returns whether the document advanced, so the caller knows to
    /// mark it dirty and broadcast.
    pub fn receive_sync(&self, state: &mut SyncState, payload: &[u8]) -> Result<bool, SyncError> {
        let (&tag, rest) = payload.split_first().ok_or(SyncError::Empty)?;
        match tag {
            TAG_STATE_VECTOR => {
                state.remote =
                    StateVector::decode_v1(rest).map_err(|e| SyncError::Decode(e.to_string()))?;
                Ok(false)
            }
            TAG_UPDATE => {
                let update =
                    Update::decode_v1(rest).map_err(|e| SyncError::Decode(e.to_string()))?;
                let mut txn = self.doc().transact_mut();
                let before = txn.state_vector();
                txn.apply_update(update)
                    .map_err(|e| SyncError::Apply(e.to_string()))?;
                let after = txn.state_vector();
                Ok(after != before)
            }
            other => Err(SyncError::UnknownTag(other)),
        }
    }

    /// Produce the next outbound payload for the peer behind `state`,
    /// or `None` once the peer is up to date. Advances the record of
    /// what the peer has, so repeated calls quiesce.
    pub fn generate_sync(&self, state: &mut SyncState) -> Option<Vec<u8>> {
        let txn = self.doc().transact();
        let local = txn.state_vector();
        if covered(&local, &state.remote) {
            return None;
        }
        let diff = txn.encode_diff_v1(&state.remote);
        drop(txn);
        state.remote = local;
        let mut payload = Vec::with_capacity(diff.len() + 1);
        payload.push(TAG_UPDATE);
        payload.extend_from_slice(&diff);
        Some(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{apply_bulletin_action, BulletinAction};
    use crate::snapshot::{project_bulletins, Visibility};

    fn post(doc: &DocHandle, author: &str, text: &str) {
        apply_bulletin_action(
            doc,
            author,
            &BulletinAction::AddBulletin {
                text: text.to_string(),
                visibility: Visibility::Public,
            },
        )
        .unwrap();
    }

    /// Pump every pending outbound payload from `from` into `to`.
    fn drain(
        from: &DocHandle,
        from_state: &mut SyncState,
        to: &DocHandle,
        to_state: &mut SyncState,
    ) -> usize {
        let mut frames = 0;
        while let Some(payload) = from.generate_sync(from_state) {
            to.receive_sync(to_state, &payload).unwrap();
            frames += 1;
        }
        frames
    }

    #[test]
    fn test_empty_docs_are_quiescent() {
        let server = DocHandle::new_bulletins();
        let mut state = SyncState::new();
        assert!(server.generate_sync(&mut state).is_none());
    }

    #[test]
    fn test_full_transfer_to_fresh_peer() {
        let server = DocHandle::new_bulletins();
        post(&server, "user-alice", "first");
        post(&server, "user-alice", "second");

        let client = DocHandle::new_bulletins();
        let mut server_side = SyncState::new();
        let mut client_side = SyncState::new();

        let frames = drain(&server, &mut server_side, &client, &mut client_side);
        assert!(frames >= 1);
        assert_eq!(project_bulletins(&client, "user-alice").bulletins.len(), 2);

        // Quiescent after the transfer.
        assert!(server.generate_sync(&mut server_side).is_none());
    }

    #[test]
    fn test_announce_then_diff_skips_known_state() {
        let server = DocHandle::new_bulletins();
        post(&server, "user-alice", "first");

        // Client already has everything via a full load.
        let client = DocHandle::load_bulletins(&server.save()).unwrap();
        let mut server_side = SyncState::new();

        // Announce tells the server what the client has.
        let changed = server
            .receive_sync(&mut server_side, &client.sync_announce())
            .unwrap();
        assert!(!changed, "announcements never change the document");
        assert!(
            server.generate_sync(&mut server_side).is_none(),
            "peer is already covered"
        );

        // A new post produces exactly one delta.
        post(&server, "user-alice", "second");
        let payload = server.generate_sync(&mut server_side).unwrap();
        assert_eq!(payload[0], TAG_UPDATE);
        assert!(server.generate_sync(&mut server_side).is_none());
    }

    #[test]
    fn test_inbound_update_reports_change() {
        let server = DocHandle::new_bulletins();
        let client = DocHandle::new_bulletins();
        post(&client, "user-bob", "from the client");

        let mut state = SyncState::new();
        let update = client.sync_update_since(&StateVector::default());
        let changed = server.receive_sync(&mut state, &update).unwrap();
        assert!(changed);
        assert_eq!(project_bulletins(&server, "user-bob").bulletins.len(), 1);

        // Redelivery of the same update is a no-op.
        let changed = server.receive_sync(&mut state, &update).unwrap();
        assert!(!changed);
    }

    #[test]
    fn test_concurrent_edits_converge() {
        let a = DocHandle::new_bulletins();
        let b = DocHandle::new_bulletins();
        post(&a, "user-alice", "from a");
        post(&b, "user-bob", "from b");

        let mut a_to_b = SyncState::new();
        let mut b_to_a = SyncState::new();
        let mut b_in = SyncState::new();
        let mut a_in = SyncState::new();
        drain(&a, &mut a_to_b, &b, &mut b_in);
        drain(&b, &mut b_to_a, &a, &mut a_in);

        assert_eq!(project_bulletins(&a, "user-alice").bulletins.len(), 2);
        assert_eq!(project_bulletins(&b, "user-alice").bulletins.len(), 2);
    }

    #[test]
    fn test_malformed_payloads() {
        let doc = DocHandle::new_bulletins();
        let mut state = SyncState::new();
        assert!(matches!(
            doc.receive_sync(&mut state, &[]),
            Err(SyncError::Empty)
        ));
        assert!(matches!(
            doc.receive_sync(&mut state, &[0x7F, 1, 2]),
            Err(SyncError::UnknownTag(0x7F))
        ));
        assert!(matches!(
            doc.receive_sync(&mut state, &[TAG_UPDATE, 0xFF, 0xFF]),
            Err(SyncError::Decode(_))
        ));
    }
}
