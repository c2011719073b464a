//! The view (spec §4.3): a schema-typed key/value store that is a pure,
//! deterministic function of the linearised log. Six collections
//! (`writer`, `invite`, `rooms`, `messages`, `metadata`, `drive-metadata`)
//! plus a secondary `(timestamp, id) -> id` index over `messages` that
//! apply maintains alongside every insertion/deletion.
//!
//! The view is exclusively mutated through a [`ViewTxn`] obtained from
//! [`View::begin_txn`]; every other caller (including the room façade) only
//! ever calls the read methods directly on [`View`]. `begin_txn` holds the
//! write lock for the whole batch so the transaction is atomic from any
//! reader's perspective: they see either the state before the batch or
//! the state after, never a partial batch (spec §4.2's "atomic transaction
//! flushed at batch end").

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockWriteGuard};

use crate::error::ViewError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterRecord {
    pub key: [u8; 32],
    /// Linearised position at which this writer was removed, if ever.
    /// Records from this writer observed at or after that position are
    /// rejected; prior records remain valid (spec §9, writer-removal open
    /// question, resolved non-retroactively; see DESIGN.md).
    pub removed_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteRecord {
    pub id: Vec<u8>,
    pub invite: Vec<u8>,
    pub public_key: [u8; 32],
    pub expires: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: String,
    pub name: String,
    pub created_at: u64,
    pub message_count: u64,
    pub drive_key: Option<[u8; 32]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub content: String,
    pub sender: String,
    pub public_key: [u8; 32],
    pub timestamp: u64,
    pub system: bool,
    pub received: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub id: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveMetadataRecord {
    pub id: String,
    pub value: serde_json::Value,
}

/// Parameters for `getMessages` (spec §4.3 and §6). Defaults match the
/// spec exactly: `limit = 51`, `reverse = true` (newest first).
#[derive(Debug, Clone)]
pub struct MessageQuery {
    pub gt: Option<u64>,
    pub gte: Option<u64>,
    pub lt: Option<u64>,
    pub lte: Option<u64>,
    pub limit: usize,
    pub reverse: bool,
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            gt: None,
            gte: None,
            lt: None,
            lte: None,
            limit: 51,
            reverse: true,
        }
    }
}

#[derive(Default)]
struct ViewState {
    writers: HashMap<[u8; 32], WriterRecord>,
    invite: Option<InviteRecord>,
    room: Option<RoomInfo>,
    messages: HashMap<String, Message>,
    // (timestamp, id) -> id, ties broken lexicographically by id (BTreeMap
    // orders the tuple key that way already).
    timestamp_index: BTreeMap<(u64, String), String>,
    tombstones: HashSet<String>,
    metadata: HashMap<String, MetadataRecord>,
    drive_metadata: HashMap<String, DriveMetadataRecord>,
}

/// The view-core: a key/value tree that is a deterministic fold over the
/// linearised log.
pub struct View {
    state: RwLock<ViewState>,
}

impl View {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ViewState::default()),
        }
    }

    pub async fn begin_txn(&self) -> ViewTxn<'_> {
        let guard = self.state.write().await;
        ViewTxn { guard }
    }

    pub async fn is_writer(&self, key: &[u8; 32], at_position: u64) -> bool {
        let state = self.state.read().await;
        match state.writers.get(key) {
            None => false,
            Some(rec) => match rec.removed_at {
                None => true,
                Some(removed_at) => at_position < removed_at,
            },
        }
    }

    pub async fn writers(&self) -> Vec<WriterRecord> {
        self.state.read().await.writers.values().cloned().collect()
    }

    pub async fn writers_with_profiles(&self) -> Vec<(WriterRecord, Option<String>)> {
        let state = self.state.read().await;
        state
            .writers
            .values()
            .cloned()
            .map(|w| {
                let username = state
                    .metadata
                    .get(&format!("profile:{}", hex::encode(w.key)))
                    .and_then(|m| m.value.get("username"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                (w, username)
            })
            .collect()
    }

    pub async fn current_invite(&self) -> Option<InviteRecord> {
        self.state.read().await.invite.clone()
    }

    pub async fn room_info(&self) -> Option<RoomInfo> {
        self.state.read().await.room.clone()
    }

    pub async fn message_count(&self) -> u64 {
        self.state.read().await.room.as_ref().map(|r| r.message_count).unwrap_or(0)
    }

    pub async fn get_message(&self, id: &str) -> Option<Message> {
        let state = self.state.read().await;
        if state.tombstones.contains(id) {
            return None;
        }
        state.messages.get(id).cloned()
    }

    pub async fn metadata(&self, id: &str) -> Option<MetadataRecord> {
        self.state.read().await.metadata.get(id).cloned()
    }

    pub async fn drive_metadata(&self, id: &str) -> Option<DriveMetadataRecord> {
        self.state.read().await.drive_metadata.get(id).cloned()
    }

    /// Range-scans the timestamp index, per spec §4.3's `getMessages`
    /// semantics: bounds are applied as given, ties broken by `id`
    /// lexicographically, stop after `limit`, direction from `reverse`.
    pub async fn get_messages(&self, query: &MessageQuery) -> Vec<Message> {
        let state = self.state.read().await;
        // `gt`/`lt` must exclude every id at the boundary timestamp, not just
        // the empty string, so the excluded endpoint has to sort *after*
        // every real id tied at that timestamp (`char::MAX`), while `gte`/
        // `lte` must include every id at the boundary timestamp, so the
        // included endpoint has to sort *before* every real id (`""`).
        let lower = match (query.gt, query.gte) {
            (Some(gt), _) => std::ops::Bound::Excluded((gt, String::from(char::MAX))),
            (None, Some(gte)) => std::ops::Bound::Included((gte, String::new())),
            (None, None) => std::ops::Bound::Unbounded,
        };
        let upper = match (query.lt, query.lte) {
            (Some(lt), _) => std::ops::Bound::Excluded((lt, String::new())),
            (None, Some(lte)) => std::ops::Bound::Included((lte, String::from(char::MAX))),
            (None, None) => std::ops::Bound::Unbounded,
        };

        let mut out = Vec::new();
        let range = state.timestamp_index.range((lower, upper));
        let ids: Vec<&String> = if query.reverse {
            range.rev().map(|(_, id)| id).collect()
        } else {
            range.map(|(_, id)| id).collect()
        };
        for id in ids {
            if state.tombstones.contains(id) {
                continue;
            }
            if let Some(msg) = state.messages.get(id) {
                out.push(msg.clone());
                if out.len() >= query.limit {
                    break;
                }
            }
        }
        out
    }
}

impl Default for View {
    fn default() -> Self {
        Self::new()
    }
}

/// A write handle into the view, held for the duration of one linearised
/// batch. Only `apply` constructs one of these.
pub struct ViewTxn<'a> {
    guard: RwLockWriteGuard<'a, ViewState>,
}

impl ViewTxn<'_> {
    /// Mirrors [`View::is_writer`] against the in-progress batch's state,
    /// so authorization checks made mid-batch see writers admitted earlier
    /// in the same batch without re-acquiring the (already held) lock.
    pub fn is_writer(&self, key: &[u8; 32], at_position: u64) -> bool {
        match self.guard.writers.get(key) {
            None => false,
            Some(rec) => match rec.removed_at {
                None => true,
                Some(removed_at) => at_position < removed_at,
            },
        }
    }

    pub fn add_writer(&mut self, key: [u8; 32]) {
        self.guard.writers.entry(key).or_insert(WriterRecord { key, removed_at: None });
    }

    pub fn remove_writer(&mut self, key: [u8; 32], at_position: u64) {
        if let Some(rec) = self.guard.writers.get_mut(&key) {
            rec.removed_at.get_or_insert(at_position);
        }
    }

    pub fn add_invite(&mut self, invite: InviteRecord) -> Result<(), ViewError> {
        if self.guard.invite.is_some() {
            return Err(ViewError::InviteAlreadyExists);
        }
        self.guard.invite = Some(invite);
        Ok(())
    }

    pub fn delete_invite(&mut self) {
        self.guard.invite = None;
    }

    pub fn ensure_room(&mut self, id: String, name: String, created_at: u64) {
        self.guard.room.get_or_insert(RoomInfo {
            id,
            name,
            created_at,
            message_count: 0,
            drive_key: None,
        });
    }

    pub fn insert_message(&mut self, msg: Message) {
        self.guard
            .timestamp_index
            .insert((msg.timestamp, msg.id.clone()), msg.id.clone());
        self.guard.messages.insert(msg.id.clone(), msg);
        if let Some(room) = self.guard.room.as_mut() {
            room.message_count += 1;
        }
    }

    pub fn delete_message(&mut self, id: &str) {
        self.guard.tombstones.insert(id.to_string());
        if let Some(msg) = self.guard.messages.remove(id) {
            self.guard.timestamp_index.remove(&(msg.timestamp, msg.id.clone()));
        }
    }

    pub fn set_metadata(&mut self, id: String, value: serde_json::Value) {
        self.guard.metadata.insert(id.clone(), MetadataRecord { id, value });
    }

    pub fn set_drive_key(&mut self, drive_key: [u8; 32]) -> Result<(), ViewError> {
        let room = self.guard.room.get_or_insert(RoomInfo {
            id: String::new(),
            name: String::new(),
            created_at: 0,
            message_count: 0,
            drive_key: None,
        });
        if room.drive_key.is_some() {
            return Err(ViewError::DriveKeyAlreadySet);
        }
        room.drive_key = Some(drive_key);
        Ok(())
    }

    pub fn set_drive_metadata(&mut self, id: String, value: serde_json::Value) {
        self.guard
            .drive_metadata
            .insert(id.clone(), DriveMetadataRecord { id, value });
    }

    /// Flushes the batch. Dropping a `ViewTxn` without calling `commit`
    /// still releases the lock (mutations already happened in place), but
    /// `commit` is the explicit, testable "flushed at batch end" point
    /// apply calls once per linearised batch.
    pub fn commit(self) {
        drop(self.guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, ts: u64) -> Message {
        Message {
            id: id.into(),
            content: id.into(),
            sender: "alice".into(),
            public_key: [1; 32],
            timestamp: ts,
            system: false,
            received: true,
        }
    }

    #[tokio::test]
    async fn range_query_matches_s4() {
        let view = View::new();
        {
            let mut txn = view.begin_txn().await;
            txn.ensure_room("r1".into(), "general".into(), 0);
            for (id, ts) in [("a", 10), ("b", 20), ("c", 30), ("d", 40), ("e", 50)] {
                txn.insert_message(msg(id, ts));
            }
            txn.commit();
        }

        let query = MessageQuery {
            gte: Some(20),
            lt: Some(50),
            reverse: false,
            limit: 10,
            ..Default::default()
        };
        let results = view.get_messages(&query).await;
        let timestamps: Vec<u64> = results.iter().map(|m| m.timestamp).collect();
        assert_eq!(timestamps, vec![20, 30, 40]);
    }

    #[tokio::test]
    async fn default_query_is_newest_first_limit_51() {
        let view = View::new();
        {
            let mut txn = view.begin_txn().await;
            txn.ensure_room("r1".into(), "general".into(), 0);
            txn.insert_message(msg("hello", 1000));
            txn.insert_message(msg("world", 2000));
            txn.commit();
        }
        let results = view.get_messages(&Default::default()).await;
        assert_eq!(results[0].content, "world");
        assert_eq!(results[1].content, "hello");
        assert_eq!(view.message_count().await, 2);
    }

    #[tokio::test]
    async fn tombstone_hides_message_and_reapply_is_stable() {
        let view = View::new();
        {
            let mut txn = view.begin_txn().await;
            txn.ensure_room("r1".into(), "general".into(), 0);
            txn.insert_message(msg("m1", 10));
            txn.commit();
        }
        {
            let mut txn = view.begin_txn().await;
            txn.delete_message("m1");
            txn.commit();
        }
        assert!(view.get_message("m1").await.is_none());
        let results = view.get_messages(&Default::default()).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn writer_authority_is_non_retroactive() {
        let view = View::new();
        let key = [7u8; 32];
        {
            let mut txn = view.begin_txn().await;
            txn.add_writer(key);
            txn.commit();
        }
        assert!(view.is_writer(&key, 5).await);
        {
            let mut txn = view.begin_txn().await;
            txn.remove_writer(key, 10);
            txn.commit();
        }
        assert!(view.is_writer(&key, 9).await, "records before removal stay valid");
        assert!(!view.is_writer(&key, 10).await, "records at/after removal are rejected");
    }

    #[tokio::test]
    async fn invite_uniqueness_requires_delete_first() {
        let view = View::new();
        let invite = InviteRecord {
            id: vec![1],
            invite: vec![2],
            public_key: [0; 32],
            expires: 0,
        };
        {
            let mut txn = view.begin_txn().await;
            txn.add_invite(invite.clone()).unwrap();
            let err = txn.add_invite(invite.clone()).unwrap_err();
            assert!(matches!(err, ViewError::InviteAlreadyExists));
            txn.commit();
        }
        {
            let mut txn = view.begin_txn().await;
            txn.delete_invite();
            txn.add_invite(invite).unwrap();
            txn.commit();
        }
        assert!(view.current_invite().await.is_some());
    }
}
