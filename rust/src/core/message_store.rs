// Per-conversation timeline: dedup, ordering, delivery state machine and paging.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::actions::MessageRef;
use crate::bridge::{OutgoingMessage, ServerMessage};
use crate::error::SyncError;
use crate::state::{ChatMessage, DeliveryStatus, MessageDeliveryState, SequenceKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: Option<String>,
    pub client_temp_id: Option<String>,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    pub created_at_ms: i64,
    pub revision: u32,
    pub state: MessageDeliveryState,
    pub sequence_key: SequenceKey,
}

impl StoredMessage {
    fn from_server(m: ServerMessage) -> Self {
        Self {
            id: Some(m.id),
            client_temp_id: m.client_temp_id,
            conversation_id: m.conversation_id,
            sender_id: m.sender_id,
            body: m.body,
            created_at_ms: m.created_at_ms,
            revision: m.revision,
            state: MessageDeliveryState::Confirmed,
            sequence_key: SequenceKey::Confirmed {
                sequence: m.sequence,
            },
        }
    }

    pub fn status(&self) -> DeliveryStatus {
        self.state.status()
    }

    pub fn to_chat_message(&self, local_user_id: &str) -> ChatMessage {
        ChatMessage {
            id: self.id.clone(),
            client_temp_id: self.client_temp_id.clone(),
            conversation_id: self.conversation_id.clone(),
            sender_id: self.sender_id.clone(),
            body: self.body.clone(),
            created_at_ms: self.created_at_ms,
            revision: self.revision,
            is_mine: self.sender_id == local_user_id,
            delivery: self.state.clone(),
            sequence_key: self.sequence_key,
        }
    }

    pub fn to_outgoing(&self) -> Option<OutgoingMessage> {
        Some(OutgoingMessage {
            conversation_id: self.conversation_id.clone(),
            client_temp_id: self.client_temp_id.clone()?,
            sender_id: self.sender_id.clone(),
            body: self.body.clone(),
            created_at_ms: self.created_at_ms,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    /// A local optimistic entry was folded into the confirmed message.
    Collapsed,
    Unchanged,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TempSlot {
    Local(u64),
    Confirmed(String),
}

type ConfirmedKey = (u64, String);

/// Confirmed rows written or deleted since the last [`MessageStore::take_changes`].
#[derive(Debug, Default)]
pub struct StoreChanges {
    pub upserted: Vec<StoredMessage>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MessageStore {
    conversation_id: String,
    // (server sequence, server id) -> message
    confirmed: BTreeMap<ConfirmedKey, StoredMessage>,
    by_id: HashMap<String, u64>,
    // local counter -> pending/sent/failed entry
    local: BTreeMap<u64, StoredMessage>,
    by_temp_id: HashMap<String, TempSlot>,
    next_local_seq: u64,
    purged_through: Option<u64>,
    reached_beginning: bool,
    // server ids touched since the cache was last written
    changed_ids: BTreeSet<String>,
    removed_ids: BTreeSet<String>,
}

impl MessageStore {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            confirmed: BTreeMap::new(),
            by_id: HashMap::new(),
            local: BTreeMap::new(),
            by_temp_id: HashMap::new(),
            next_local_seq: 1,
            purged_through: None,
            reached_beginning: false,
            changed_ids: BTreeSet::new(),
            removed_ids: BTreeSet::new(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty() && self.local.is_empty()
    }

    pub fn confirmed_len(&self) -> usize {
        self.confirmed.len()
    }

    pub fn purged_through(&self) -> Option<u64> {
        self.purged_through
    }

    pub fn reached_beginning(&self) -> bool {
        self.reached_beginning
    }

    pub fn set_reached_beginning(&mut self, reached: bool) {
        self.reached_beginning = reached;
    }

    /// Adds an optimistic entry for a locally composed message.
    pub fn insert_pending(&mut self, msg: &OutgoingMessage) -> Result<SequenceKey, SyncError> {
        if self.by_temp_id.contains_key(&msg.client_temp_id) {
            return Err(SyncError::DuplicateTempId(msg.client_temp_id.clone()));
        }
        let local_seq = self.bump_local_seq();
        let key = SequenceKey::Provisional {
            local_seq,
            created_at_ms: msg.created_at_ms,
        };
        self.local.insert(
            local_seq,
            StoredMessage {
                id: None,
                client_temp_id: Some(msg.client_temp_id.clone()),
                conversation_id: msg.conversation_id.clone(),
                sender_id: msg.sender_id.clone(),
                body: msg.body.clone(),
                created_at_ms: msg.created_at_ms,
                revision: 0,
                state: MessageDeliveryState::Pending,
                sequence_key: key,
            },
        );
        self.by_temp_id
            .insert(msg.client_temp_id.clone(), TempSlot::Local(local_seq));
        Ok(key)
    }

    /// Server confirmed one of our sends. Any local entry for `client_temp_id` (pending, sent,
    /// or failed after a timeout that raced the ack) becomes the confirmed row. Without a local
    /// entry this is a no-op; the caller merges by id instead.
    pub fn reconcile_confirmed(
        &mut self,
        client_temp_id: &str,
        confirmed: ServerMessage,
    ) -> MergeOutcome {
        match self.by_temp_id.get(client_temp_id).cloned() {
            Some(TempSlot::Local(local_seq)) => {
                self.local.remove(&local_seq);
                let mut confirmed = confirmed;
                confirmed.client_temp_id = Some(client_temp_id.to_string());
                self.merge_by_id(confirmed);
                MergeOutcome::Collapsed
            }
            Some(TempSlot::Confirmed(_)) | None => MergeOutcome::Unchanged,
        }
    }

    /// Inserts or updates a confirmed message by server id. A delivery receipt matching a local
    /// entry collapses into it.
    pub fn merge_confirmed(&mut self, confirmed: ServerMessage) -> MergeOutcome {
        if let Some(temp) = confirmed.client_temp_id.clone() {
            if matches!(self.by_temp_id.get(&temp), Some(TempSlot::Local(_))) {
                return self.reconcile_confirmed(&temp, confirmed);
            }
        }
        self.merge_by_id(confirmed)
    }

    fn merge_by_id(&mut self, incoming: ServerMessage) -> MergeOutcome {
        if let Some(&seq) = self.by_id.get(&incoming.id) {
            let key = (seq, incoming.id.clone());
            let Some(existing) = self.confirmed.get(&key) else {
                return MergeOutcome::Unchanged;
            };
            let newer_revision = incoming.revision > existing.revision;
            let moved = incoming.sequence != seq;
            let gained_receipt = existing.client_temp_id.is_none() && incoming.client_temp_id.is_some();
            if !newer_revision && !moved && !gained_receipt {
                return MergeOutcome::Unchanged;
            }

            let Some(mut existing) = self.confirmed.remove(&key) else {
                return MergeOutcome::Unchanged;
            };
            if newer_revision {
                existing.body = incoming.body;
                existing.revision = incoming.revision;
            }
            if gained_receipt {
                existing.client_temp_id = incoming.client_temp_id;
            }
            if let Some(temp) = existing.client_temp_id.clone() {
                self.by_temp_id
                    .insert(temp, TempSlot::Confirmed(incoming.id.clone()));
            }
            existing.sequence_key = SequenceKey::Confirmed {
                sequence: incoming.sequence,
            };
            self.by_id.insert(incoming.id.clone(), incoming.sequence);
            self.changed_ids.insert(incoming.id.clone());
            self.confirmed
                .insert((incoming.sequence, incoming.id), existing);
            self.settle_floor();
            return MergeOutcome::Updated;
        }

        // Below the floor the window has a hole; the row comes back with the page that
        // closes it.
        let sequence = incoming.sequence;
        if self.purged_through.is_some_and(|floor| sequence < floor) {
            return MergeOutcome::Unchanged;
        }
        let id = incoming.id.clone();
        let msg = StoredMessage::from_server(incoming);
        if let Some(temp) = msg.client_temp_id.clone() {
            self.by_temp_id.insert(temp, TempSlot::Confirmed(id.clone()));
        }
        self.by_id.insert(id.clone(), sequence);
        self.removed_ids.remove(&id);
        self.changed_ids.insert(id.clone());
        self.confirmed.insert((sequence, id), msg);
        self.settle_floor();
        MergeOutcome::Inserted
    }

    // A row sitting exactly at the floor extends the loaded window down by one.
    fn settle_floor(&mut self) {
        while let Some(floor) = self.purged_through {
            let present = self
                .confirmed
                .range((floor, String::new())..(floor + 1, String::new()))
                .next()
                .is_some();
            if !present {
                break;
            }
            self.purged_through = floor.checked_sub(1).filter(|s| *s > 0);
        }
    }

    /// Applies what a remote page fetched with cursor `before` says about the window, ahead of
    /// merging its rows. A page joins the window only if it reaches up to the floor; a short
    /// page means the server has nothing older.
    pub fn absorb_page(&mut self, before: Option<u64>, oldest: Option<u64>, short: bool) {
        if let Some(floor) = self.purged_through {
            if before.is_some_and(|b| b <= floor) {
                return;
            }
            self.purged_through = match (short, oldest) {
                (true, _) => None,
                (false, Some(oldest)) => oldest
                    .checked_sub(1)
                    .filter(|s| *s > 0)
                    .map(|s| s.min(floor)),
                (false, None) => Some(floor),
            };
        }
        if short {
            self.reached_beginning = true;
        }
    }

    /// Transport accepted the message; the ack is still outstanding.
    pub fn mark_sent(&mut self, client_temp_id: &str) -> Result<(), SyncError> {
        let entry = self.local_entry_mut(client_temp_id)?;
        match entry.status() {
            DeliveryStatus::Pending => {
                entry.state = MessageDeliveryState::Sent;
                Ok(())
            }
            DeliveryStatus::Sent => Ok(()),
            from => Err(SyncError::InvalidTransition {
                from,
                to: DeliveryStatus::Sent,
            }),
        }
    }

    pub fn mark_failed(
        &mut self,
        client_temp_id: &str,
        reason: impl Into<String>,
        permanent: bool,
    ) -> Result<(), SyncError> {
        let entry = self.local_entry_mut(client_temp_id)?;
        match entry.status() {
            DeliveryStatus::Pending => {
                entry.state = MessageDeliveryState::Failed {
                    reason: reason.into(),
                    permanent,
                };
                Ok(())
            }
            from => Err(SyncError::InvalidTransition {
                from,
                to: DeliveryStatus::Failed,
            }),
        }
    }

    /// The transport accepted the message but the ack never came. Only a `Sent` entry expires;
    /// it fails as transient so it can be retried.
    pub fn expire_sent(
        &mut self,
        client_temp_id: &str,
        reason: impl Into<String>,
    ) -> Result<(), SyncError> {
        let entry = self.local_entry_mut(client_temp_id)?;
        match entry.status() {
            DeliveryStatus::Sent => {
                entry.state = MessageDeliveryState::Failed {
                    reason: reason.into(),
                    permanent: false,
                };
                Ok(())
            }
            from => Err(SyncError::InvalidTransition {
                from,
                to: DeliveryStatus::Failed,
            }),
        }
    }

    /// Failed -> pending, same temp id, re-placed at the bottom of the timeline.
    pub fn retry(&mut self, client_temp_id: &str, now_ms: i64) -> Result<SequenceKey, SyncError> {
        let local_seq = match self.by_temp_id.get(client_temp_id) {
            Some(TempSlot::Local(seq)) => *seq,
            Some(TempSlot::Confirmed(_)) => {
                return Err(SyncError::InvalidTransition {
                    from: DeliveryStatus::Confirmed,
                    to: DeliveryStatus::Pending,
                })
            }
            None => return Err(SyncError::UnknownMessage(client_temp_id.to_string())),
        };
        let from = self
            .local
            .get(&local_seq)
            .map(|m| m.status())
            .ok_or_else(|| SyncError::UnknownMessage(client_temp_id.to_string()))?;
        if from != DeliveryStatus::Failed {
            return Err(SyncError::InvalidTransition {
                from,
                to: DeliveryStatus::Pending,
            });
        }

        let Some(mut entry) = self.local.remove(&local_seq) else {
            return Err(SyncError::UnknownMessage(client_temp_id.to_string()));
        };
        let new_seq = self.bump_local_seq();
        let key = SequenceKey::Provisional {
            local_seq: new_seq,
            created_at_ms: now_ms,
        };
        entry.state = MessageDeliveryState::Pending;
        entry.created_at_ms = now_ms;
        entry.sequence_key = key;
        self.local.insert(new_seq, entry);
        self.by_temp_id
            .insert(client_temp_id.to_string(), TempSlot::Local(new_seq));
        Ok(key)
    }

    /// Explicit local deletion.
    pub fn remove(&mut self, message: &MessageRef) -> Option<StoredMessage> {
        match message {
            MessageRef::Local { client_temp_id } => match self.by_temp_id.get(client_temp_id) {
                Some(TempSlot::Local(seq)) => {
                    let seq = *seq;
                    self.by_temp_id.remove(client_temp_id);
                    self.local.remove(&seq)
                }
                Some(TempSlot::Confirmed(id)) => {
                    let id = id.clone();
                    self.remove_confirmed(&id)
                }
                None => None,
            },
            MessageRef::Server { id } => self.remove_confirmed(id),
        }
    }

    fn remove_confirmed(&mut self, id: &str) -> Option<StoredMessage> {
        let seq = self.by_id.remove(id)?;
        let removed = self.confirmed.remove(&(seq, id.to_string()))?;
        self.changed_ids.remove(id);
        self.removed_ids.insert(id.to_string());
        if let Some(temp) = removed.client_temp_id.as_ref() {
            self.by_temp_id.remove(temp);
        }
        Some(removed)
    }

    /// Up to `limit` confirmed messages strictly older than `before_sequence`, newest first.
    pub fn load_page(
        &self,
        before_sequence: u64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, SyncError> {
        if let Some(floor) = self.purged_through {
            if before_sequence <= floor {
                return Err(SyncError::InvalidCursor {
                    cursor: before_sequence,
                    purged_through: floor,
                });
            }
        }
        Ok(self
            .confirmed
            .range(..(before_sequence, String::new()))
            .rev()
            .take(limit)
            .map(|(_, m)| m.clone())
            .collect())
    }

    /// Drops the whole confirmed window. Local entries stay so no compose is lost.
    pub fn evict_confirmed(&mut self) -> usize {
        let n = self.confirmed.len();
        if let Some(newest) = self.newest_confirmed_sequence() {
            self.purged_through = Some(self.purged_through.map_or(newest, |p| p.max(newest)));
        }
        for (_, m) in std::mem::take(&mut self.confirmed) {
            if let Some(temp) = m.client_temp_id {
                self.by_temp_id.remove(&temp);
            }
        }
        self.by_id.clear();
        self.reached_beginning = false;
        n
    }

    /// Purges the oldest confirmed messages beyond `max`.
    pub fn trim_to(&mut self, max: usize) -> usize {
        let mut trimmed = 0;
        while self.confirmed.len() > max {
            let Some(((seq, id), m)) = self.confirmed.pop_first() else {
                break;
            };
            self.by_id.remove(&id);
            if let Some(temp) = m.client_temp_id {
                self.by_temp_id.remove(&temp);
            }
            self.purged_through = Some(self.purged_through.map_or(seq, |p| p.max(seq)));
            self.reached_beginning = false;
            trimmed += 1;
        }
        trimmed
    }

    pub fn newest_confirmed_sequence(&self) -> Option<u64> {
        self.confirmed.keys().next_back().map(|(seq, _)| *seq)
    }

    pub fn oldest_confirmed_sequence(&self) -> Option<u64> {
        self.confirmed.keys().next().map(|(seq, _)| *seq)
    }

    pub fn local_entry(&self, client_temp_id: &str) -> Option<&StoredMessage> {
        match self.by_temp_id.get(client_temp_id)? {
            TempSlot::Local(seq) => self.local.get(seq),
            TempSlot::Confirmed(_) => None,
        }
    }

    /// Pending, sent and failed entries in local-counter order.
    pub fn local_entries(&self) -> impl Iterator<Item = &StoredMessage> {
        self.local.values()
    }

    pub fn confirmed_entries(&self) -> impl Iterator<Item = &StoredMessage> {
        self.confirmed.values()
    }

    /// Sequences of loaded confirmed messages from other senders newer than the read marker.
    pub fn unread_after<'a>(
        &'a self,
        marker: Option<u64>,
        local_user_id: &'a str,
    ) -> impl Iterator<Item = u64> + 'a {
        let start = marker.map_or(0, |m| m.saturating_add(1));
        self.confirmed
            .range((start, String::new())..)
            .filter(move |(_, m)| m.sender_id != local_user_id)
            .map(|((seq, _), _)| *seq)
    }

    /// Drains the confirmed-row journal. Rows purged by eviction or trimming are not listed;
    /// `purged_through` covers them.
    pub fn take_changes(&mut self) -> StoreChanges {
        let upserted = std::mem::take(&mut self.changed_ids)
            .into_iter()
            .filter_map(|id| {
                let seq = *self.by_id.get(&id)?;
                self.confirmed.get(&(seq, id)).cloned()
            })
            .collect();
        StoreChanges {
            upserted,
            removed: std::mem::take(&mut self.removed_ids).into_iter().collect(),
        }
    }

    /// Puts back changes that could not be written so the next write includes them.
    pub fn requeue_changes(&mut self, changes: StoreChanges) {
        for id in changes.upserted.into_iter().filter_map(|m| m.id) {
            if self.by_id.contains_key(&id) {
                self.changed_ids.insert(id);
            }
        }
        for id in changes.removed {
            if !self.by_id.contains_key(&id) {
                self.removed_ids.insert(id);
            }
        }
    }

    /// Newest entry in display order, pending included.
    pub fn last_message(&self) -> Option<&StoredMessage> {
        let newest_confirmed = self.confirmed.values().next_back();
        let newest_local = self.local.values().max_by_key(|m| self.display_key(m));
        match (newest_confirmed, newest_local) {
            (Some(c), Some(l)) => {
                if self.display_key(l) > self.display_key(c) {
                    Some(l)
                } else {
                    Some(c)
                }
            }
            (c, l) => c.or(l),
        }
    }

    /// The whole window in display order (newest first).
    #[cfg(test)]
    pub fn timeline(&self) -> Vec<StoredMessage> {
        self.timeline_from(None)
    }

    /// Display order, limited to confirmed messages at or above `floor`. Local entries are
    /// always included.
    pub fn timeline_from(&self, floor: Option<u64>) -> Vec<StoredMessage> {
        let start = floor.unwrap_or(0);
        let mut rows: Vec<(DisplayKey, &StoredMessage)> = self
            .confirmed
            .range((start, String::new())..)
            .map(|(_, m)| (self.display_key(m), m))
            .chain(self.local.values().map(|m| (self.display_key(m), m)))
            .collect();
        rows.sort_by(|a, b| b.0.cmp(&a.0));
        rows.into_iter().map(|(_, m)| m.clone()).collect()
    }

    // Confirmed rows sort by sequence. Local rows sit right after the newest confirmed row
    // whose timestamp is not later than theirs, then by local counter.
    fn display_key(&self, m: &StoredMessage) -> DisplayKey {
        match m.sequence_key {
            SequenceKey::Confirmed { sequence } => (sequence, 0, 0),
            SequenceKey::Provisional {
                local_seq,
                created_at_ms,
            } => {
                let anchor = self
                    .confirmed
                    .iter()
                    .rev()
                    .find(|(_, c)| c.created_at_ms <= created_at_ms)
                    .map(|((seq, _), _)| *seq)
                    .unwrap_or(0);
                (anchor, 1, local_seq)
            }
        }
    }

    /// Re-adds a local entry loaded from the cache, keeping its counter.
    pub fn restore_local(&mut self, msg: StoredMessage) -> Result<(), SyncError> {
        let Some(temp) = msg.client_temp_id.clone() else {
            return Err(SyncError::UnknownMessage(
                "cached outbox entry without temp id".into(),
            ));
        };
        if self.by_temp_id.contains_key(&temp) {
            return Err(SyncError::DuplicateTempId(temp));
        }
        let local_seq = match msg.sequence_key {
            SequenceKey::Provisional { local_seq, .. } => local_seq,
            SequenceKey::Confirmed { .. } => self.bump_local_seq(),
        };
        self.next_local_seq = self.next_local_seq.max(local_seq + 1);
        self.by_temp_id.insert(temp, TempSlot::Local(local_seq));
        self.local.insert(local_seq, msg);
        Ok(())
    }

    pub fn restore_purged_through(&mut self, purged_through: Option<u64>) {
        self.purged_through = purged_through;
    }

    fn local_entry_mut(&mut self, client_temp_id: &str) -> Result<&mut StoredMessage, SyncError> {
        match self.by_temp_id.get(client_temp_id) {
            Some(TempSlot::Local(seq)) => self
                .local
                .get_mut(seq)
                .ok_or_else(|| SyncError::UnknownMessage(client_temp_id.to_string())),
            Some(TempSlot::Confirmed(_)) => Err(SyncError::InvalidTransition {
                from: DeliveryStatus::Confirmed,
                to: DeliveryStatus::Failed,
            }),
            None => Err(SyncError::UnknownMessage(client_temp_id.to_string())),
        }
    }

    fn bump_local_seq(&mut self) -> u64 {
        let seq = self.next_local_seq;
        self.next_local_seq += 1;
        seq
    }
}

type DisplayKey = (u64, u8, u64);

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn server_msg(id: &str, seq: u64, sender: &str) -> ServerMessage {
        ServerMessage {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            sender_id: sender.to_string(),
            body: format!("body {id}"),
            created_at_ms: seq as i64 * 1_000,
            sequence: seq,
            revision: 0,
            client_temp_id: None,
        }
    }

    fn outgoing(temp: &str, created_at_ms: i64) -> OutgoingMessage {
        OutgoingMessage {
            conversation_id: "c1".to_string(),
            client_temp_id: temp.to_string(),
            sender_id: "me".to_string(),
            body: "hello".to_string(),
            created_at_ms,
        }
    }

    fn seqs(page: &[StoredMessage]) -> Vec<u64> {
        page.iter()
            .map(|m| m.sequence_key.confirmed().unwrap())
            .collect()
    }

    #[test]
    fn pending_then_reconcile_leaves_single_confirmed_entry() {
        let mut store = MessageStore::new("c1");
        let key = store.insert_pending(&outgoing("T1", 5_000)).unwrap();
        assert!(matches!(key, SequenceKey::Provisional { local_seq: 1, .. }));
        assert_eq!(store.timeline()[0].state, MessageDeliveryState::Pending);

        let mut confirmed = server_msg("M1", 100, "me");
        confirmed.body = "hello".into();
        assert_eq!(
            store.reconcile_confirmed("T1", confirmed),
            MergeOutcome::Collapsed
        );

        let tl = store.timeline();
        assert_eq!(tl.len(), 1);
        assert_eq!(tl[0].id.as_deref(), Some("M1"));
        assert_eq!(tl[0].client_temp_id.as_deref(), Some("T1"));
        assert_eq!(tl[0].state, MessageDeliveryState::Confirmed);
        assert_eq!(tl[0].sequence_key, SequenceKey::Confirmed { sequence: 100 });
    }

    #[test]
    fn reconcile_without_local_entry_is_noop() {
        let mut store = MessageStore::new("c1");
        assert_eq!(
            store.reconcile_confirmed("T9", server_msg("M9", 9, "me")),
            MergeOutcome::Unchanged
        );
        assert!(store.is_empty());
    }

    #[test]
    fn duplicate_temp_id_is_rejected() {
        let mut store = MessageStore::new("c1");
        store.insert_pending(&outgoing("T1", 1)).unwrap();
        assert_eq!(
            store.insert_pending(&outgoing("T1", 2)),
            Err(SyncError::DuplicateTempId("T1".into()))
        );
    }

    #[test]
    fn temp_id_stays_reserved_after_confirmation() {
        let mut store = MessageStore::new("c1");
        store.insert_pending(&outgoing("T1", 1)).unwrap();
        store.reconcile_confirmed("T1", server_msg("M1", 1, "me"));
        assert!(store.insert_pending(&outgoing("T1", 2)).is_err());
    }

    #[test]
    fn merging_same_message_twice_is_idempotent() {
        let mut store = MessageStore::new("c1");
        assert_eq!(
            store.merge_confirmed(server_msg("M2", 7, "bob")),
            MergeOutcome::Inserted
        );
        assert_eq!(
            store.merge_confirmed(server_msg("M2", 7, "bob")),
            MergeOutcome::Unchanged
        );
        assert_eq!(store.confirmed_len(), 1);
    }

    #[test]
    fn live_event_receipt_collapses_pending_entry() {
        let mut store = MessageStore::new("c1");
        store.insert_pending(&outgoing("T1", 1)).unwrap();
        let mut echoed = server_msg("M1", 3, "me");
        echoed.client_temp_id = Some("T1".into());
        assert_eq!(store.merge_confirmed(echoed.clone()), MergeOutcome::Collapsed);
        // The later send ack for the same temp id must not duplicate.
        assert_eq!(
            store.reconcile_confirmed("T1", echoed),
            MergeOutcome::Unchanged
        );
        assert_eq!(store.timeline().len(), 1);
    }

    #[test]
    fn ack_after_receiptless_live_event_does_not_duplicate() {
        let mut store = MessageStore::new("c1");
        store.insert_pending(&outgoing("T1", 1)).unwrap();
        store.merge_confirmed(server_msg("M1", 3, "me"));
        assert_eq!(store.timeline().len(), 2);

        assert_eq!(
            store.reconcile_confirmed("T1", server_msg("M1", 3, "me")),
            MergeOutcome::Collapsed
        );
        let tl = store.timeline();
        assert_eq!(tl.len(), 1);
        assert_eq!(tl[0].client_temp_id.as_deref(), Some("T1"));
    }

    #[test]
    fn newer_revision_replaces_body() {
        let mut store = MessageStore::new("c1");
        store.merge_confirmed(server_msg("M1", 1, "bob"));
        let mut edit = server_msg("M1", 1, "bob");
        edit.body = "edited".into();
        edit.revision = 1;
        assert_eq!(store.merge_confirmed(edit.clone()), MergeOutcome::Updated);

        let mut stale = edit;
        stale.body = "stale".into();
        stale.revision = 0;
        assert_eq!(store.merge_confirmed(stale), MergeOutcome::Unchanged);
        assert_eq!(store.timeline()[0].body, "edited");
        assert_eq!(store.timeline()[0].state, MessageDeliveryState::Confirmed);
    }

    #[test]
    fn failed_requires_retry_to_return_to_pending() {
        let mut store = MessageStore::new("c1");
        store.insert_pending(&outgoing("T1", 1)).unwrap();
        store.mark_failed("T1", "timeout", false).unwrap();

        assert_eq!(
            store.mark_sent("T1"),
            Err(SyncError::InvalidTransition {
                from: DeliveryStatus::Failed,
                to: DeliveryStatus::Sent,
            })
        );
        assert!(store.mark_failed("T1", "again", false).is_err());

        store.retry("T1", 50).unwrap();
        let entry = store.local_entry("T1").unwrap();
        assert_eq!(entry.state, MessageDeliveryState::Pending);
        assert_eq!(entry.created_at_ms, 50);
    }

    #[test]
    fn retry_rejects_pending_and_confirmed() {
        let mut store = MessageStore::new("c1");
        store.insert_pending(&outgoing("T1", 1)).unwrap();
        assert!(matches!(
            store.retry("T1", 2),
            Err(SyncError::InvalidTransition { .. })
        ));
        store.reconcile_confirmed("T1", server_msg("M1", 1, "me"));
        assert_eq!(
            store.retry("T1", 3),
            Err(SyncError::InvalidTransition {
                from: DeliveryStatus::Confirmed,
                to: DeliveryStatus::Pending,
            })
        );
        assert_eq!(
            store.retry("nope", 3),
            Err(SyncError::UnknownMessage("nope".into()))
        );
    }

    #[test]
    fn sent_is_optional_and_confirmable() {
        let mut store = MessageStore::new("c1");
        store.insert_pending(&outgoing("T1", 1)).unwrap();
        store.mark_sent("T1").unwrap();
        store.mark_sent("T1").unwrap();
        assert!(store.mark_failed("T1", "x", false).is_err());
        assert_eq!(store.local_entry("T1").unwrap().state, MessageDeliveryState::Sent);
        assert_eq!(
            store.reconcile_confirmed("T1", server_msg("M1", 1, "me")),
            MergeOutcome::Collapsed
        );
    }

    #[test]
    fn unacknowledged_sent_entry_expires_as_transient_failure() {
        let mut store = MessageStore::new("c1");
        store.insert_pending(&outgoing("T1", 1)).unwrap();
        assert!(store.expire_sent("T1", "no ack").is_err());

        store.mark_sent("T1").unwrap();
        store.expire_sent("T1", "no ack").unwrap();
        assert_eq!(
            store.local_entry("T1").unwrap().state,
            MessageDeliveryState::Failed {
                reason: "no ack".into(),
                permanent: false,
            }
        );
        assert!(store.retry("T1", 9).is_ok());
    }

    #[test]
    fn failed_entry_collapses_when_confirmation_arrives_late() {
        let mut store = MessageStore::new("c1");
        store.insert_pending(&outgoing("T1", 1)).unwrap();
        store.mark_failed("T1", "timed out", false).unwrap();
        let mut echoed = server_msg("M1", 4, "me");
        echoed.client_temp_id = Some("T1".into());
        assert_eq!(store.merge_confirmed(echoed), MergeOutcome::Collapsed);
        assert_eq!(store.timeline().len(), 1);
        assert!(store.local_entry("T1").is_none());
    }

    #[test]
    fn overlapping_pages_stay_strictly_descending() {
        let mut store = MessageStore::new("c1");
        for seq in (30..=40).rev() {
            store.merge_confirmed(server_msg(&format!("M{seq}"), seq, "bob"));
        }
        for seq in (20..=30).rev() {
            store.merge_confirmed(server_msg(&format!("M{seq}"), seq, "bob"));
        }
        let got = seqs(&store.timeline());
        let want: Vec<u64> = (20..=40).rev().collect();
        assert_eq!(got, want);
    }

    #[test]
    fn consecutive_pages_are_gap_and_duplicate_free() {
        let mut store = MessageStore::new("c1");
        for seq in 1..=25 {
            store.merge_confirmed(server_msg(&format!("M{seq}"), seq, "bob"));
        }
        let mut all = Vec::new();
        let mut cursor = 26;
        loop {
            let page = store.load_page(cursor, 10).unwrap();
            if page.is_empty() {
                break;
            }
            cursor = page.last().unwrap().sequence_key.confirmed().unwrap();
            all.extend(seqs(&page));
        }
        let want: Vec<u64> = (1..=25).rev().collect();
        assert_eq!(all, want);
    }

    #[test]
    fn load_page_excludes_pending_entries() {
        let mut store = MessageStore::new("c1");
        store.merge_confirmed(server_msg("M1", 1, "bob"));
        store.insert_pending(&outgoing("T1", 99_000)).unwrap();
        let page = store.load_page(u64::MAX, 10).unwrap();
        assert_eq!(page.len(), 1);
    }

    #[test]
    fn cursor_into_purged_window_is_invalid() {
        let mut store = MessageStore::new("c1");
        for seq in 1..=10 {
            store.merge_confirmed(server_msg(&format!("M{seq}"), seq, "bob"));
        }
        assert_eq!(store.trim_to(4), 6);
        assert_eq!(store.purged_through(), Some(6));
        assert_eq!(
            store.load_page(5, 10),
            Err(SyncError::InvalidCursor {
                cursor: 5,
                purged_through: 6,
            })
        );
        assert_eq!(seqs(&store.load_page(9, 10).unwrap()), vec![8, 7]);

        // Refetched older history moves the floor back down.
        store.merge_confirmed(server_msg("M6", 6, "bob"));
        store.merge_confirmed(server_msg("M5", 5, "bob"));
        assert_eq!(store.purged_through(), Some(4));
        assert!(store.load_page(5, 10).is_ok());
    }

    #[test]
    fn edit_of_purged_message_leaves_floor_alone() {
        let mut store = MessageStore::new("c1");
        for seq in 1..=10 {
            store.merge_confirmed(server_msg(&format!("M{seq}"), seq, "bob"));
        }
        store.trim_to(4);
        assert_eq!(store.purged_through(), Some(6));

        let mut edit = server_msg("M2", 2, "bob");
        edit.revision = 1;
        assert_eq!(store.merge_confirmed(edit), MergeOutcome::Unchanged);
        assert_eq!(store.purged_through(), Some(6));
        assert!(store.load_page(7, 10).unwrap().is_empty());
        assert!(store.load_page(6, 10).is_err());
    }

    #[test]
    fn remote_page_reopens_window_only_when_contiguous() {
        let mut store = MessageStore::new("c1");
        for seq in 1..=10 {
            store.merge_confirmed(server_msg(&format!("M{seq}"), seq, "bob"));
        }
        store.trim_to(4);

        // Fetched below the floor: leaves a hole, so nothing changes.
        store.absorb_page(Some(3), Some(1), true);
        assert_eq!(store.purged_through(), Some(6));
        assert!(!store.reached_beginning());

        // Fetched from the window edge: rows 3..=6 fill it.
        store.absorb_page(Some(7), Some(3), false);
        assert_eq!(store.purged_through(), Some(2));
        for seq in (3..=6).rev() {
            store.merge_confirmed(server_msg(&format!("M{seq}"), seq, "bob"));
        }
        assert_eq!(seqs(&store.load_page(7, 10).unwrap()), vec![6, 5, 4, 3]);
        assert!(store.load_page(3, 10).unwrap().is_empty());

        store.absorb_page(Some(3), Some(1), true);
        assert_eq!(store.purged_through(), None);
        assert!(store.reached_beginning());
    }

    #[test]
    fn journal_lists_written_and_removed_rows_once() {
        let mut store = MessageStore::new("c1");
        store.merge_confirmed(server_msg("M1", 1, "bob"));
        store.merge_confirmed(server_msg("M2", 2, "bob"));
        let changes = store.take_changes();
        assert_eq!(changes.upserted.len(), 2);
        assert!(changes.removed.is_empty());

        // Idempotent merges write nothing.
        store.merge_confirmed(server_msg("M1", 1, "bob"));
        assert!(store.take_changes().upserted.is_empty());

        store.remove(&MessageRef::Server { id: "M2".into() });
        let changes = store.take_changes();
        assert!(changes.upserted.is_empty());
        assert_eq!(changes.removed, vec!["M2".to_string()]);
    }

    #[test]
    fn eviction_keeps_local_entries() {
        let mut store = MessageStore::new("c1");
        store.merge_confirmed(server_msg("M1", 1, "bob"));
        store.merge_confirmed(server_msg("M2", 2, "bob"));
        store.insert_pending(&outgoing("T1", 10_000)).unwrap();
        assert_eq!(store.evict_confirmed(), 2);
        assert_eq!(store.timeline().len(), 1);
        assert!(store.load_page(2, 10).is_err());
        assert!(store.load_page(3, 10).unwrap().is_empty());
    }

    #[test]
    fn pending_sorts_after_newest_older_confirmed_message() {
        let mut store = MessageStore::new("c1");
        store.merge_confirmed(server_msg("M1", 1, "bob")); // t=1000
        store.merge_confirmed(server_msg("M2", 2, "bob")); // t=2000
        store.insert_pending(&outgoing("T1", 2_500)).unwrap();
        store.insert_pending(&outgoing("T2", 2_600)).unwrap();
        // Arrives later but was created after our sends.
        store.merge_confirmed(server_msg("M3", 3, "bob")); // t=3000

        let order: Vec<String> = store
            .timeline()
            .iter()
            .map(|m| m.id.clone().or(m.client_temp_id.clone()).unwrap())
            .collect();
        assert_eq!(order, vec!["M3", "T2", "T1", "M2", "M1"]);
        assert_eq!(
            store.last_message().unwrap().id.as_deref(),
            Some("M3")
        );
    }

    #[test]
    fn pending_is_newest_when_nothing_newer_is_confirmed() {
        let mut store = MessageStore::new("c1");
        store.merge_confirmed(server_msg("M1", 1, "bob"));
        store.insert_pending(&outgoing("T1", 5_000)).unwrap();
        assert_eq!(
            store.last_message().unwrap().client_temp_id.as_deref(),
            Some("T1")
        );
        assert_eq!(store.timeline()[0].client_temp_id.as_deref(), Some("T1"));
    }

    #[test]
    fn unread_counts_only_others_after_marker() {
        let mut store = MessageStore::new("c1");
        for seq in 48..=53 {
            store.merge_confirmed(server_msg(&format!("M{seq}"), seq, "bob"));
        }
        store.merge_confirmed(server_msg("M54", 54, "me"));
        assert_eq!(
            store.unread_after(Some(50), "me").collect::<Vec<_>>(),
            vec![51, 52, 53]
        );
        assert_eq!(store.unread_after(None, "me").count(), 6);
    }

    #[test]
    fn remove_by_either_reference() {
        let mut store = MessageStore::new("c1");
        store.insert_pending(&outgoing("T1", 1)).unwrap();
        store.mark_failed("T1", "blocked", true).unwrap();
        store.merge_confirmed(server_msg("M1", 1, "bob"));

        assert!(store
            .remove(&MessageRef::Local {
                client_temp_id: "T1".into()
            })
            .is_some());
        assert!(store
            .remove(&MessageRef::Server { id: "M1".into() })
            .is_some());
        assert!(store.is_empty());
        // Temp id is free again once the row is gone.
        assert!(store.insert_pending(&outgoing("T1", 2)).is_ok());
    }
}
