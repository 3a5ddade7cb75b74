// Conversation list projection. Updated one conversation at a time.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::Local;

use super::message_store::MessageStore;
use crate::state::{
    list_date_label, preview_text, ConversationSummary, LastMessagePreview, OrderingKey,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationMeta {
    pub title: Option<String>,
    pub participant_avatars: Vec<String>,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    meta: ConversationMeta,
    last_read: Option<u64>,
    // Sequences counted as unread. Dropping rows from the store never shrinks this; only a
    // read marker does.
    unread: BTreeSet<u64>,
    summary: ConversationSummary,
}

#[derive(Debug)]
pub struct ConversationIndex {
    local_user_id: String,
    entries: HashMap<String, IndexEntry>,
    // Newest first; equal keys fall back to conversation id ascending.
    order: BTreeSet<(Reverse<OrderingKey>, String)>,
}

impl ConversationIndex {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            entries: HashMap::new(),
            order: BTreeSet::new(),
        }
    }

    #[cfg(test)]
    pub fn get(&self, conversation_id: &str) -> Option<&ConversationSummary> {
        self.entries.get(conversation_id).map(|e| &e.summary)
    }

    pub fn meta(&self, conversation_id: &str) -> Option<&ConversationMeta> {
        self.entries.get(conversation_id).map(|e| &e.meta)
    }

    pub fn last_read(&self, conversation_id: &str) -> Option<u64> {
        self.entries.get(conversation_id).and_then(|e| e.last_read)
    }

    pub fn unread_sequences(&self, conversation_id: &str) -> Vec<u64> {
        self.entries
            .get(conversation_id)
            .map(|e| e.unread.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Puts back unread sequences persisted with the conversation.
    pub fn restore_unread(
        &mut self,
        conversation_id: &str,
        sequences: impl IntoIterator<Item = u64>,
    ) {
        let entry = self.entry_mut(conversation_id);
        let marker = entry.last_read;
        entry
            .unread
            .extend(sequences.into_iter().filter(|s| marker.map_or(true, |m| *s > m)));
        entry.summary.unread_count = entry.unread.len() as u32;
    }

    /// A message deleted locally no longer counts.
    pub fn forget_unread(&mut self, conversation_id: &str, sequence: u64) {
        if let Some(entry) = self.entries.get_mut(conversation_id) {
            if entry.unread.remove(&sequence) {
                entry.summary.unread_count = entry.unread.len() as u32;
            }
        }
    }

    pub fn conversation_ids(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Summaries in list order.
    pub fn ordered(&self) -> Vec<ConversationSummary> {
        self.order
            .iter()
            .filter_map(|(_, id)| self.entries.get(id).map(|e| e.summary.clone()))
            .collect()
    }

    pub fn upsert_meta(
        &mut self,
        conversation_id: &str,
        title: Option<String>,
        participant_avatars: Vec<String>,
    ) -> bool {
        let mut seen = HashSet::new();
        let avatars: Vec<String> = participant_avatars
            .into_iter()
            .filter(|url| !url.is_empty() && seen.insert(url.clone()))
            .collect();
        let entry = self.entry_mut(conversation_id);
        let next = ConversationMeta {
            title: title.or_else(|| entry.meta.title.clone()),
            participant_avatars: if avatars.is_empty() {
                entry.meta.participant_avatars.clone()
            } else {
                avatars
            },
        };
        if next == entry.meta {
            return false;
        }
        entry.summary.title = next.title.clone();
        entry.summary.participant_avatars = next.participant_avatars.clone();
        entry.meta = next;
        true
    }

    /// Rebuilds the summary for the store's conversation. Cost is independent of every other
    /// conversation.
    pub fn recompute(&mut self, store: &MessageStore) -> bool {
        let conversation_id = store.conversation_id().to_string();
        let local_user_id = self.local_user_id.clone();
        let entry = self.entry_mut(&conversation_id);

        let last = store.last_message();
        let last_message = last.map(|m| LastMessagePreview {
            id: m.id.clone(),
            client_temp_id: m.client_temp_id.clone(),
            preview: preview_text(&m.body),
            timestamp_ms: m.created_at_ms,
            display_timestamp: list_date_label(m.created_at_ms, &Local::now()),
            sequence_key: m.sequence_key,
        });
        let ordering_key = last.map_or_else(OrderingKey::default, |m| OrderingKey {
            timestamp_ms: m.created_at_ms,
            sequence: m
                .sequence_key
                .confirmed()
                .or_else(|| store.newest_confirmed_sequence())
                .unwrap_or(0),
        });
        entry
            .unread
            .extend(store.unread_after(entry.last_read, &local_user_id));
        let unread_count = entry.unread.len() as u32;

        let old_key = entry.summary.ordering_key;
        let changed = entry.summary.last_message != last_message
            || entry.summary.unread_count != unread_count
            || old_key != ordering_key;
        entry.summary.last_message = last_message;
        entry.summary.unread_count = unread_count;
        entry.summary.ordering_key = ordering_key;

        if old_key != ordering_key {
            self.order.remove(&(Reverse(old_key), conversation_id.clone()));
            self.order.insert((Reverse(ordering_key), conversation_id));
        }
        changed
    }

    /// Records the newest confirmed sequence as read; unread drops to zero.
    pub fn mark_read(&mut self, store: &MessageStore) {
        let marker = store.newest_confirmed_sequence();
        let entry = self.entry_mut(store.conversation_id());
        entry.last_read = entry.last_read.max(marker);
        entry.unread.clear();
        entry.summary.unread_count = 0;
        self.recompute(store);
    }

    /// Adopts a read marker reported by the server when it is ahead of ours.
    pub fn adopt_read_marker(&mut self, conversation_id: &str, marker: u64) -> bool {
        let entry = self.entry_mut(conversation_id);
        if entry.last_read.is_some_and(|cur| cur >= marker) {
            return false;
        }
        entry.last_read = Some(marker);
        entry.unread.retain(|seq| *seq > marker);
        entry.summary.unread_count = entry.unread.len() as u32;
        true
    }

    fn entry_mut(&mut self, conversation_id: &str) -> &mut IndexEntry {
        let order = &mut self.order;
        self.entries
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                let summary = ConversationSummary {
                    conversation_id: conversation_id.to_string(),
                    title: None,
                    last_message: None,
                    unread_count: 0,
                    participant_avatars: vec![],
                    ordering_key: OrderingKey::default(),
                };
                order.insert((Reverse(summary.ordering_key), conversation_id.to_string()));
                IndexEntry {
                    meta: ConversationMeta::default(),
                    last_read: None,
                    unread: BTreeSet::new(),
                    summary,
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{OutgoingMessage, ServerMessage};

    fn msg(conversation: &str, id: &str, seq: u64, sender: &str, at: i64) -> ServerMessage {
        ServerMessage {
            id: id.to_string(),
            conversation_id: conversation.to_string(),
            sender_id: sender.to_string(),
            body: format!("text {id}"),
            created_at_ms: at,
            sequence: seq,
            revision: 0,
            client_temp_id: None,
        }
    }

    #[test]
    fn unread_after_mark_read_counts_only_other_senders() {
        let mut store = MessageStore::new("C");
        let mut index = ConversationIndex::new("me");
        for seq in 45..=50 {
            store.merge_confirmed(msg("C", &format!("M{seq}"), seq, "bob", seq as i64));
        }
        index.recompute(&store);
        assert_eq!(index.get("C").unwrap().unread_count, 6);

        index.mark_read(&store);
        assert_eq!(index.get("C").unwrap().unread_count, 0);
        assert_eq!(index.last_read("C"), Some(50));

        for seq in 51..=53 {
            store.merge_confirmed(msg("C", &format!("M{seq}"), seq, "bob", seq as i64));
            index.recompute(&store);
        }
        assert_eq!(index.get("C").unwrap().unread_count, 3);

        store.merge_confirmed(msg("C", "M54", 54, "me", 54));
        index.recompute(&store);
        assert_eq!(index.get("C").unwrap().unread_count, 3);

        // Duplicate delivery does not inflate the count.
        store.merge_confirmed(msg("C", "M53", 53, "bob", 53));
        index.recompute(&store);
        assert_eq!(index.get("C").unwrap().unread_count, 3);
    }

    #[test]
    fn purging_the_window_keeps_unread_count() {
        let mut store = MessageStore::new("C");
        let mut index = ConversationIndex::new("me");
        for seq in 1..=3 {
            store.merge_confirmed(msg("C", &format!("M{seq}"), seq, "bob", seq as i64));
        }
        index.recompute(&store);
        assert_eq!(index.get("C").unwrap().unread_count, 3);

        store.trim_to(1);
        index.recompute(&store);
        assert_eq!(index.get("C").unwrap().unread_count, 3);

        store.evict_confirmed();
        index.recompute(&store);
        assert_eq!(index.get("C").unwrap().unread_count, 3);

        // Refetched rows are the same messages, not new ones.
        store.absorb_page(None, Some(1), true);
        for seq in 1..=3 {
            store.merge_confirmed(msg("C", &format!("M{seq}"), seq, "bob", seq as i64));
        }
        index.recompute(&store);
        assert_eq!(index.get("C").unwrap().unread_count, 3);

        index.mark_read(&store);
        assert_eq!(index.get("C").unwrap().unread_count, 0);
    }

    #[test]
    fn server_read_marker_drops_older_unread() {
        let mut store = MessageStore::new("C");
        let mut index = ConversationIndex::new("me");
        for seq in 1..=5 {
            store.merge_confirmed(msg("C", &format!("M{seq}"), seq, "bob", seq as i64));
        }
        index.recompute(&store);
        store.evict_confirmed();
        assert!(index.adopt_read_marker("C", 3));
        index.recompute(&store);
        assert_eq!(index.unread_sequences("C"), vec![4, 5]);
        assert_eq!(index.get("C").unwrap().unread_count, 2);

        index.forget_unread("C", 5);
        assert_eq!(index.get("C").unwrap().unread_count, 1);
    }

    #[test]
    fn list_is_newest_first_with_id_tiebreak() {
        let mut index = ConversationIndex::new("me");
        let mut a = MessageStore::new("a");
        let mut b = MessageStore::new("b");
        let mut c = MessageStore::new("c");
        a.merge_confirmed(msg("a", "A1", 7, "bob", 1_000));
        b.merge_confirmed(msg("b", "B1", 7, "bob", 1_000));
        c.merge_confirmed(msg("c", "C1", 1, "bob", 2_000));
        index.recompute(&b);
        index.recompute(&c);
        index.recompute(&a);

        let ids: Vec<String> = index
            .ordered()
            .into_iter()
            .map(|s| s.conversation_id)
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);

        b.merge_confirmed(msg("b", "B2", 8, "bob", 3_000));
        index.recompute(&b);
        let ids: Vec<String> = index
            .ordered()
            .into_iter()
            .map(|s| s.conversation_id)
            .collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn pending_message_drives_preview() {
        let mut index = ConversationIndex::new("me");
        let mut store = MessageStore::new("C");
        store.merge_confirmed(msg("C", "M1", 1, "bob", 1_000));
        store
            .insert_pending(&OutgoingMessage {
                conversation_id: "C".into(),
                client_temp_id: "T1".into(),
                sender_id: "me".into(),
                body: "on my way\nsee you".into(),
                created_at_ms: 5_000,
            })
            .unwrap();
        index.recompute(&store);

        let summary = index.get("C").unwrap();
        let last = summary.last_message.as_ref().unwrap();
        assert_eq!(last.preview, "on my way");
        assert_eq!(last.client_temp_id.as_deref(), Some("T1"));
        assert_eq!(
            summary.ordering_key,
            OrderingKey {
                timestamp_ms: 5_000,
                sequence: 1
            }
        );
    }

    #[test]
    fn avatars_are_an_ordered_set() {
        let mut index = ConversationIndex::new("me");
        assert!(index.upsert_meta(
            "C",
            Some("Team".into()),
            vec![
                "https://a/1.png".into(),
                "https://a/2.png".into(),
                "https://a/1.png".into(),
            ],
        ));
        let summary = index.get("C").unwrap();
        assert_eq!(summary.title.as_deref(), Some("Team"));
        assert_eq!(
            summary.participant_avatars,
            vec!["https://a/1.png", "https://a/2.png"]
        );
        assert!(!index.upsert_meta("C", None, vec![]));
    }

    #[test]
    fn server_read_marker_only_moves_forward() {
        let mut index = ConversationIndex::new("me");
        assert!(index.adopt_read_marker("C", 10));
        assert!(!index.adopt_read_marker("C", 8));
        assert_eq!(index.last_read("C"), Some(10));
    }
}
