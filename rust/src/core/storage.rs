// Store-derived state refresh, paging and cache persistence.

use super::*;
use crate::error::SyncError;
use crate::state::{ConversationViewState, MessageDeliveryState};

impl AppCore {
    pub(super) fn refresh_conversation_list(&mut self) {
        self.state.conversation_list = self.index.ordered();
    }

    pub(super) fn refresh_current_conversation(&mut self, conversation_id: &str) {
        let floor = self.view_floor.get(conversation_id).copied();
        let store = self.stores.get(conversation_id);
        let messages = store
            .map(|s| {
                s.timeline_from(floor)
                    .iter()
                    .map(|m| m.to_chat_message(&self.local_user_id))
                    .collect()
            })
            .unwrap_or_default();
        let can_load_older = store.is_some_and(|s| {
            let hidden_below = match (floor, s.oldest_confirmed_sequence()) {
                (Some(f), Some(oldest)) => oldest < f,
                _ => false,
            };
            hidden_below || !s.reached_beginning()
        });

        self.state.current_conversation = Some(ConversationViewState {
            conversation_id: conversation_id.to_string(),
            title: self.index.meta(conversation_id).and_then(|m| m.title.clone()),
            messages,
            can_load_older,
            loading_older: self.loading_older.contains(conversation_id),
        });
    }

    // Lowest sequence of the newest local page; the view starts there.
    fn newest_page_floor(&self, conversation_id: &str) -> Option<u64> {
        let page_size = self.config.page_size() as usize;
        self.stores
            .get(conversation_id)
            .and_then(|s| s.load_page(u64::MAX, page_size).ok())
            .and_then(|page| page.last().and_then(|m| m.sequence_key.confirmed()))
    }

    pub(super) fn open_conversation(&mut self, conversation_id: &str) {
        if let Some(prev) = self.open_conversation.take() {
            if prev != conversation_id {
                self.cancel_page_fetch(&prev);
                self.view_floor.remove(&prev);
            }
        }
        self.open_conversation = Some(conversation_id.to_string());
        self.state_changed = true;

        match self.newest_page_floor(conversation_id) {
            Some(floor) => {
                self.view_floor.insert(conversation_id.to_string(), floor);
            }
            None => {
                self.view_floor.remove(conversation_id);
            }
        }

        let needs_newest_page = self
            .stores
            .get(conversation_id)
            .map_or(true, |s| s.confirmed_len() == 0 && !s.reached_beginning());
        if needs_newest_page {
            let limit = self.config.page_size();
            self.request_page(conversation_id, None, limit);
        }
    }

    pub(super) fn load_older_messages(
        &mut self,
        conversation_id: &str,
        before_sequence: u64,
        limit: u32,
    ) {
        let loaded = self
            .stores
            .get(conversation_id)
            .map(|s| s.load_page(before_sequence, limit as usize));
        let page = match loaded {
            Some(Ok(page)) => page,
            Some(Err(e @ SyncError::InvalidCursor { .. })) => {
                tracing::warn!(%e, conversation_id, "restarting pagination from newest page");
                self.restart_pagination(conversation_id);
                return;
            }
            Some(Err(e)) => {
                tracing::warn!(%e, conversation_id, "local page load failed");
                return;
            }
            None => Vec::new(),
        };

        let oldest = page.last().and_then(|m| m.sequence_key.confirmed());
        if let Some(oldest) = oldest {
            self.lower_view_floor(conversation_id, oldest);
        }
        self.state_changed = true;

        let reached_beginning = self
            .stores
            .get(conversation_id)
            .is_some_and(|s| s.reached_beginning());
        if page.len() < limit as usize && !reached_beginning {
            self.request_page(
                conversation_id,
                Some(oldest.unwrap_or(before_sequence)),
                limit,
            );
        }
    }

    pub(super) fn restart_pagination(&mut self, conversation_id: &str) {
        self.cancel_page_fetch(conversation_id);
        match self.newest_page_floor(conversation_id) {
            Some(floor) => {
                self.view_floor.insert(conversation_id.to_string(), floor);
            }
            None => {
                self.view_floor.remove(conversation_id);
            }
        }
        self.state_changed = true;
        let limit = self.config.page_size();
        self.request_page(conversation_id, None, limit);
    }

    pub(super) fn lower_view_floor(&mut self, conversation_id: &str, sequence: u64) {
        if self.open_conversation.as_deref() != Some(conversation_id) {
            return;
        }
        self.view_floor
            .entry(conversation_id.to_string())
            .and_modify(|f| *f = (*f).min(sequence))
            .or_insert(sequence);
    }

    pub(super) fn evict_conversation(&mut self, conversation_id: &str) {
        self.cancel_page_fetch(conversation_id);
        let Some(store) = self.stores.get_mut(conversation_id) else {
            return;
        };
        let evicted = store.evict_confirmed();
        tracing::info!(conversation_id, evicted, "conversation window evicted");
        self.touch(conversation_id);
        if self.open_conversation.as_deref() == Some(conversation_id) {
            self.restart_pagination(conversation_id);
        }
    }

    // The open conversation keeps whatever the user scrolled through.
    pub(super) fn trim_inactive_window(&mut self, conversation_id: &str) {
        if self.open_conversation.as_deref() == Some(conversation_id) {
            return;
        }
        let max = self.config.max_window();
        let Some(store) = self.stores.get_mut(conversation_id) else {
            return;
        };
        let trimmed = store.trim_to(max);
        if trimmed > 0 {
            tracing::debug!(conversation_id, trimmed, "window trimmed");
            self.index.recompute(store);
        }
    }

    /// Writes what changed in the conversation since the last write. The store journal is
    /// drained even without a cache so it never grows.
    pub(super) fn persist_conversation(&mut self, conversation_id: &str) {
        let changes = self
            .stores
            .get_mut(conversation_id)
            .map(|s| s.take_changes())
            .unwrap_or_default();
        let Some(conn) = self.cache.as_ref() else {
            return;
        };
        let unread = self.index.unread_sequences(conversation_id);
        let row = cache_db::ConversationRow {
            meta: self.index.meta(conversation_id),
            last_read: self.index.last_read(conversation_id),
            unread: &unread,
        };
        let saved = cache_db::save_conversation(
            conn,
            conversation_id,
            &row,
            self.stores.get(conversation_id),
            &changes,
        );
        if let Err(e) = saved {
            tracing::warn!(%e, conversation_id, "failed to write conversation to message cache");
            if let Some(store) = self.stores.get_mut(conversation_id) {
                store.requeue_changes(changes);
            }
        }
    }

    pub(super) fn restore_from_cache(&mut self) {
        let Some(conn) = self.cache.as_ref() else {
            return;
        };
        let cached = match cache_db::load_all(conn) {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!(%e, "failed to read message cache, starting empty");
                return;
            }
        };
        let conversations = cached.len();
        for c in cached {
            let id = c.conversation_id;
            let mut store = MessageStore::new(id.as_str());
            for m in c.confirmed {
                store.merge_confirmed(m);
            }
            store.restore_purged_through(c.purged_through);
            store.set_reached_beginning(c.reached_beginning);
            // Already on disk.
            store.take_changes();

            for m in c.local {
                let Some(temp) = m.client_temp_id.clone() else {
                    continue;
                };
                let (resume, parked) = match &m.state {
                    MessageDeliveryState::Failed { permanent, .. } => (!permanent, *permanent),
                    _ => (false, false),
                };
                if let Err(e) = store.restore_local(m) {
                    tracing::warn!(%e, conversation_id = %id, "skipping cached outbox entry");
                    continue;
                }
                self.outbox.track(&id, &temp);
                if resume {
                    self.outbox.mark_resume(&temp);
                }
                if parked {
                    self.outbox.park(&temp);
                }
            }

            self.index
                .upsert_meta(&id, c.meta.title, c.meta.participant_avatars);
            if let Some(marker) = c.last_read {
                self.index.adopt_read_marker(&id, marker);
            }
            self.index.restore_unread(&id, c.unread);
            self.index.recompute(&store);
            self.stores.insert(id, store);
        }
        tracing::info!(conversations, outbox = self.outbox.len(), "restored message cache");
    }
}
