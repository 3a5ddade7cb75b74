// Inbound stream, reconnect catch-up and remote paging.

use std::collections::BTreeSet;

use super::message_store::MergeOutcome;
use super::*;
use crate::bridge::{
    CatchUpResult, LiveEvent, PageResult, SequenceGap, ServerMessage, SinceMarker,
    TransportError,
};
use crate::error::SyncError;
use crate::state::Connectivity;

/// Resolves the bearer credential for one transport call. No provider means the transport
/// does not need one; a provider that has nothing right now is a transient failure.
pub(super) fn bearer(
    provider: Option<&dyn CredentialProvider>,
) -> Result<Option<String>, TransportError> {
    match provider {
        None => Ok(None),
        Some(p) => p.bearer_token().map(Some).ok_or_else(|| TransportError::Transient {
            reason: "credential unavailable".to_string(),
        }),
    }
}

impl AppCore {
    pub(super) fn handle_live_event(&mut self, event: LiveEvent) {
        match event {
            LiveEvent::Message { message } => {
                if self.check_sequence_gap(&message) {
                    self.ingest_live_message(message);
                }
            }
            LiveEvent::Ack {
                client_temp_id,
                message,
            } => {
                if self.check_sequence_gap(&message) {
                    let conversation_id = message.conversation_id.clone();
                    self.apply_confirmation(&conversation_id, &client_temp_id, message);
                }
            }
            LiveEvent::Connectivity { connected } => self.set_connected(connected),
        }
    }

    fn ingest_live_message(&mut self, message: ServerMessage) {
        let conversation_id = message.conversation_id.clone();
        let temp = message.client_temp_id.clone();
        let outcome = self.store_mut(&conversation_id).merge_confirmed(message);
        if outcome == MergeOutcome::Collapsed {
            if let Some(temp) = temp.as_deref() {
                self.outbox.remove(temp);
            }
        }
        if outcome.changed() {
            self.touch(&conversation_id);
        }
    }

    /// Folds a server confirmation into the local entry for `client_temp_id`, or merges it by
    /// id when no local entry is left.
    pub(super) fn apply_confirmation(
        &mut self,
        conversation_id: &str,
        client_temp_id: &str,
        message: ServerMessage,
    ) {
        let store = self.store_mut(conversation_id);
        let outcome = match store.reconcile_confirmed(client_temp_id, message.clone()) {
            MergeOutcome::Unchanged => store.merge_confirmed(message),
            collapsed => collapsed,
        };
        self.outbox.remove(client_temp_id);
        tracing::debug!(conversation_id, client_temp_id, ?outcome, "confirmation applied");
        if outcome.changed() {
            self.touch(conversation_id);
        }
    }

    /// Returns false when the event must be dropped. A skipped sequence is reported to the
    /// transport; the event itself is still applied.
    fn check_sequence_gap(&mut self, message: &ServerMessage) -> bool {
        if message.conversation_id.is_empty() || message.id.is_empty() {
            tracing::warn!("live event without conversation or message id dropped");
            return false;
        }
        let Some(newest) = self
            .stores
            .get(&message.conversation_id)
            .and_then(|s| s.newest_confirmed_sequence())
        else {
            return true;
        };
        if message.sequence <= newest.saturating_add(1) {
            return true;
        }

        let err = SyncError::GapDetected {
            conversation_id: message.conversation_id.clone(),
            newest_known: newest,
            received: message.sequence,
        };
        tracing::warn!(%err, "live stream gap");
        if let Some(transport) = self.transport() {
            let gap = SequenceGap {
                conversation_id: message.conversation_id.clone(),
                newest_known: newest,
                received: message.sequence,
            };
            self.runtime.spawn_blocking(move || transport.gap_detected(gap));
        }
        true
    }

    fn set_connected(&mut self, connected: bool) {
        let was_connected = self.state.connectivity.is_connected();
        if connected == was_connected {
            return;
        }
        if connected {
            tracing::info!("transport connected");
            self.start_catch_up();
        } else {
            tracing::info!("transport disconnected");
            self.state.connectivity = Connectivity::Offline;
            // A catch-up still running belongs to the old connection.
            self.catch_up_in_flight = false;
            self.catch_up_dirty = false;
            self.catch_up_token += 1;
            for conversation_id in self.fetch_tokens.keys().cloned().collect::<Vec<_>>() {
                self.cancel_page_fetch(&conversation_id);
            }
        }
        self.state_changed = true;
    }

    /// Fetches everything newer than each conversation's newest confirmed sequence.
    pub(super) fn start_catch_up(&mut self) {
        if self.catch_up_in_flight {
            self.catch_up_dirty = true;
            return;
        }
        let Some(transport) = self.transport() else {
            self.finish_catch_up();
            return;
        };
        self.state.connectivity = Connectivity::Syncing;
        self.state_changed = true;

        let ids: BTreeSet<String> = self
            .index
            .conversation_ids()
            .cloned()
            .chain(self.stores.keys().cloned())
            .collect();
        let markers: Vec<SinceMarker> = ids
            .into_iter()
            .map(|conversation_id| SinceMarker {
                // An evicted window still knows how far it had synced.
                since_sequence: self
                    .stores
                    .get(&conversation_id)
                    .and_then(|s| s.newest_confirmed_sequence().or(s.purged_through())),
                conversation_id,
            })
            .collect();

        self.catch_up_token += 1;
        self.catch_up_in_flight = true;
        let token = self.catch_up_token;
        tracing::info!(conversations = markers.len(), token, "catch-up started");

        let credentials = self.credential_provider();
        let tx = self.core_sender.clone();
        self.runtime.spawn_blocking(move || {
            let result = match bearer(credentials.as_deref()) {
                Ok(credential) => transport.fetch_since(markers, credential),
                Err(error) => CatchUpResult::Failed { error },
            };
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::CatchUpFetched {
                token,
                result,
            })));
        });
    }

    pub(super) fn handle_catch_up(&mut self, token: u64, result: CatchUpResult) {
        if !self.catch_up_in_flight || token != self.catch_up_token {
            tracing::debug!(token, "stale catch-up result dropped");
            return;
        }
        self.catch_up_in_flight = false;

        match result {
            CatchUpResult::Conversations { conversations } => {
                let count = conversations.len();
                for delta in conversations {
                    let id = delta.conversation_id;
                    let mut changed =
                        self.index
                            .upsert_meta(&id, delta.title, delta.participant_avatars);
                    if let Some(marker) = delta.last_read_sequence {
                        changed |= self.index.adopt_read_marker(&id, marker);
                    }
                    let mut collapsed = Vec::new();
                    let store = self.store_mut(&id);
                    for message in delta.messages {
                        if message.conversation_id != id {
                            continue;
                        }
                        let temp = message.client_temp_id.clone();
                        match store.merge_confirmed(message) {
                            MergeOutcome::Collapsed => {
                                changed = true;
                                collapsed.extend(temp);
                            }
                            outcome => changed |= outcome.changed(),
                        }
                    }
                    for temp in collapsed {
                        self.outbox.remove(&temp);
                    }
                    if changed {
                        self.touch(&id);
                    }
                }
                tracing::info!(conversations = count, "catch-up applied");
            }
            CatchUpResult::Failed { error } => {
                let err = SyncError::from(error);
                tracing::warn!(%err, "catch-up failed");
            }
        }

        if self.catch_up_dirty {
            self.catch_up_dirty = false;
            self.start_catch_up();
            return;
        }
        self.finish_catch_up();
    }

    fn finish_catch_up(&mut self) {
        if self.state.connectivity != Connectivity::Online {
            self.state.connectivity = Connectivity::Online;
            self.state_changed = true;
        }
        self.flush_outbox();
    }

    /// Starts a remote page fetch; any earlier fetch for the conversation is superseded.
    pub(super) fn request_page(
        &mut self,
        conversation_id: &str,
        before_sequence: Option<u64>,
        limit: u32,
    ) {
        if !self.state.connectivity.is_connected() {
            tracing::debug!(conversation_id, "offline; remote page skipped");
            return;
        }
        let Some(transport) = self.transport() else {
            return;
        };
        self.next_fetch_token += 1;
        let token = self.next_fetch_token;
        self.fetch_tokens.insert(conversation_id.to_string(), token);
        self.loading_older.insert(conversation_id.to_string());
        self.state_changed = true;

        let credentials = self.credential_provider();
        let tx = self.core_sender.clone();
        let conversation_id = conversation_id.to_string();
        self.runtime.spawn_blocking(move || {
            let result = match bearer(credentials.as_deref()) {
                Ok(credential) => {
                    transport.fetch_page(conversation_id.clone(), before_sequence, limit, credential)
                }
                Err(error) => PageResult::Failed { error },
            };
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::PageFetched {
                conversation_id,
                token,
                before_sequence,
                limit,
                result,
            })));
        });
    }

    pub(super) fn cancel_page_fetch(&mut self, conversation_id: &str) {
        if let Some(token) = self.fetch_tokens.remove(conversation_id) {
            tracing::debug!(conversation_id, token, "page fetch cancelled");
        }
        if self.loading_older.remove(conversation_id) {
            self.state_changed = true;
        }
    }

    pub(super) fn handle_page_fetched(
        &mut self,
        conversation_id: &str,
        token: u64,
        before_sequence: Option<u64>,
        limit: u32,
        result: PageResult,
    ) {
        if self.fetch_tokens.get(conversation_id) != Some(&token) {
            tracing::debug!(conversation_id, token, "cancelled page dropped");
            return;
        }
        self.fetch_tokens.remove(conversation_id);
        self.loading_older.remove(conversation_id);
        self.state_changed = true;

        let messages = match result {
            PageResult::Messages { messages } => messages,
            PageResult::Failed { error } => {
                let err = SyncError::from(error);
                tracing::warn!(%err, conversation_id, "page fetch failed");
                self.toast("Couldn't load older messages");
                return;
            }
        };

        let received = messages.len();
        let oldest = messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .map(|m| m.sequence)
            .min();
        let mut collapsed = Vec::new();
        let store = self.store_mut(conversation_id);
        store.absorb_page(before_sequence, oldest, received < limit as usize);
        for message in messages {
            if message.conversation_id != conversation_id {
                continue;
            }
            let temp = message.client_temp_id.clone();
            if store.merge_confirmed(message) == MergeOutcome::Collapsed {
                collapsed.extend(temp);
            }
        }
        for temp in collapsed {
            self.outbox.remove(&temp);
        }
        if let Some(oldest) = oldest {
            self.lower_view_floor(conversation_id, oldest);
        }
        tracing::debug!(conversation_id, received, "page merged");
        self.touch(conversation_id);
    }
}
