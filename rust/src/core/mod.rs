mod cache_db;
mod config;
mod conversation_index;
mod message_store;
mod outbox;
mod storage;
mod sync;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use flume::Sender;

use crate::actions::AppAction;
use crate::bridge::{
    current, CredentialProvider, SharedCredentialProvider, SharedTransportBridge,
    TransportBridge,
};
use crate::state::{now_millis, AppState};
use crate::updates::{AppUpdate, CoreMsg, InternalEvent};

use conversation_index::ConversationIndex;
use message_store::MessageStore;
use outbox::Outbox;

pub use config::default_app_config_json;

pub struct AppCore {
    pub state: AppState,
    rev: u64,
    last_outgoing_ts: i64,

    update_sender: Sender<AppUpdate>,
    core_sender: Sender<CoreMsg>,
    shared_state: Arc<RwLock<AppState>>,
    transport: SharedTransportBridge,
    credentials: SharedCredentialProvider,

    local_user_id: String,
    config: config::AppConfig,
    runtime: tokio::runtime::Runtime,
    cache: Option<rusqlite::Connection>,

    // conversation_id -> timeline
    stores: HashMap<String, MessageStore>,
    index: ConversationIndex,
    outbox: Outbox,

    // Open conversation + the lowest confirmed sequence currently shown in it.
    open_conversation: Option<String>,
    view_floor: HashMap<String, u64>,
    loading_older: HashSet<String>,

    // conversation_id -> token of the page fetch allowed to land
    fetch_tokens: HashMap<String, u64>,
    next_fetch_token: u64,

    catch_up_in_flight: bool,
    catch_up_dirty: bool,
    catch_up_token: u64,

    // Conversations mutated during the current message; persisted + re-projected once.
    dirty: HashSet<String>,
    state_changed: bool,
}

impl AppCore {
    pub fn new(
        update_sender: Sender<AppUpdate>,
        core_sender: Sender<CoreMsg>,
        data_dir: String,
        local_user_id: String,
        shared_state: Arc<RwLock<AppState>>,
        transport: SharedTransportBridge,
        credentials: SharedCredentialProvider,
    ) -> Self {
        let config = config::load_app_config(&data_dir);
        let state = AppState::empty(local_user_id.clone());

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .build()
            .expect("tokio runtime");

        let cache = if config::cache_enabled(&config) {
            match cache_db::open_cache_db(&data_dir) {
                Ok(conn) => Some(conn),
                Err(e) => {
                    tracing::warn!("message cache unavailable, continuing in memory: {e:#}");
                    None
                }
            }
        } else {
            None
        };

        let outbox = Outbox::new(config.retry_policy());
        let mut this = Self {
            state,
            rev: 0,
            last_outgoing_ts: 0,
            update_sender,
            core_sender,
            shared_state,
            transport,
            credentials,
            index: ConversationIndex::new(local_user_id.clone()),
            local_user_id,
            config,
            runtime,
            cache,
            stores: HashMap::new(),
            outbox,
            open_conversation: None,
            view_floor: HashMap::new(),
            loading_older: HashSet::new(),
            fetch_tokens: HashMap::new(),
            next_fetch_token: 0,
            catch_up_in_flight: false,
            catch_up_dirty: false,
            catch_up_token: 0,
            dirty: HashSet::new(),
            state_changed: false,
        };

        this.restore_from_cache();
        this.refresh_conversation_list();

        // Ensure FfiApp.state() has an immediately-available snapshot.
        let snapshot = this.state.clone();
        this.commit_state_snapshot(&snapshot);
        this
    }

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn commit_state_snapshot(&self, snapshot: &AppState) {
        match self.shared_state.write() {
            Ok(mut g) => *g = snapshot.clone(),
            Err(poison) => *poison.into_inner() = snapshot.clone(),
        }
    }

    fn emit_state(&mut self) {
        self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::FullState(snapshot));
    }

    fn emit_delivery_failed(
        &mut self,
        conversation_id: &str,
        client_temp_id: &str,
        reason: String,
        permanent: bool,
    ) {
        let rev = self.next_rev();
        // Keep snapshot rev in sync with the update stream even though this is a side-effect update.
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::DeliveryFailed {
            rev,
            conversation_id: conversation_id.to_string(),
            client_temp_id: client_temp_id.to_string(),
            reason,
            permanent,
        });
    }

    fn toast(&mut self, msg: impl Into<String>) {
        // Stays in state until the UI clears it, so rev-gap resyncs still show it.
        self.state.toast = Some(msg.into());
        self.state_changed = true;
    }

    fn transport(&self) -> Option<Arc<dyn TransportBridge>> {
        current(&self.transport)
    }

    fn credential_provider(&self) -> Option<Arc<dyn CredentialProvider>> {
        current(&self.credentials)
    }

    fn store_mut(&mut self, conversation_id: &str) -> &mut MessageStore {
        self.stores
            .entry(conversation_id.to_string())
            .or_insert_with(|| MessageStore::new(conversation_id))
    }

    /// Marks a conversation as changed: its summary is recomputed now, the projection and
    /// cache are refreshed when the current message finishes.
    fn touch(&mut self, conversation_id: &str) {
        if let Some(store) = self.stores.get(conversation_id) {
            self.index.recompute(store);
        }
        self.dirty.insert(conversation_id.to_string());
        self.state_changed = true;
    }

    // Rapid composes can share a millisecond; keep outgoing timestamps strictly increasing.
    fn next_outgoing_ts(&mut self) -> i64 {
        let now = now_millis();
        if now <= self.last_outgoing_ts {
            self.last_outgoing_ts += 1;
        } else {
            self.last_outgoing_ts = now;
        }
        self.last_outgoing_ts
    }

    pub fn handle_message(&mut self, msg: CoreMsg) {
        match msg {
            CoreMsg::Action(action) => {
                // Never log `?action` directly: it carries message bodies.
                tracing::info!(action = action.tag(), "dispatch");
                self.handle_action(action);
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
        }
        self.finish_message();
    }

    fn finish_message(&mut self) {
        if self.dirty.is_empty() && !self.state_changed {
            return;
        }
        let dirty: Vec<String> = self.dirty.drain().collect();
        for conversation_id in &dirty {
            self.trim_inactive_window(conversation_id);
            self.persist_conversation(conversation_id);
        }
        self.refresh_conversation_list();
        if let Some(open) = self.open_conversation.clone() {
            self.refresh_current_conversation(&open);
        }
        self.state_changed = false;
        self.emit_state();
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        match internal {
            InternalEvent::Live(event) => {
                tracing::debug!(event = event.tag(), "live_event");
                self.handle_live_event(event);
            }
            InternalEvent::SendCompleted {
                conversation_id,
                client_temp_id,
                attempt,
                outcome,
            } => {
                self.handle_send_completed(&conversation_id, &client_temp_id, attempt, outcome);
            }
            InternalEvent::SendTimedOut {
                conversation_id,
                client_temp_id,
                attempt,
            } => {
                self.handle_send_timed_out(&conversation_id, &client_temp_id, attempt);
            }
            InternalEvent::RetryDue {
                conversation_id,
                client_temp_id,
                attempt,
            } => {
                if self.outbox.is_current(&client_temp_id, attempt) {
                    self.retry_message(&conversation_id, &client_temp_id, false);
                } else {
                    tracing::debug!(%client_temp_id, attempt, "stale retry timer ignored");
                }
            }
            InternalEvent::PageFetched {
                conversation_id,
                token,
                before_sequence,
                limit,
                result,
            } => {
                self.handle_page_fetched(&conversation_id, token, before_sequence, limit, result);
            }
            InternalEvent::CatchUpFetched { token, result } => {
                self.handle_catch_up(token, result);
            }
        }
    }

    fn handle_action(&mut self, action: AppAction) {
        match action {
            AppAction::Compose {
                conversation_id,
                body,
            } => {
                self.compose(&conversation_id, &body);
            }
            AppAction::RetryMessage {
                conversation_id,
                client_temp_id,
            } => {
                self.retry_message(&conversation_id, &client_temp_id, true);
            }
            AppAction::RemoveMessage {
                conversation_id,
                message,
            } => {
                let Some(store) = self.stores.get_mut(&conversation_id) else {
                    return;
                };
                let Some(removed) = store.remove(&message) else {
                    self.toast("Message not found");
                    return;
                };
                if let Some(temp) = removed.client_temp_id.as_deref() {
                    self.outbox.remove(temp);
                }
                if let Some(sequence) = removed.sequence_key.confirmed() {
                    self.index.forget_unread(&conversation_id, sequence);
                }
                tracing::info!(%conversation_id, "message removed");
                self.touch(&conversation_id);
            }
            AppAction::OpenConversation { conversation_id } => {
                self.open_conversation(&conversation_id);
            }
            AppAction::CloseConversation => {
                if let Some(open) = self.open_conversation.take() {
                    self.cancel_page_fetch(&open);
                    self.view_floor.remove(&open);
                    self.loading_older.remove(&open);
                    self.state.current_conversation = None;
                    self.state_changed = true;
                }
            }
            AppAction::LoadOlderMessages {
                conversation_id,
                before_sequence,
                limit,
            } => {
                self.load_older_messages(&conversation_id, before_sequence, limit.max(1));
            }
            AppAction::MarkRead { conversation_id } => {
                let Some(store) = self.stores.get(&conversation_id) else {
                    return;
                };
                self.index.mark_read(store);
                self.touch(&conversation_id);
            }
            AppAction::EvictConversation { conversation_id } => {
                self.evict_conversation(&conversation_id);
            }
            AppAction::ClearToast => {
                if self.state.toast.is_some() {
                    self.state.toast = None;
                    self.state_changed = true;
                }
            }
            AppAction::Foregrounded => {
                // Native sends lifecycle signals as actions; Rust decides whether to resync.
                if self.state.connectivity.is_connected() {
                    self.start_catch_up();
                }
            }
        }
    }
}
