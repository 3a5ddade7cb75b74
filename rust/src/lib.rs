mod actions;
mod bridge;
mod core;
mod error;
mod logging;
mod state;
mod updates;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use flume::{Receiver, Sender};

pub use actions::{AppAction, MessageRef};
pub use bridge::{
    CatchUpResult, ConversationDelta, CredentialProvider, LiveEvent, OutgoingMessage, PageResult,
    SendOutcome, SequenceGap, ServerMessage, SinceMarker, TransportBridge, TransportError,
};
pub use error::SyncError;
pub use state::*;
pub use updates::*;

use crate::bridge::{install, SharedCredentialProvider, SharedTransportBridge};

/// Return the `chatsync_config.json` payload with every default spelled out.
pub fn default_config_json() -> String {
    core::default_app_config_json()
}

uniffi::setup_scaffolding!();

#[uniffi::export(callback_interface)]
pub trait AppReconciler: Send + Sync + 'static {
    fn reconcile(&self, update: AppUpdate);
}

#[derive(uniffi::Object)]
pub struct FfiApp {
    core_tx: Sender<CoreMsg>,
    update_rx: Receiver<AppUpdate>,
    listening: AtomicBool,
    shared_state: Arc<RwLock<AppState>>,
    transport: SharedTransportBridge,
    credentials: SharedCredentialProvider,
}

#[uniffi::export]
impl FfiApp {
    #[uniffi::constructor]
    pub fn new(data_dir: String, local_user_id: String) -> Arc<Self> {
        logging::init_logging(&data_dir);
        tracing::info!(data_dir = %data_dir, local_user_id = %local_user_id, "FfiApp::new() starting");

        let (update_tx, update_rx) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded::<CoreMsg>();
        let shared_state = Arc::new(RwLock::new(AppState::empty(local_user_id.clone())));
        let transport: SharedTransportBridge = Arc::new(RwLock::new(None));
        let credentials: SharedCredentialProvider = Arc::new(RwLock::new(None));

        // Actor loop thread (single threaded "app actor"). Every conversation's mutations are
        // serialized here.
        let core_tx_for_core = core_tx.clone();
        let shared_for_core = shared_state.clone();
        let transport_for_core = transport.clone();
        let credentials_for_core = credentials.clone();
        thread::spawn(move || {
            let mut core = crate::core::AppCore::new(
                update_tx,
                core_tx_for_core,
                data_dir,
                local_user_id,
                shared_for_core,
                transport_for_core,
                credentials_for_core,
            );
            while let Ok(msg) = core_rx.recv() {
                core.handle_message(msg);
            }
        });

        Arc::new(Self {
            core_tx,
            update_rx,
            listening: AtomicBool::new(false),
            shared_state,
            transport,
            credentials,
        })
    }

    pub fn state(&self) -> AppState {
        match self.shared_state.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    pub fn dispatch(&self, action: AppAction) {
        // Contract: never block caller.
        let _ = self.core_tx.send(CoreMsg::Action(action));
    }

    /// Entry point for the platform's inbound stream (messages, acks, connectivity).
    pub fn ingest_live_event(&self, event: LiveEvent) {
        let _ = self
            .core_tx
            .send(CoreMsg::Internal(Box::new(InternalEvent::Live(event))));
    }

    pub fn listen_for_updates(&self, reconciler: Box<dyn AppReconciler>) {
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Avoid multiple listeners that would split messages.
            return;
        }

        let rx = self.update_rx.clone();
        thread::spawn(move || {
            while let Ok(update) = rx.recv() {
                reconciler.reconcile(update);
            }
        });
    }

    pub fn set_transport_bridge(&self, bridge: Box<dyn TransportBridge>) {
        self.set_transport_bridge_arc(Arc::from(bridge));
    }

    pub fn set_credential_provider(&self, provider: Box<dyn CredentialProvider>) {
        self.set_credential_provider_arc(Arc::from(provider));
    }
}

impl FfiApp {
    /// Same as `set_transport_bridge`, for Rust callers that keep a handle to the bridge.
    pub fn set_transport_bridge_arc(&self, bridge: Arc<dyn TransportBridge>) {
        install(&self.transport, bridge);
    }

    pub fn set_credential_provider_arc(&self, provider: Arc<dyn CredentialProvider>) {
        install(&self.credentials, provider);
    }
}
