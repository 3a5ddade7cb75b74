use crate::bridge::{CatchUpResult, LiveEvent, PageResult, SendOutcome};
use crate::state::AppState;
use crate::AppAction;

#[derive(uniffi::Enum, Clone, Debug)]
pub enum AppUpdate {
    FullState(AppState),
    /// Side-effect update for failures the user should see right away (the message itself
    /// stays in the snapshot as `Failed`).
    DeliveryFailed {
        rev: u64,
        conversation_id: String,
        client_temp_id: String,
        reason: String,
        permanent: bool,
    },
}

impl AppUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            AppUpdate::FullState(s) => s.rev,
            AppUpdate::DeliveryFailed { rev, .. } => *rev,
        }
    }
}

#[derive(Debug)]
pub enum CoreMsg {
    Action(AppAction),
    Internal(Box<InternalEvent>),
}

#[derive(Debug)]
pub enum InternalEvent {
    // Inbound stream
    Live(LiveEvent),

    // Async results
    SendCompleted {
        conversation_id: String,
        client_temp_id: String,
        attempt: u32,
        outcome: SendOutcome,
    },
    SendTimedOut {
        conversation_id: String,
        client_temp_id: String,
        attempt: u32,
    },
    RetryDue {
        conversation_id: String,
        client_temp_id: String,
        attempt: u32,
    },
    PageFetched {
        conversation_id: String,
        token: u64,
        before_sequence: Option<u64>,
        limit: u32,
        result: PageResult,
    },
    CatchUpFetched {
        token: u64,
        result: CatchUpResult,
    },
}
