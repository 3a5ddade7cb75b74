#[derive(uniffi::Enum, Debug, Clone, PartialEq, Eq)]
pub enum MessageRef {
    Server { id: String },
    Local { client_temp_id: String },
}

#[derive(uniffi::Enum, Debug, Clone)]
pub enum AppAction {
    // Compose
    Compose {
        conversation_id: String,
        body: String,
    },
    RetryMessage {
        conversation_id: String,
        client_temp_id: String,
    },
    RemoveMessage {
        conversation_id: String,
        message: MessageRef,
    },

    // Navigation
    OpenConversation {
        conversation_id: String,
    },
    CloseConversation,
    LoadOlderMessages {
        conversation_id: String,
        before_sequence: u64,
        limit: u32,
    },

    // Read state
    MarkRead {
        conversation_id: String,
    },

    // Cache
    EvictConversation {
        conversation_id: String,
    },

    // UI
    ClearToast,

    // Lifecycle
    Foregrounded,
}

impl AppAction {
    /// Log-safe action tag (never includes message bodies).
    pub fn tag(&self) -> &'static str {
        match self {
            // Compose
            AppAction::Compose { .. } => "Compose",
            AppAction::RetryMessage { .. } => "RetryMessage",
            AppAction::RemoveMessage { .. } => "RemoveMessage",

            // Navigation
            AppAction::OpenConversation { .. } => "OpenConversation",
            AppAction::CloseConversation => "CloseConversation",
            AppAction::LoadOlderMessages { .. } => "LoadOlderMessages",

            // Read state
            AppAction::MarkRead { .. } => "MarkRead",

            // Cache
            AppAction::EvictConversation { .. } => "EvictConversation",

            // UI
            AppAction::ClearToast => "ClearToast",

            // Lifecycle
            AppAction::Foregrounded => "Foregrounded",
        }
    }
}
