use std::sync::{Arc, RwLock};

/// A message as the server knows it.
#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct ServerMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    pub created_at_ms: i64,
    pub sequence: u64,
    pub revision: u32,
    /// Delivery receipt: the sender's temp id, echoed back so the sending device can collapse
    /// its optimistic copy.
    pub client_temp_id: Option<String>,
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub conversation_id: String,
    pub client_temp_id: String,
    pub sender_id: String,
    pub body: String,
    pub created_at_ms: i64,
}

#[derive(uniffi::Enum, Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    /// Worth retrying (timeouts, dropped sockets, expired credentials).
    Transient { reason: String },
    /// Retrying will not help (blocked recipient, rejected content).
    Permanent { reason: String },
}

#[derive(uniffi::Enum, Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Server stored the message and assigned its id and sequence.
    Confirmed { message: ServerMessage },
    /// Transport took the message; the server ack will arrive as a live event.
    Accepted,
    Failed { error: TransportError },
}

#[derive(uniffi::Enum, Clone, Debug, PartialEq, Eq)]
pub enum PageResult {
    Messages { messages: Vec<ServerMessage> },
    Failed { error: TransportError },
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct SinceMarker {
    pub conversation_id: String,
    /// Highest confirmed sequence known locally; `None` when nothing is loaded yet.
    pub since_sequence: Option<u64>,
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct ConversationDelta {
    pub conversation_id: String,
    pub title: Option<String>,
    pub participant_avatars: Vec<String>,
    /// Read marker the server holds for this user, if it tracks one.
    pub last_read_sequence: Option<u64>,
    pub messages: Vec<ServerMessage>,
}

#[derive(uniffi::Enum, Clone, Debug, PartialEq, Eq)]
pub enum CatchUpResult {
    Conversations { conversations: Vec<ConversationDelta> },
    Failed { error: TransportError },
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct SequenceGap {
    pub conversation_id: String,
    pub newest_known: u64,
    pub received: u64,
}

#[derive(uniffi::Enum, Clone, Debug, PartialEq, Eq)]
pub enum LiveEvent {
    Message { message: ServerMessage },
    /// Server ack for one of our sends, delivered on the event stream instead of the send call.
    Ack {
        client_temp_id: String,
        message: ServerMessage,
    },
    Connectivity { connected: bool },
}

impl LiveEvent {
    pub fn tag(&self) -> &'static str {
        match self {
            LiveEvent::Message { .. } => "Message",
            LiveEvent::Ack { .. } => "Ack",
            LiveEvent::Connectivity { .. } => "Connectivity",
        }
    }
}

/// Platform transport. Calls are made from runtime worker threads and may block.
#[uniffi::export(callback_interface)]
pub trait TransportBridge: Send + Sync + 'static {
    fn send(&self, message: OutgoingMessage, credential: Option<String>) -> SendOutcome;
    fn fetch_page(
        &self,
        conversation_id: String,
        before_sequence: Option<u64>,
        limit: u32,
        credential: Option<String>,
    ) -> PageResult;
    fn fetch_since(&self, markers: Vec<SinceMarker>, credential: Option<String>) -> CatchUpResult;
    /// Live events skipped sequence numbers; the transport decides how to catch up.
    fn gap_detected(&self, gap: SequenceGap);
}

/// Auth/session collaborator. `None` means no usable credential right now.
#[uniffi::export(callback_interface)]
pub trait CredentialProvider: Send + Sync + 'static {
    fn bearer_token(&self) -> Option<String>;
}

pub type SharedTransportBridge = Arc<RwLock<Option<Arc<dyn TransportBridge>>>>;
pub type SharedCredentialProvider = Arc<RwLock<Option<Arc<dyn CredentialProvider>>>>;

pub(crate) fn current<T: ?Sized>(slot: &RwLock<Option<Arc<T>>>) -> Option<Arc<T>> {
    match slot.read() {
        Ok(g) => g.clone(),
        Err(poison) => poison.into_inner().clone(),
    }
}

pub(crate) fn install<T: ?Sized>(slot: &RwLock<Option<Arc<T>>>, value: Arc<T>) {
    match slot.write() {
        Ok(mut g) => *g = Some(value),
        Err(poison) => *poison.into_inner() = Some(value),
    }
}
