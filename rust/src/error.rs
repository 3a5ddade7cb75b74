use crate::state::DeliveryStatus;

/// Errors raised by the message store, conversation index and sync paths.
///
/// Transport failures are represented here so the outbox can classify them, but the store and
/// index never produce them: only the send/fetch paths in the coordinator do.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// A client temp id was reused. Temp ids are generated per compose, so this is a bug in
    /// the caller rather than a runtime condition.
    #[error("client temp id already in use: {0}")]
    DuplicateTempId(String),

    /// The pagination cursor points into a window that has been purged from the cache.
    /// Recover by restarting pagination from the newest page.
    #[error("pagination cursor {cursor} references a purged window (floor {purged_through})")]
    InvalidCursor { cursor: u64, purged_through: u64 },

    #[error("transient transport failure: {0}")]
    TransientTransportFailure(String),

    #[error("permanent transport failure: {0}")]
    PermanentTransportFailure(String),

    /// Live events skipped one or more server sequence numbers.
    #[error("sequence gap in {conversation_id}: newest known {newest_known}, received {received}")]
    GapDetected {
        conversation_id: String,
        newest_known: u64,
        received: u64,
    },

    #[error("unknown message: {0}")]
    UnknownMessage(String),

    #[error("invalid delivery transition: {from} -> {to}")]
    InvalidTransition {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    #[error("cache error: {0}")]
    Cache(String),
}

impl SyncError {
    /// Whether the outbox may retry automatically after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientTransportFailure(_))
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Cache(e.to_string())
    }
}

impl From<crate::bridge::TransportError> for SyncError {
    fn from(e: crate::bridge::TransportError) -> Self {
        match e {
            crate::bridge::TransportError::Transient { reason } => {
                Self::TransientTransportFailure(reason)
            }
            crate::bridge::TransportError::Permanent { reason } => {
                Self::PermanentTransportFailure(reason)
            }
        }
    }
}
