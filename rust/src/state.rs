use std::fmt;

use chrono::{DateTime, Datelike, TimeZone};

#[derive(uniffi::Record, Clone, Debug)]
pub struct AppState {
    pub rev: u64,
    pub local_user_id: String,
    pub connectivity: Connectivity,
    pub conversation_list: Vec<ConversationSummary>,
    pub current_conversation: Option<ConversationViewState>,
    pub toast: Option<String>,
}

impl AppState {
    pub fn empty(local_user_id: String) -> Self {
        Self {
            rev: 0,
            local_user_id,
            connectivity: Connectivity::Offline,
            conversation_list: vec![],
            current_conversation: None,
            toast: None,
        }
    }
}

#[derive(uniffi::Enum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connectivity {
    Offline,
    /// Transport reported a connection; catch-up fetch still running.
    Syncing,
    Online,
}

impl Connectivity {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Syncing | Self::Online)
    }
}

/// Ordering key for the conversation list. Compared field by field, larger = more recent.
#[derive(uniffi::Record, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderingKey {
    pub timestamp_ms: i64,
    pub sequence: u64,
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct LastMessagePreview {
    pub id: Option<String>,
    pub client_temp_id: Option<String>,
    pub preview: String,
    pub timestamp_ms: i64,
    /// Date shown in the conversation list row.
    pub display_timestamp: String,
    pub sequence_key: SequenceKey,
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub title: Option<String>,
    pub last_message: Option<LastMessagePreview>,
    pub unread_count: u32,
    pub participant_avatars: Vec<String>,
    pub ordering_key: OrderingKey,
}

#[derive(uniffi::Record, Clone, Debug)]
pub struct ConversationViewState {
    pub conversation_id: String,
    pub title: Option<String>,
    /// Newest first.
    pub messages: Vec<ChatMessage>,
    pub can_load_older: bool,
    pub loading_older: bool,
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: Option<String>,
    pub client_temp_id: Option<String>,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    pub created_at_ms: i64,
    pub revision: u32,
    pub is_mine: bool,
    pub delivery: MessageDeliveryState,
    pub sequence_key: SequenceKey,
}

/// Where a message sits in its conversation's timeline.
#[derive(uniffi::Enum, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SequenceKey {
    /// Server-assigned sequence number.
    Confirmed { sequence: u64 },
    /// Local placement for messages the server has not confirmed yet.
    Provisional { local_seq: u64, created_at_ms: i64 },
}

impl SequenceKey {
    pub fn confirmed(&self) -> Option<u64> {
        match self {
            Self::Confirmed { sequence } => Some(*sequence),
            Self::Provisional { .. } => None,
        }
    }
}

#[derive(uniffi::Enum, Clone, Debug, PartialEq, Eq)]
pub enum MessageDeliveryState {
    Pending,
    Sent,
    Failed { reason: String, permanent: bool },
    Confirmed,
}

impl MessageDeliveryState {
    pub fn status(&self) -> DeliveryStatus {
        match self {
            Self::Pending => DeliveryStatus::Pending,
            Self::Sent => DeliveryStatus::Sent,
            Self::Failed { .. } => DeliveryStatus::Failed,
            Self::Confirmed => DeliveryStatus::Confirmed,
        }
    }
}

/// Field-less view of [`MessageDeliveryState`], used in errors and logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
    Confirmed,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Confirmed => "confirmed",
        };
        f.write_str(s)
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `14:05` today, `Mar 4` earlier this year, `2023-11-30` before that.
pub fn list_date_label<Tz: TimeZone>(timestamp_ms: i64, now: &DateTime<Tz>) -> String
where
    Tz::Offset: fmt::Display,
{
    let Some(at) = now.timezone().timestamp_millis_opt(timestamp_ms).single() else {
        return String::new();
    };
    if at.date_naive() == now.date_naive() {
        at.format("%H:%M").to_string()
    } else if at.year() == now.year() {
        at.format("%b %-d").to_string()
    } else {
        at.format("%Y-%m-%d").to_string()
    }
}

/// Single-line preview for the conversation list.
pub fn preview_text(body: &str) -> String {
    const MAX_PREVIEW_CHARS: usize = 120;
    let line = body.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let line = line.trim();
    if line.chars().count() <= MAX_PREVIEW_CHARS {
        return line.to_string();
    }
    let mut out: String = line.chars().take(MAX_PREVIEW_CHARS).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn preview_uses_first_non_blank_line() {
        assert_eq!(preview_text("\n  \nhello there\nsecond"), "hello there");
    }

    #[test]
    fn list_date_label_narrows_with_age() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 18, 30, 0).unwrap();
        let at = |y, m, d, h, min| {
            Utc.with_ymd_and_hms(y, m, d, h, min, 0)
                .unwrap()
                .timestamp_millis()
        };
        assert_eq!(list_date_label(at(2024, 6, 15, 9, 5), &now), "09:05");
        assert_eq!(list_date_label(at(2024, 3, 4, 23, 0), &now), "Mar 4");
        assert_eq!(list_date_label(at(2023, 11, 30, 8, 0), &now), "2023-11-30");
    }

    #[test]
    fn preview_truncates_long_bodies() {
        let body = "x".repeat(200);
        let p = preview_text(&body);
        assert_eq!(p.chars().count(), 121);
        assert!(p.ends_with('…'));
    }

    #[test]
    fn ordering_key_compares_timestamp_then_sequence() {
        let a = OrderingKey {
            timestamp_ms: 10,
            sequence: 99,
        };
        let b = OrderingKey {
            timestamp_ms: 11,
            sequence: 1,
        };
        let c = OrderingKey {
            timestamp_ms: 11,
            sequence: 2,
        };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn connectivity_syncing_counts_as_connected() {
        assert!(Connectivity::Syncing.is_connected());
        assert!(Connectivity::Online.is_connected());
        assert!(!Connectivity::Offline.is_connected());
    }
}
