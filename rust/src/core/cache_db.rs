use std::collections::BTreeMap;

use anyhow::Context;
use rusqlite::{params, Connection};

use super::conversation_index::ConversationMeta;
use super::message_store::{MessageStore, StoreChanges, StoredMessage};
use crate::bridge::ServerMessage;
use crate::error::SyncError;
use crate::state::{MessageDeliveryState, SequenceKey};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS conversations (
        conversation_id TEXT PRIMARY KEY,
        title TEXT,
        avatars TEXT NOT NULL DEFAULT '[]',
        last_read INTEGER,
        unread TEXT NOT NULL DEFAULT '[]',
        purged_through INTEGER,
        reached_beginning INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS messages (
        conversation_id TEXT NOT NULL,
        id TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        client_temp_id TEXT,
        sender_id TEXT NOT NULL,
        body TEXT NOT NULL,
        created_at_ms INTEGER NOT NULL,
        revision INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (conversation_id, id)
    );
    CREATE TABLE IF NOT EXISTS outbox (
        client_temp_id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL,
        local_seq INTEGER NOT NULL,
        sender_id TEXT NOT NULL,
        body TEXT NOT NULL,
        created_at_ms INTEGER NOT NULL,
        state TEXT NOT NULL,
        failure_reason TEXT,
        permanent INTEGER NOT NULL DEFAULT 0
    );";

/// Everything persisted for one conversation.
#[derive(Debug, Clone, Default)]
pub struct CachedConversation {
    pub conversation_id: String,
    pub meta: ConversationMeta,
    pub last_read: Option<u64>,
    pub unread: Vec<u64>,
    pub purged_through: Option<u64>,
    pub reached_beginning: bool,
    pub confirmed: Vec<ServerMessage>,
    pub local: Vec<StoredMessage>,
}

/// Index-side state written alongside a conversation's rows.
#[derive(Debug, Clone, Copy)]
pub struct ConversationRow<'a> {
    pub meta: Option<&'a ConversationMeta>,
    pub last_read: Option<u64>,
    pub unread: &'a [u64],
}

pub fn open_cache_db(data_dir: &str) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(data_dir).with_context(|| format!("create data dir {data_dir}"))?;
    let path = std::path::Path::new(data_dir).join("chatsync_cache.sqlite3");
    let conn = Connection::open(&path)
        .with_context(|| format!("open message cache {}", path.display()))?;
    conn.execute_batch(SCHEMA)
        .context("create message cache schema")?;
    Ok(conn)
}

// SQLite integers are signed; sequences never get near i64::MAX.
fn to_sql_seq(seq: u64) -> i64 {
    seq as i64
}

fn from_sql_seq(v: i64) -> u64 {
    v.max(0) as u64
}

fn state_columns(state: &MessageDeliveryState) -> (&'static str, Option<&str>, bool) {
    match state {
        MessageDeliveryState::Pending => ("pending", None, false),
        MessageDeliveryState::Sent => ("sent", None, false),
        MessageDeliveryState::Failed { reason, permanent } => {
            ("failed", Some(reason.as_str()), *permanent)
        }
        MessageDeliveryState::Confirmed => ("confirmed", None, false),
    }
}

// A send that was in flight when the process died has unknown fate; it goes out again.
fn state_from_columns(state: &str, reason: Option<String>, permanent: bool) -> MessageDeliveryState {
    match state {
        "failed" => MessageDeliveryState::Failed {
            reason: reason.unwrap_or_default(),
            permanent,
        },
        _ => MessageDeliveryState::Pending,
    }
}

/// Writes one conversation's changes. Confirmed rows follow the store journal: `changes`
/// upserts and deletes, and everything at or below the purged floor goes. Outbox rows are
/// rewritten whole. With no `meta` and no `store` the conversation is dropped.
pub fn save_conversation(
    conn: &Connection,
    conversation_id: &str,
    row: &ConversationRow<'_>,
    store: Option<&MessageStore>,
    changes: &StoreChanges,
) -> Result<(), SyncError> {
    let tx = conn.unchecked_transaction()?;

    if row.meta.is_none() && store.is_none() {
        for sql in [
            "DELETE FROM messages WHERE conversation_id = ?1",
            "DELETE FROM outbox WHERE conversation_id = ?1",
            "DELETE FROM conversations WHERE conversation_id = ?1",
        ] {
            tx.execute(sql, [conversation_id])?;
        }
        tx.commit()?;
        return Ok(());
    }

    let meta = row.meta.cloned().unwrap_or_default();
    let avatars = serde_json::to_string(&meta.participant_avatars).unwrap_or_else(|_| "[]".into());
    let unread = serde_json::to_string(row.unread).unwrap_or_else(|_| "[]".into());
    tx.execute(
        "INSERT INTO conversations
            (conversation_id, title, avatars, last_read, unread, purged_through, reached_beginning)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(conversation_id) DO UPDATE SET
            title = excluded.title,
            avatars = excluded.avatars,
            last_read = excluded.last_read,
            unread = excluded.unread,
            purged_through = excluded.purged_through,
            reached_beginning = excluded.reached_beginning",
        params![
            conversation_id,
            meta.title,
            avatars,
            row.last_read.map(to_sql_seq),
            unread,
            store.and_then(|s| s.purged_through()).map(to_sql_seq),
            store.is_some_and(|s| s.reached_beginning()),
        ],
    )?;

    if let Some(floor) = store.and_then(|s| s.purged_through()) {
        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1 AND sequence <= ?2",
            params![conversation_id, to_sql_seq(floor)],
        )?;
    }
    for id in &changes.removed {
        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1 AND id = ?2",
            params![conversation_id, id],
        )?;
    }
    for m in &changes.upserted {
        let (Some(id), Some(seq)) = (m.id.as_deref(), m.sequence_key.confirmed()) else {
            continue;
        };
        tx.execute(
            "INSERT INTO messages
                (conversation_id, id, sequence, client_temp_id, sender_id, body,
                 created_at_ms, revision)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(conversation_id, id) DO UPDATE SET
                sequence = excluded.sequence,
                client_temp_id = excluded.client_temp_id,
                body = excluded.body,
                revision = excluded.revision",
            params![
                conversation_id,
                id,
                to_sql_seq(seq),
                m.client_temp_id,
                m.sender_id,
                m.body,
                m.created_at_ms,
                m.revision,
            ],
        )?;
    }

    tx.execute(
        "DELETE FROM outbox WHERE conversation_id = ?1",
        [conversation_id],
    )?;
    for m in store.into_iter().flat_map(|s| s.local_entries()) {
        let (Some(temp), SequenceKey::Provisional { local_seq, .. }) =
            (m.client_temp_id.as_deref(), m.sequence_key)
        else {
            continue;
        };
        let (state, reason, permanent) = state_columns(&m.state);
        tx.execute(
            "INSERT OR REPLACE INTO outbox
                (client_temp_id, conversation_id, local_seq, sender_id, body,
                 created_at_ms, state, failure_reason, permanent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                temp,
                conversation_id,
                to_sql_seq(local_seq),
                m.sender_id,
                m.body,
                m.created_at_ms,
                state,
                reason,
                permanent,
            ],
        )?;
    }

    tx.commit()?;
    Ok(())
}

pub fn load_all(conn: &Connection) -> Result<Vec<CachedConversation>, SyncError> {
    let mut out: BTreeMap<String, CachedConversation> = BTreeMap::new();

    let mut stmt = conn.prepare(
        "SELECT conversation_id, title, avatars, last_read, unread, purged_through,
                reached_beginning
         FROM conversations",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<i64>>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<i64>>(5)?,
            row.get::<_, bool>(6)?,
        ))
    })?;
    for row in rows {
        let (id, title, avatars, last_read, unread, purged, reached) = row?;
        out.insert(
            id.clone(),
            CachedConversation {
                conversation_id: id,
                meta: ConversationMeta {
                    title,
                    participant_avatars: serde_json::from_str(&avatars).unwrap_or_default(),
                },
                last_read: last_read.map(from_sql_seq),
                unread: serde_json::from_str(&unread).unwrap_or_default(),
                purged_through: purged.map(from_sql_seq),
                reached_beginning: reached,
                ..Default::default()
            },
        );
    }

    let mut stmt = conn.prepare(
        "SELECT conversation_id, id, sequence, client_temp_id, sender_id, body,
                created_at_ms, revision
         FROM messages ORDER BY conversation_id, sequence",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(ServerMessage {
            conversation_id: row.get(0)?,
            id: row.get(1)?,
            sequence: from_sql_seq(row.get(2)?),
            client_temp_id: row.get(3)?,
            sender_id: row.get(4)?,
            body: row.get(5)?,
            created_at_ms: row.get(6)?,
            revision: row.get(7)?,
        })
    })?;
    for m in rows {
        let m = m?;
        if let Some(c) = out.get_mut(&m.conversation_id) {
            c.confirmed.push(m);
        }
    }

    let mut stmt = conn.prepare(
        "SELECT client_temp_id, conversation_id, local_seq, sender_id, body, created_at_ms,
                state, failure_reason, permanent
         FROM outbox ORDER BY conversation_id, local_seq",
    )?;
    let rows = stmt.query_map([], |row| {
        let local_seq = from_sql_seq(row.get(2)?);
        let created_at_ms: i64 = row.get(5)?;
        let state: String = row.get(6)?;
        Ok(StoredMessage {
            id: None,
            client_temp_id: Some(row.get(0)?),
            conversation_id: row.get(1)?,
            sender_id: row.get(3)?,
            body: row.get(4)?,
            created_at_ms,
            revision: 0,
            state: state_from_columns(&state, row.get(7)?, row.get(8)?),
            sequence_key: SequenceKey::Provisional {
                local_seq,
                created_at_ms,
            },
        })
    })?;
    for m in rows {
        let m = m?;
        if let Some(c) = out.get_mut(&m.conversation_id) {
            c.local.push(m);
        }
    }

    Ok(out.into_values().collect())
}
