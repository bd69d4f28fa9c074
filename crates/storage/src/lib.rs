use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{
        Conversation, ConversationId, EventId, GroupTag, KeyPackageRecord, PublicKey,
        StoredMessage, Timestamp, UnreadInvite,
    },
    event::RelayEvent,
    store::{
        ConversationStore, CursorStore, GroupStateStore, InviteStore, KeyPackageStore,
        ReadStateStore,
    },
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open sqlite database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run sync state migrations")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Every stored cursor, for operator inspection.
    pub async fn list_cursors(&self) -> Result<Vec<(ConversationId, Timestamp)>> {
        let rows = sqlx::query(
            "SELECT conversation_id, last_synced_at FROM sync_cursors ORDER BY conversation_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    ConversationId(row.get::<String, _>(0)),
                    from_db_ts(row.get::<i64, _>(1)),
                )
            })
            .collect())
    }

    /// Drops a cursor unconditionally so the next activation backfills the full window.
    pub async fn reset_cursor(&self, id: &ConversationId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sync_cursors WHERE conversation_id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn to_db_ts(ts: Timestamp) -> i64 {
    i64::try_from(ts.0).unwrap_or(i64::MAX)
}

fn from_db_ts(value: i64) -> Timestamp {
    Timestamp(value.max(0) as u64)
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    let relays_json: String = row.try_get("relays_json")?;
    let members_json: String = row.try_get("members_json")?;
    let last_message: Option<String> = row.try_get("last_message")?;
    Ok(Conversation {
        id: ConversationId(row.try_get("id")?),
        group_tag: GroupTag(row.try_get("group_tag")?),
        relays: serde_json::from_str(&relays_json).context("invalid stored relay list")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        members: serde_json::from_str(&members_json).context("invalid stored member list")?,
        last_message: last_message
            .map(|raw| serde_json::from_str::<StoredMessage>(&raw))
            .transpose()
            .context("invalid stored last message")?,
        message_count: row.try_get::<i64, _>("message_count")?.max(0) as u64,
        created_at: from_db_ts(row.try_get("created_at")?),
    })
}

fn message_from_row(row: &SqliteRow) -> Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.try_get("id")?,
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        sender: PublicKey(row.try_get("sender")?),
        content: row.try_get("content")?,
        created_at: from_db_ts(row.try_get("created_at")?),
        kind: row.try_get::<i64, _>("kind")? as u16,
    })
}

fn key_package_from_row(row: &SqliteRow) -> Result<KeyPackageRecord> {
    let advertisement_json: String = row.try_get("advertisement_json")?;
    Ok(KeyPackageRecord {
        id: row.try_get("id")?,
        advertisement: serde_json::from_str(&advertisement_json)
            .context("invalid stored key package advertisement")?,
        published: row.try_get("published")?,
        consumed: row.try_get("consumed")?,
        created_at: from_db_ts(row.try_get("created_at")?),
    })
}

#[async_trait]
impl ConversationStore for Storage {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let rows = sqlx::query("SELECT * FROM conversations ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(conversation_from_row).collect()
    }

    async fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn put_conversation(&self, conversation: &Conversation) -> Result<()> {
        let last_message = conversation
            .last_message
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO conversations
                (id, group_tag, relays_json, name, description, members_json, last_message, message_count, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                group_tag=excluded.group_tag,
                relays_json=excluded.relays_json,
                name=excluded.name,
                description=excluded.description,
                members_json=excluded.members_json,
                last_message=excluded.last_message,
                message_count=excluded.message_count",
        )
        .bind(conversation.id.as_str())
        .bind(conversation.group_tag.0.as_slice())
        .bind(serde_json::to_string(&conversation.relays)?)
        .bind(&conversation.name)
        .bind(conversation.description.as_deref())
        .bind(serde_json::to_string(&conversation.members)?)
        .bind(last_message)
        .bind(conversation.message_count as i64)
        .bind(to_db_ts(conversation.created_at))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to persist conversation {}", conversation.id))?;
        Ok(())
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn put_message(&self, message: &StoredMessage) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO messages (id, conversation_id, sender, content, created_at, kind)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&message.id)
        .bind(message.conversation_id.as_str())
        .bind(message.sender.as_str())
        .bind(&message.content)
        .bind(to_db_ts(message.created_at))
        .bind(i64::from(message.kind))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_last_message(&self, message: &StoredMessage) -> Result<()> {
        sqlx::query(
            "UPDATE conversations
             SET last_message = ?,
                 message_count = (SELECT COUNT(*) FROM messages WHERE conversation_id = ?)
             WHERE id = ?",
        )
        .bind(serde_json::to_string(message)?)
        .bind(message.conversation_id.as_str())
        .bind(message.conversation_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_messages(&self, id: &ConversationId, limit: u32) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM (
                SELECT * FROM messages WHERE conversation_id = ?
                ORDER BY created_at DESC, id DESC LIMIT ?
             ) ORDER BY created_at ASC, id ASC",
        )
        .bind(id.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn count_messages_since(
        &self,
        id: &ConversationId,
        since: Option<Timestamp>,
        excluding_sender: &PublicKey,
    ) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ? AND created_at > ? AND sender != ?",
        )
        .bind(id.as_str())
        .bind(since.map(to_db_ts).unwrap_or(-1))
        .bind(excluding_sender.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl CursorStore for Storage {
    async fn get_cursor(&self, id: &ConversationId) -> Result<Option<Timestamp>> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT last_synced_at FROM sync_cursors WHERE conversation_id = ?")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.map(from_db_ts))
    }

    async fn set_cursor(&self, id: &ConversationId, at: Timestamp) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_cursors (conversation_id, last_synced_at) VALUES (?, ?)
             ON CONFLICT(conversation_id) DO UPDATE
             SET last_synced_at = MAX(sync_cursors.last_synced_at, excluded.last_synced_at)",
        )
        .bind(id.as_str())
        .bind(to_db_ts(at))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to advance sync cursor for {id}"))?;
        Ok(())
    }

    async fn delete_cursor(&self, id: &ConversationId) -> Result<()> {
        self.reset_cursor(id).await?;
        Ok(())
    }
}

#[async_trait]
impl InviteStore for Storage {
    async fn put_received(&self, envelope: &RelayEvent) -> Result<bool> {
        let id = envelope.id.as_str();
        let known: i64 = sqlx::query_scalar(
            "SELECT
                (SELECT COUNT(*) FROM invite_seen WHERE envelope_id = ?1) +
                (SELECT COUNT(*) FROM invite_unread WHERE envelope_id = ?1)",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        if known > 0 {
            return Ok(false);
        }

        let result = sqlx::query(
            "INSERT INTO invite_received (envelope_id, event_json, received_at) VALUES (?, ?, ?)
             ON CONFLICT(envelope_id) DO NOTHING",
        )
        .bind(id)
        .bind(serde_json::to_string(envelope)?)
        .bind(to_db_ts(Timestamp::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_received(&self) -> Result<Vec<RelayEvent>> {
        let rows = sqlx::query("SELECT event_json FROM invite_received ORDER BY received_at")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let raw: String = row.get(0);
                serde_json::from_str(&raw).context("invalid stored invite envelope")
            })
            .collect()
    }

    async fn remove_received(&self, envelope_id: &EventId) -> Result<()> {
        sqlx::query("DELETE FROM invite_received WHERE envelope_id = ?")
            .bind(envelope_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn put_unread(&self, invite: &UnreadInvite) -> Result<()> {
        sqlx::query(
            "INSERT INTO invite_unread (envelope_id, rumor_json) VALUES (?, ?)
             ON CONFLICT(envelope_id) DO UPDATE SET rumor_json=excluded.rumor_json",
        )
        .bind(invite.envelope_id.as_str())
        .bind(serde_json::to_string(&invite.rumor)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_unread(&self) -> Result<Vec<UnreadInvite>> {
        let rows = sqlx::query("SELECT envelope_id, rumor_json FROM invite_unread")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let raw: String = row.get(1);
                Ok(UnreadInvite {
                    envelope_id: EventId(row.get(0)),
                    rumor: serde_json::from_str(&raw).context("invalid stored invite rumor")?,
                })
            })
            .collect()
    }

    async fn remove_unread(&self, envelope_id: &EventId) -> Result<()> {
        sqlx::query("DELETE FROM invite_unread WHERE envelope_id = ?")
            .bind(envelope_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_seen(&self, envelope_id: &EventId) -> Result<()> {
        sqlx::query(
            "INSERT INTO invite_seen (envelope_id, seen_at) VALUES (?, ?)
             ON CONFLICT(envelope_id) DO NOTHING",
        )
        .bind(envelope_id.as_str())
        .bind(to_db_ts(Timestamp::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_seen(&self, envelope_id: &EventId) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM invite_seen WHERE envelope_id = ?")
            .bind(envelope_id.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }
}

#[async_trait]
impl KeyPackageStore for Storage {
    async fn add_key_package(&self, record: &KeyPackageRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO key_packages (id, event_id, advertisement_json, published, consumed, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                event_id=excluded.event_id,
                advertisement_json=excluded.advertisement_json,
                published=excluded.published,
                consumed=excluded.consumed",
        )
        .bind(&record.id)
        .bind(record.advertisement.id.as_str())
        .bind(serde_json::to_string(&record.advertisement)?)
        .bind(record.published)
        .bind(record.consumed)
        .bind(to_db_ts(record.created_at))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to persist key package {}", record.id))?;
        Ok(())
    }

    async fn count_available_key_packages(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM key_packages WHERE consumed = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    async fn list_unpublished_key_packages(&self) -> Result<Vec<KeyPackageRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM key_packages WHERE published = 0 AND consumed = 0 ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(key_package_from_row).collect()
    }

    async fn list_key_packages(&self) -> Result<Vec<KeyPackageRecord>> {
        let rows = sqlx::query("SELECT * FROM key_packages ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(key_package_from_row).collect()
    }

    async fn mark_key_package_published(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE key_packages SET published = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_key_package_consumed(&self, event_id: &EventId) -> Result<bool> {
        let result = sqlx::query("UPDATE key_packages SET consumed = 1 WHERE event_id = ?")
            .bind(event_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ReadStateStore for Storage {
    async fn get_last_read(&self, id: &ConversationId) -> Result<Option<Timestamp>> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT last_read_at FROM read_state WHERE conversation_id = ?")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.map(from_db_ts))
    }

    async fn set_last_read(&self, id: &ConversationId, at: Timestamp) -> Result<()> {
        sqlx::query(
            "INSERT INTO read_state (conversation_id, last_read_at) VALUES (?, ?)
             ON CONFLICT(conversation_id) DO UPDATE
             SET last_read_at = MAX(read_state.last_read_at, excluded.last_read_at)",
        )
        .bind(id.as_str())
        .bind(to_db_ts(at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_read_state(&self, id: &ConversationId) -> Result<()> {
        sqlx::query("DELETE FROM read_state WHERE conversation_id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl GroupStateStore for Storage {
    async fn save_identity_keys(&self, identity: &PublicKey, identity_bytes: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT INTO mls_identity_keys (identity, identity_bytes, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(identity) DO UPDATE
             SET identity_bytes = excluded.identity_bytes, updated_at = excluded.updated_at",
        )
        .bind(identity.as_str())
        .bind(identity_bytes)
        .bind(to_db_ts(Timestamp::now()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to store MLS identity for {identity}"))?;
        Ok(())
    }

    async fn load_identity_keys(&self, identity: &PublicKey) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT identity_bytes FROM mls_identity_keys WHERE identity = ?")
            .bind(identity.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>(0)))
    }

    async fn save_group_state(&self, identity: &PublicKey, state: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT INTO mls_group_state (identity, state_bytes, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(identity) DO UPDATE
             SET state_bytes = excluded.state_bytes, updated_at = excluded.updated_at",
        )
        .bind(identity.as_str())
        .bind(state)
        .bind(to_db_ts(Timestamp::now()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to store MLS group state for {identity}"))?;
        Ok(())
    }

    async fn load_group_state(&self, identity: &PublicKey) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT state_bytes FROM mls_group_state WHERE identity = ?")
            .bind(identity.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>(0)))
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
