use crate::{bool_from_any_row, datetime_from_db_text, now_db_text, opt_datetime_from_db_text, DbPool};
use amityvox_models::message::Message;
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub content: String,
    pub created_at: String,
    pub edited_at: Option<String>,
    pub pinned: bool,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for MessageRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            channel_id: row.try_get("channel_id")?,
            author_id: row.try_get("author_id")?,
            content: row.try_get("content")?,
            created_at: row.try_get("created_at")?,
            edited_at: row.try_get("edited_at")?,
            pinned: bool_from_any_row(row, "pinned")?,
        })
    }
}

impl MessageRow {
    pub fn into_model(self) -> Result<Message, sqlx::Error> {
        Ok(Message {
            created_at: datetime_from_db_text(&self.created_at)?,
            edited_at: opt_datetime_from_db_text(self.edited_at)?,
            id: self.id,
            channel_id: self.channel_id,
            author_id: self.author_id,
            content: self.content,
            pinned: self.pinned,
        })
    }
}

const MESSAGE_COLUMNS: &str = "id, channel_id, author_id, content, created_at, edited_at, pinned";

/// Idempotent insert keyed on the message id; redelivery is a no-op.
pub async fn insert_message(
    pool: &DbPool,
    id: &str,
    channel_id: &str,
    author_id: &str,
    content: &str,
    created_at: &str,
) -> Result<bool, sqlx::Error> {
    let rows = sqlx::query(
        "INSERT INTO messages (id, channel_id, author_id, content, created_at)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(id)
    .bind(channel_id)
    .bind(author_id)
    .bind(content)
    .bind(created_at)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

pub async fn update_message_content(
    pool: &DbPool,
    id: &str,
    channel_id: &str,
    content: &str,
) -> Result<bool, sqlx::Error> {
    let rows = sqlx::query(
        "UPDATE messages SET content = $3, edited_at = $4 WHERE id = $1 AND channel_id = $2",
    )
    .bind(id)
    .bind(channel_id)
    .bind(content)
    .bind(now_db_text())
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

pub async fn delete_message(
    pool: &DbPool,
    id: &str,
    channel_id: &str,
) -> Result<bool, sqlx::Error> {
    let rows = sqlx::query("DELETE FROM messages WHERE id = $1 AND channel_id = $2")
        .bind(id)
        .bind(channel_id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows > 0)
}

pub async fn get_message(pool: &DbPool, id: &str) -> Result<Option<MessageRow>, sqlx::Error> {
    sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn set_message_pinned(
    pool: &DbPool,
    id: &str,
    channel_id: &str,
    pinned: bool,
) -> Result<bool, sqlx::Error> {
    let rows = sqlx::query("UPDATE messages SET pinned = $3 WHERE id = $1 AND channel_id = $2")
        .bind(id)
        .bind(channel_id)
        .bind(if pinned { 1_i64 } else { 0 })
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows > 0)
}

/// Most recent messages in a channel, newest first.
pub async fn list_channel_messages(
    pool: &DbPool,
    channel_id: &str,
    before: Option<&str>,
    limit: i64,
) -> Result<Vec<MessageRow>, sqlx::Error> {
    match before {
        Some(before) => {
            sqlx::query_as::<_, MessageRow>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE channel_id = $1 AND id < $2
                 ORDER BY id DESC LIMIT $3"
            ))
            .bind(channel_id)
            .bind(before)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, MessageRow>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE channel_id = $1 ORDER BY id DESC LIMIT $2"
            ))
            .bind(channel_id)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
    }
}

// ---- reactions ----

pub async fn add_reaction(
    pool: &DbPool,
    message_id: &str,
    user_id: &str,
    emoji: &str,
) -> Result<bool, sqlx::Error> {
    let rows = sqlx::query(
        "INSERT INTO reactions (message_id, user_id, emoji) VALUES ($1, $2, $3)
         ON CONFLICT (message_id, user_id, emoji) DO NOTHING",
    )
    .bind(message_id)
    .bind(user_id)
    .bind(emoji)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

pub async fn remove_reaction(
    pool: &DbPool,
    message_id: &str,
    user_id: &str,
    emoji: &str,
) -> Result<bool, sqlx::Error> {
    let rows = sqlx::query(
        "DELETE FROM reactions WHERE message_id = $1 AND user_id = $2 AND emoji = $3",
    )
    .bind(message_id)
    .bind(user_id)
    .bind(emoji)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}
