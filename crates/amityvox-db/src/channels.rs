use crate::{bool_from_any_row, DbPool};
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct ChannelRow {
    pub id: String,
    pub guild_id: String,
    pub name: String,
    pub topic: Option<String>,
    pub channel_type: i64,
    pub category_id: Option<String>,
    pub position: i64,
    pub private: bool,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for ChannelRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            guild_id: row.try_get("guild_id")?,
            name: row.try_get("name")?,
            topic: row.try_get("topic")?,
            channel_type: row.try_get("channel_type")?,
            category_id: row.try_get("category_id")?,
            position: row.try_get("position")?,
            private: bool_from_any_row(row, "private")?,
        })
    }
}

const CHANNEL_COLUMNS: &str =
    "id, guild_id, name, topic, channel_type, category_id, position, private";

#[allow(clippy::too_many_arguments)]
pub async fn upsert_channel(
    pool: &DbPool,
    id: &str,
    guild_id: &str,
    name: &str,
    topic: Option<&str>,
    channel_type: i64,
    category_id: Option<&str>,
    position: i64,
    private: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO channels (id, guild_id, name, topic, channel_type, category_id, position, private)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         ON CONFLICT (id) DO UPDATE SET
             name = EXCLUDED.name,
             topic = EXCLUDED.topic,
             category_id = EXCLUDED.category_id,
             position = EXCLUDED.position,
             private = EXCLUDED.private",
    )
    .bind(id)
    .bind(guild_id)
    .bind(name)
    .bind(topic)
    .bind(channel_type)
    .bind(category_id)
    .bind(position)
    .bind(if private { 1_i64 } else { 0 })
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_channel(pool: &DbPool, id: &str) -> Result<Option<ChannelRow>, sqlx::Error> {
    sqlx::query_as::<_, ChannelRow>(&format!(
        "SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn guild_id_for_channel(
    pool: &DbPool,
    channel_id: &str,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>("SELECT guild_id FROM channels WHERE id = $1")
        .bind(channel_id)
        .fetch_optional(pool)
        .await
}

pub async fn list_guild_channels(
    pool: &DbPool,
    guild_id: &str,
) -> Result<Vec<ChannelRow>, sqlx::Error> {
    sqlx::query_as::<_, ChannelRow>(&format!(
        "SELECT {CHANNEL_COLUMNS} FROM channels WHERE guild_id = $1 ORDER BY position ASC, id ASC"
    ))
    .bind(guild_id)
    .fetch_all(pool)
    .await
}

pub async fn list_public_guild_channels(
    pool: &DbPool,
    guild_id: &str,
) -> Result<Vec<ChannelRow>, sqlx::Error> {
    sqlx::query_as::<_, ChannelRow>(&format!(
        "SELECT {CHANNEL_COLUMNS} FROM channels
         WHERE guild_id = $1 AND private = 0 ORDER BY position ASC, id ASC"
    ))
    .bind(guild_id)
    .fetch_all(pool)
    .await
}

pub async fn delete_channel(pool: &DbPool, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM channels WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ---- categories ----

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CategoryRow {
    pub id: String,
    pub guild_id: String,
    pub name: String,
    pub position: i64,
}

pub async fn upsert_category(
    pool: &DbPool,
    id: &str,
    guild_id: &str,
    name: &str,
    position: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO categories (id, guild_id, name, position)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (id) DO UPDATE SET
             name = EXCLUDED.name,
             position = EXCLUDED.position",
    )
    .bind(id)
    .bind(guild_id)
    .bind(name)
    .bind(position)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_category(pool: &DbPool, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM categories WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ---- channel overwrites ----

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChannelOverwriteRow {
    pub channel_id: String,
    pub target_type: i64,
    pub target_id: String,
    pub allow_permissions: i64,
    pub deny_permissions: i64,
}

pub async fn get_channel_overwrites(
    pool: &DbPool,
    channel_id: &str,
) -> Result<Vec<ChannelOverwriteRow>, sqlx::Error> {
    sqlx::query_as::<_, ChannelOverwriteRow>(
        "SELECT channel_id, target_type, target_id, allow_permissions, deny_permissions
         FROM channel_overwrites WHERE channel_id = $1",
    )
    .bind(channel_id)
    .fetch_all(pool)
    .await
}

pub async fn upsert_channel_overwrite(
    pool: &DbPool,
    channel_id: &str,
    target_type: i64,
    target_id: &str,
    allow: i64,
    deny: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO channel_overwrites (channel_id, target_type, target_id, allow_permissions, deny_permissions)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (channel_id, target_type, target_id) DO UPDATE SET
             allow_permissions = EXCLUDED.allow_permissions,
             deny_permissions = EXCLUDED.deny_permissions",
    )
    .bind(channel_id)
    .bind(target_type)
    .bind(target_id)
    .bind(allow)
    .bind(deny)
    .execute(pool)
    .await?;
    Ok(())
}
