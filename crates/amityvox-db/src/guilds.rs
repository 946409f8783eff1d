use crate::{bool_from_any_row, datetime_from_db_text, now_db_text, DbPool};
use amityvox_models::guild::Guild;
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct GuildRow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: String,
    pub instance_id: Option<String>,
    pub member_count: i64,
    pub max_members: i64,
    pub discoverable: bool,
    pub default_permissions: i64,
    pub created_at: String,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for GuildRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            owner_id: row.try_get("owner_id")?,
            instance_id: row.try_get("instance_id")?,
            member_count: row.try_get("member_count")?,
            max_members: row.try_get("max_members")?,
            discoverable: bool_from_any_row(row, "discoverable")?,
            default_permissions: row.try_get("default_permissions")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl GuildRow {
    pub fn into_model(self) -> Result<Guild, sqlx::Error> {
        let created_at = datetime_from_db_text(&self.created_at)?;
        Ok(Guild {
            id: self.id,
            name: self.name,
            description: self.description,
            owner_id: self.owner_id,
            instance_id: self.instance_id,
            member_count: self.member_count,
            max_members: self.max_members,
            discoverable: self.discoverable,
            default_permissions: self.default_permissions as u64,
            created_at,
        })
    }

    /// Whether this instance is the guild's home.
    pub fn is_locally_owned(&self) -> bool {
        self.instance_id.is_none()
    }
}

const GUILD_COLUMNS: &str = "id, name, description, owner_id, instance_id, member_count, \
     max_members, discoverable, default_permissions, created_at";

pub async fn create_guild(
    pool: &DbPool,
    id: &str,
    name: &str,
    owner_id: &str,
    instance_id: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO guilds (id, name, owner_id, instance_id, member_count, created_at)
         VALUES ($1, $2, $3, $4, 0, $5)",
    )
    .bind(id)
    .bind(name)
    .bind(owner_id)
    .bind(instance_id)
    .bind(now_db_text())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_guild(pool: &DbPool, id: &str) -> Result<Option<GuildRow>, sqlx::Error> {
    sqlx::query_as::<_, GuildRow>(&format!("SELECT {GUILD_COLUMNS} FROM guilds WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Sparse update: only the provided fields change.
pub async fn update_guild_fields(
    pool: &DbPool,
    id: &str,
    name: Option<&str>,
    description: Option<&str>,
    discoverable: Option<bool>,
    default_permissions: Option<i64>,
) -> Result<(), sqlx::Error> {
    if let Some(name) = name {
        sqlx::query("UPDATE guilds SET name = $2 WHERE id = $1")
            .bind(id)
            .bind(name)
            .execute(pool)
            .await?;
    }
    if let Some(description) = description {
        sqlx::query("UPDATE guilds SET description = $2 WHERE id = $1")
            .bind(id)
            .bind(description)
            .execute(pool)
            .await?;
    }
    if let Some(discoverable) = discoverable {
        sqlx::query("UPDATE guilds SET discoverable = $2 WHERE id = $1")
            .bind(id)
            .bind(if discoverable { 1_i64 } else { 0 })
            .execute(pool)
            .await?;
    }
    if let Some(bits) = default_permissions {
        sqlx::query("UPDATE guilds SET default_permissions = $2 WHERE id = $1")
            .bind(id)
            .bind(bits)
            .execute(pool)
            .await?;
    }
    Ok(())
}

pub async fn delete_guild(pool: &DbPool, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM guilds WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_discoverable_guilds(
    pool: &DbPool,
    limit: i64,
) -> Result<Vec<GuildRow>, sqlx::Error> {
    sqlx::query_as::<_, GuildRow>(&format!(
        "SELECT {GUILD_COLUMNS} FROM guilds
         WHERE discoverable = 1 AND instance_id IS NULL
         ORDER BY member_count DESC LIMIT $1"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn adjust_member_count(pool: &DbPool, id: &str, delta: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE guilds SET member_count = member_count + $2 WHERE id = $1")
        .bind(id)
        .bind(delta)
        .execute(pool)
        .await?;
    Ok(())
}
