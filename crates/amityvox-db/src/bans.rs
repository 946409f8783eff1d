use crate::{now_db_text, DbPool};

pub async fn add_ban(
    pool: &DbPool,
    guild_id: &str,
    user_id: &str,
    reason: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let rows = sqlx::query(
        "INSERT INTO bans (guild_id, user_id, reason, created_at) VALUES ($1, $2, $3, $4)
         ON CONFLICT (guild_id, user_id) DO NOTHING",
    )
    .bind(guild_id)
    .bind(user_id)
    .bind(reason)
    .bind(now_db_text())
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

pub async fn remove_ban(pool: &DbPool, guild_id: &str, user_id: &str) -> Result<bool, sqlx::Error> {
    let rows = sqlx::query("DELETE FROM bans WHERE guild_id = $1 AND user_id = $2")
        .bind(guild_id)
        .bind(user_id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows > 0)
}

pub async fn is_banned(pool: &DbPool, guild_id: &str, user_id: &str) -> Result<bool, sqlx::Error> {
    let found: Option<String> =
        sqlx::query_scalar("SELECT user_id FROM bans WHERE guild_id = $1 AND user_id = $2")
            .bind(guild_id)
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
    Ok(found.is_some())
}
