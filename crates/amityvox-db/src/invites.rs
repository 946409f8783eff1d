use crate::{datetime_from_db_text, now_db_text, opt_datetime_from_db_text, DbPool};
use amityvox_models::invite::Invite;
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct InviteRow {
    pub code: String,
    pub guild_id: String,
    pub channel_id: Option<String>,
    pub inviter_id: Option<String>,
    pub max_uses: i64,
    pub uses: i64,
    pub expires_at: Option<String>,
    pub created_at: String,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for InviteRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            code: row.try_get("code")?,
            guild_id: row.try_get("guild_id")?,
            channel_id: row.try_get("channel_id")?,
            inviter_id: row.try_get("inviter_id")?,
            max_uses: row.try_get("max_uses")?,
            uses: row.try_get("uses")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl InviteRow {
    pub fn into_model(self) -> Result<Invite, sqlx::Error> {
        Ok(Invite {
            expires_at: opt_datetime_from_db_text(self.expires_at)?,
            created_at: datetime_from_db_text(&self.created_at)?,
            code: self.code,
            guild_id: self.guild_id,
            channel_id: self.channel_id,
            inviter_id: self.inviter_id,
            max_uses: self.max_uses,
            uses: self.uses,
        })
    }
}

const INVITE_COLUMNS: &str =
    "code, guild_id, channel_id, inviter_id, max_uses, uses, expires_at, created_at";

pub async fn create_invite(
    pool: &DbPool,
    code: &str,
    guild_id: &str,
    channel_id: Option<&str>,
    inviter_id: Option<&str>,
    max_uses: i64,
    expires_at: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO invites (code, guild_id, channel_id, inviter_id, max_uses, expires_at, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(code)
    .bind(guild_id)
    .bind(channel_id)
    .bind(inviter_id)
    .bind(max_uses)
    .bind(expires_at)
    .bind(now_db_text())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_invite(pool: &DbPool, code: &str) -> Result<Option<InviteRow>, sqlx::Error> {
    sqlx::query_as::<_, InviteRow>(&format!(
        "SELECT {INVITE_COLUMNS} FROM invites WHERE code = $1"
    ))
    .bind(code)
    .fetch_optional(pool)
    .await
}

pub async fn delete_invite(pool: &DbPool, code: &str) -> Result<bool, sqlx::Error> {
    let rows = sqlx::query("DELETE FROM invites WHERE code = $1")
        .bind(code)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows > 0)
}
