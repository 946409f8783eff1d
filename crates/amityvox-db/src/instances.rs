use crate::{
    bool_from_any_row, now_db_text, opt_datetime_from_db_text, string_vec_from_db_text, DbPool,
};
use chrono::{DateTime, Utc};
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct InstanceRow {
    pub id: String,
    pub domain: String,
    pub public_key: String,
    pub key_fingerprint: String,
    pub federation_mode: String,
    pub software: String,
    pub version: String,
    pub shorthand: Option<String>,
    pub resolved_ips: Vec<String>,
    pub voice_url: Option<String>,
    pub voice_mode: Option<String>,
    pub is_local: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
}

const INSTANCE_COLUMNS: &str = "id, domain, public_key, key_fingerprint, federation_mode, \
     software, version, shorthand, resolved_ips, voice_url, voice_mode, is_local, last_seen_at";

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for InstanceRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let resolved_raw: String = row.try_get("resolved_ips")?;
        Ok(Self {
            id: row.try_get("id")?,
            domain: row.try_get("domain")?,
            public_key: row.try_get("public_key")?,
            key_fingerprint: row.try_get("key_fingerprint")?,
            federation_mode: row.try_get("federation_mode")?,
            software: row.try_get("software")?,
            version: row.try_get("version")?,
            shorthand: row.try_get("shorthand")?,
            resolved_ips: string_vec_from_db_text(&resolved_raw),
            voice_url: row.try_get("voice_url")?,
            voice_mode: row.try_get("voice_mode")?,
            is_local: bool_from_any_row(row, "is_local")?,
            last_seen_at: opt_datetime_from_db_text(row.try_get("last_seen_at")?)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewInstance<'a> {
    pub id: &'a str,
    pub domain: &'a str,
    pub public_key: &'a str,
    pub key_fingerprint: &'a str,
    pub federation_mode: &'a str,
    pub software: &'a str,
    pub version: &'a str,
    pub shorthand: Option<&'a str>,
    pub voice_url: Option<&'a str>,
    pub voice_mode: Option<&'a str>,
    pub is_local: bool,
}

pub async fn insert_instance(pool: &DbPool, new: &NewInstance<'_>) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO instances (id, domain, public_key, key_fingerprint, federation_mode, \
         software, version, shorthand, voice_url, voice_mode, is_local, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
    )
    .bind(new.id)
    .bind(new.domain)
    .bind(new.public_key)
    .bind(new.key_fingerprint)
    .bind(new.federation_mode)
    .bind(new.software)
    .bind(new.version)
    .bind(new.shorthand)
    .bind(new.voice_url)
    .bind(new.voice_mode)
    .bind(if new.is_local { 1_i64 } else { 0 })
    .bind(now_db_text())
    .execute(pool)
    .await?;
    Ok(())
}

/// Refresh the mutable discovery fields of an existing instance row.
pub async fn update_instance(
    pool: &DbPool,
    id: &str,
    public_key: &str,
    key_fingerprint: &str,
    federation_mode: &str,
    software: &str,
    version: &str,
    voice_url: Option<&str>,
    voice_mode: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE instances SET public_key = $2, key_fingerprint = $3, federation_mode = $4, \
         software = $5, version = $6, voice_url = $7, voice_mode = $8 WHERE id = $1",
    )
    .bind(id)
    .bind(public_key)
    .bind(key_fingerprint)
    .bind(federation_mode)
    .bind(software)
    .bind(version)
    .bind(voice_url)
    .bind(voice_mode)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_instance(pool: &DbPool, id: &str) -> Result<Option<InstanceRow>, sqlx::Error> {
    sqlx::query_as::<_, InstanceRow>(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM instances WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn get_instance_by_domain(
    pool: &DbPool,
    domain: &str,
) -> Result<Option<InstanceRow>, sqlx::Error> {
    sqlx::query_as::<_, InstanceRow>(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM instances WHERE domain = $1"
    ))
    .bind(domain)
    .fetch_optional(pool)
    .await
}

pub async fn get_local_instance(pool: &DbPool) -> Result<Option<InstanceRow>, sqlx::Error> {
    sqlx::query_as::<_, InstanceRow>(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM instances WHERE is_local = 1"
    ))
    .fetch_optional(pool)
    .await
}

pub async fn get_public_key(pool: &DbPool, id: &str) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>("SELECT public_key FROM instances WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn shorthand_taken(
    pool: &DbPool,
    shorthand: &str,
    excluding_id: &str,
) -> Result<bool, sqlx::Error> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT id FROM instances WHERE shorthand = $1 AND id <> $2")
            .bind(shorthand)
            .bind(excluding_id)
            .fetch_optional(pool)
            .await?;
    Ok(existing.is_some())
}

pub async fn set_shorthand(
    pool: &DbPool,
    id: &str,
    shorthand: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE instances SET shorthand = $2 WHERE id = $1")
        .bind(id)
        .bind(shorthand)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_resolved_ips(pool: &DbPool, id: &str, ips: &[String]) -> Result<(), sqlx::Error> {
    let encoded = serde_json::to_string(ips)
        .map_err(|e| sqlx::Error::Protocol(format!("invalid resolved ips: {e}")))?;
    sqlx::query("UPDATE instances SET resolved_ips = $2 WHERE id = $1")
        .bind(id)
        .bind(encoded)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn touch_last_seen(pool: &DbPool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE instances SET last_seen_at = $2 WHERE id = $1")
        .bind(id)
        .bind(now_db_text())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_federation_mode(pool: &DbPool, id: &str, mode: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE instances SET federation_mode = $2 WHERE id = $1")
        .bind(id)
        .bind(mode)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn insert_key_audit(
    pool: &DbPool,
    audit_id: &str,
    instance_id: &str,
    old_fingerprint: &str,
    new_fingerprint: &str,
    old_public_key: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO key_audits (id, instance_id, old_fingerprint, new_fingerprint, \
         old_public_key, detected_at)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(audit_id)
    .bind(instance_id)
    .bind(old_fingerprint)
    .bind(new_fingerprint)
    .bind(old_public_key)
    .bind(now_db_text())
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct KeyAuditRow {
    pub id: String,
    pub instance_id: String,
    pub old_fingerprint: String,
    pub new_fingerprint: String,
    pub old_public_key: String,
    pub detected_at: String,
}

pub async fn list_key_audits(
    pool: &DbPool,
    instance_id: &str,
) -> Result<Vec<KeyAuditRow>, sqlx::Error> {
    sqlx::query_as::<_, KeyAuditRow>(
        "SELECT id, instance_id, old_fingerprint, new_fingerprint, old_public_key, detected_at
         FROM key_audits WHERE instance_id = $1 ORDER BY detected_at ASC",
    )
    .bind(instance_id)
    .fetch_all(pool)
    .await
}

/// The remote instance was rebuilt under a new id: move every reference from
/// `old_id` to `new_id` and rewrite the primary key, all in one transaction.
pub async fn migrate_instance_id(
    pool: &DbPool,
    old_id: &str,
    new_id: &str,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    let reference_updates = [
        "UPDATE peers SET peer_id = $2 WHERE peer_id = $1",
        "UPDATE peers SET instance_id = $2 WHERE instance_id = $1",
        "UPDATE peer_status SET peer_id = $2 WHERE peer_id = $1",
        "UPDATE peer_controls SET peer_id = $2 WHERE peer_id = $1",
        "UPDATE peer_controls SET instance_id = $2 WHERE instance_id = $1",
        "UPDATE channel_peers SET instance_id = $2 WHERE instance_id = $1",
        "UPDATE channel_mirrors SET remote_instance_id = $2 WHERE remote_instance_id = $1",
        "UPDATE federation_events SET instance_id = $2 WHERE instance_id = $1",
        "UPDATE guilds SET instance_id = $2 WHERE instance_id = $1",
        "UPDATE users SET instance_id = $2 WHERE instance_id = $1",
        "UPDATE key_audits SET instance_id = $2 WHERE instance_id = $1",
    ];
    for sql in reference_updates {
        sqlx::query(sql)
            .bind(old_id)
            .bind(new_id)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query("UPDATE instances SET id = $2 WHERE id = $1")
        .bind(old_id)
        .bind(new_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await
}
