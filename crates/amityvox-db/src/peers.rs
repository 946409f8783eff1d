use crate::{now_db_text, opt_datetime_from_db_text, string_vec_from_db_text, DbPool};
use chrono::{DateTime, Utc};
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct PeerRow {
    pub instance_id: String,
    pub peer_id: String,
    pub status: String,
    pub initiated_by: String,
    pub established_at: Option<DateTime<Utc>>,
    pub handshake_completed_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for PeerRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            instance_id: row.try_get("instance_id")?,
            peer_id: row.try_get("peer_id")?,
            status: row.try_get("status")?,
            initiated_by: row.try_get("initiated_by")?,
            established_at: opt_datetime_from_db_text(row.try_get("established_at")?)?,
            handshake_completed_at: opt_datetime_from_db_text(
                row.try_get("handshake_completed_at")?,
            )?,
            last_synced_at: opt_datetime_from_db_text(row.try_get("last_synced_at")?)?,
        })
    }
}

const PEER_COLUMNS: &str = "instance_id, peer_id, status, initiated_by, established_at, \
     handshake_completed_at, last_synced_at";

pub async fn upsert_peer(
    pool: &DbPool,
    instance_id: &str,
    peer_id: &str,
    status: &str,
    initiated_by: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO peers (instance_id, peer_id, status, initiated_by, established_at, handshake_completed_at)
         VALUES ($1, $2, $3, $4, $5, $5)
         ON CONFLICT (instance_id, peer_id) DO UPDATE SET
             status = EXCLUDED.status,
             handshake_completed_at = EXCLUDED.handshake_completed_at",
    )
    .bind(instance_id)
    .bind(peer_id)
    .bind(status)
    .bind(initiated_by)
    .bind(now_db_text())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_peer(
    pool: &DbPool,
    instance_id: &str,
    peer_id: &str,
) -> Result<Option<PeerRow>, sqlx::Error> {
    sqlx::query_as::<_, PeerRow>(&format!(
        "SELECT {PEER_COLUMNS} FROM peers WHERE instance_id = $1 AND peer_id = $2"
    ))
    .bind(instance_id)
    .bind(peer_id)
    .fetch_optional(pool)
    .await
}

pub async fn list_peers(pool: &DbPool, instance_id: &str) -> Result<Vec<PeerRow>, sqlx::Error> {
    sqlx::query_as::<_, PeerRow>(&format!(
        "SELECT {PEER_COLUMNS} FROM peers WHERE instance_id = $1 ORDER BY peer_id ASC"
    ))
    .bind(instance_id)
    .fetch_all(pool)
    .await
}

/// Active peers joined with their instance domain, for broadcast fan-out.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActivePeerRow {
    pub peer_id: String,
    pub domain: String,
}

pub async fn list_active_peers(
    pool: &DbPool,
    instance_id: &str,
) -> Result<Vec<ActivePeerRow>, sqlx::Error> {
    sqlx::query_as::<_, ActivePeerRow>(
        "SELECT p.peer_id AS peer_id, i.domain AS domain
         FROM peers p JOIN instances i ON i.id = p.peer_id
         WHERE p.instance_id = $1 AND p.status = 'active'
         ORDER BY p.peer_id ASC",
    )
    .bind(instance_id)
    .fetch_all(pool)
    .await
}

pub async fn has_active_peer(
    pool: &DbPool,
    instance_id: &str,
    peer_id: &str,
) -> Result<bool, sqlx::Error> {
    let found: Option<String> = sqlx::query_scalar(
        "SELECT peer_id FROM peers WHERE instance_id = $1 AND peer_id = $2 AND status = 'active'",
    )
    .bind(instance_id)
    .bind(peer_id)
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}

pub async fn set_peer_status(
    pool: &DbPool,
    instance_id: &str,
    peer_id: &str,
    status: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE peers SET status = $3 WHERE instance_id = $1 AND peer_id = $2")
        .bind(instance_id)
        .bind(peer_id)
        .bind(status)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn touch_last_synced(
    pool: &DbPool,
    instance_id: &str,
    peer_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE peers SET last_synced_at = $3 WHERE instance_id = $1 AND peer_id = $2")
        .bind(instance_id)
        .bind(peer_id)
        .bind(now_db_text())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_peer(
    pool: &DbPool,
    instance_id: &str,
    peer_id: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM peers WHERE instance_id = $1 AND peer_id = $2")
        .bind(instance_id)
        .bind(peer_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ---- peer_status ----

#[derive(Debug, Clone)]
pub struct PeerStatusRow {
    pub peer_id: String,
    pub status: String,
    pub version: Option<String>,
    pub capabilities: Vec<String>,
    pub event_lag_ms: i64,
    pub events_sent: i64,
    pub events_received: i64,
    pub errors_24h: i64,
    pub last_check_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for PeerStatusRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let capabilities_raw: String = row.try_get("capabilities")?;
        Ok(Self {
            peer_id: row.try_get("peer_id")?,
            status: row.try_get("status")?,
            version: row.try_get("version")?,
            capabilities: string_vec_from_db_text(&capabilities_raw),
            event_lag_ms: row.try_get("event_lag_ms")?,
            events_sent: row.try_get("events_sent")?,
            events_received: row.try_get("events_received")?,
            errors_24h: row.try_get("errors_24h")?,
            last_check_at: opt_datetime_from_db_text(row.try_get("last_check_at")?)?,
        })
    }
}

pub async fn get_peer_status(
    pool: &DbPool,
    peer_id: &str,
) -> Result<Option<PeerStatusRow>, sqlx::Error> {
    sqlx::query_as::<_, PeerStatusRow>(
        "SELECT peer_id, status, version, capabilities, event_lag_ms, events_sent, \
         events_received, errors_24h, last_check_at
         FROM peer_status WHERE peer_id = $1",
    )
    .bind(peer_id)
    .fetch_optional(pool)
    .await
}

/// Upsert the health row written on handshake: status, version, capabilities.
pub async fn upsert_peer_status_negotiated(
    pool: &DbPool,
    peer_id: &str,
    status: &str,
    version: &str,
    capabilities: &[String],
) -> Result<(), sqlx::Error> {
    let caps = serde_json::to_string(capabilities)
        .map_err(|e| sqlx::Error::Protocol(format!("invalid capabilities: {e}")))?;
    sqlx::query(
        "INSERT INTO peer_status (peer_id, status, version, capabilities, last_check_at)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (peer_id) DO UPDATE SET
             status = EXCLUDED.status,
             version = EXCLUDED.version,
             capabilities = EXCLUDED.capabilities,
             last_check_at = EXCLUDED.last_check_at",
    )
    .bind(peer_id)
    .bind(status)
    .bind(version)
    .bind(caps)
    .bind(now_db_text())
    .execute(pool)
    .await?;
    Ok(())
}

/// Upsert the health row written on a delivery outcome.
pub async fn upsert_peer_health(
    pool: &DbPool,
    peer_id: &str,
    status: &str,
    event_lag_ms: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO peer_status (peer_id, status, event_lag_ms, last_check_at)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (peer_id) DO UPDATE SET
             status = EXCLUDED.status,
             event_lag_ms = EXCLUDED.event_lag_ms,
             last_check_at = EXCLUDED.last_check_at",
    )
    .bind(peer_id)
    .bind(status)
    .bind(event_lag_ms)
    .bind(now_db_text())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn increment_peer_errors(pool: &DbPool, peer_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO peer_status (peer_id, status, errors_24h, last_check_at)
         VALUES ($1, 'unknown', 1, $2)
         ON CONFLICT (peer_id) DO UPDATE SET
             errors_24h = peer_status.errors_24h + 1,
             last_check_at = EXCLUDED.last_check_at",
    )
    .bind(peer_id)
    .bind(now_db_text())
    .execute(pool)
    .await?;
    Ok(())
}

/// Apply batched sent/received counter deltas in a single transaction.
pub async fn flush_peer_counters(
    pool: &DbPool,
    deltas: &[(String, i64, i64)],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for (peer_id, sent, received) in deltas {
        sqlx::query(
            "INSERT INTO peer_status (peer_id, status, events_sent, events_received)
             VALUES ($1, 'unknown', $2, $3)
             ON CONFLICT (peer_id) DO UPDATE SET
                 events_sent = peer_status.events_sent + EXCLUDED.events_sent,
                 events_received = peer_status.events_received + EXCLUDED.events_received",
        )
        .bind(peer_id)
        .bind(*sent)
        .bind(*received)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

// ---- peer_controls ----

pub async fn get_peer_control(
    pool: &DbPool,
    instance_id: &str,
    peer_id: &str,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "SELECT action FROM peer_controls WHERE instance_id = $1 AND peer_id = $2",
    )
    .bind(instance_id)
    .bind(peer_id)
    .fetch_optional(pool)
    .await
}

pub async fn set_peer_control(
    pool: &DbPool,
    instance_id: &str,
    peer_id: &str,
    action: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO peer_controls (instance_id, peer_id, action)
         VALUES ($1, $2, $3)
         ON CONFLICT (instance_id, peer_id) DO UPDATE SET action = EXCLUDED.action",
    )
    .bind(instance_id)
    .bind(peer_id)
    .bind(action)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn clear_peer_control(
    pool: &DbPool,
    instance_id: &str,
    peer_id: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM peer_controls WHERE instance_id = $1 AND peer_id = $2")
        .bind(instance_id)
        .bind(peer_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
