use crate::{json_from_db_text, DbPool};
use serde_json::Value;
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct FederationEventRow {
    pub id: String,
    pub instance_id: String,
    pub event_type: String,
    pub guild_id: Option<String>,
    pub channel_id: Option<String>,
    pub hlc_wall_ms: i64,
    pub hlc_counter: i64,
    pub payload: Value,
    pub created_at: String,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for FederationEventRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let payload_raw: String = row.try_get("payload")?;
        Ok(Self {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            event_type: row.try_get("event_type")?,
            guild_id: row.try_get("guild_id")?,
            channel_id: row.try_get("channel_id")?,
            hlc_wall_ms: row.try_get("hlc_wall_ms")?,
            hlc_counter: row.try_get("hlc_counter")?,
            payload: json_from_db_text(&payload_raw)?,
            created_at: row.try_get("created_at")?,
        })
    }
}

const EVENT_COLUMNS: &str = "id, instance_id, event_type, guild_id, channel_id, hlc_wall_ms, \
     hlc_counter, payload, created_at";

/// Append an event for later backfill. An origin's HLC uniquely identifies
/// an event, so redelivered envelopes are ignored here.
#[allow(clippy::too_many_arguments)]
pub async fn append_event(
    pool: &DbPool,
    id: &str,
    instance_id: &str,
    event_type: &str,
    guild_id: Option<&str>,
    channel_id: Option<&str>,
    hlc_wall_ms: i64,
    hlc_counter: i64,
    payload: &Value,
    created_at: &str,
) -> Result<bool, sqlx::Error> {
    let payload_text = serde_json::to_string(payload)
        .map_err(|e| sqlx::Error::Protocol(format!("invalid event payload json: {e}")))?;
    let rows = sqlx::query(
        "INSERT INTO federation_events (id, instance_id, event_type, guild_id, channel_id, \
         hlc_wall_ms, hlc_counter, payload, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         ON CONFLICT (instance_id, hlc_wall_ms, hlc_counter) DO NOTHING",
    )
    .bind(id)
    .bind(instance_id)
    .bind(event_type)
    .bind(guild_id)
    .bind(channel_id)
    .bind(hlc_wall_ms)
    .bind(hlc_counter)
    .bind(payload_text)
    .bind(created_at)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

/// Events strictly after `(wall, counter)` for the given guilds, ascending.
/// Fetches one extra row so the caller can detect truncation.
pub async fn list_events_since(
    pool: &DbPool,
    guild_ids: &[String],
    hlc_wall_ms: i64,
    hlc_counter: i64,
    limit: i64,
) -> Result<Vec<FederationEventRow>, sqlx::Error> {
    if guild_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders: Vec<String> = (0..guild_ids.len()).map(|i| format!("${}", i + 4)).collect();
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM federation_events
         WHERE (hlc_wall_ms > $1 OR (hlc_wall_ms = $1 AND hlc_counter > $2))
           AND guild_id IN ({})
         ORDER BY hlc_wall_ms ASC, hlc_counter ASC
         LIMIT $3",
        placeholders.join(", ")
    );
    let mut query = sqlx::query_as::<_, FederationEventRow>(&sql)
        .bind(hlc_wall_ms)
        .bind(hlc_counter)
        .bind(limit);
    for guild_id in guild_ids {
        query = query.bind(guild_id);
    }
    query.fetch_all(pool).await
}

pub async fn get_event(pool: &DbPool, id: &str) -> Result<Option<FederationEventRow>, sqlx::Error> {
    sqlx::query_as::<_, FederationEventRow>(&format!(
        "SELECT {EVENT_COLUMNS} FROM federation_events WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pool;

    async fn seed(pool: &DbPool, id: &str, guild: &str, wall: i64, counter: i64) {
        append_event(
            pool,
            id,
            "B",
            "MESSAGE_CREATE",
            Some(guild),
            Some("C"),
            wall,
            counter,
            &serde_json::json!({"id": id}),
            "2024-01-01T00:00:00Z",
        )
        .await
        .expect("append");
    }

    #[tokio::test]
    async fn redelivery_with_same_origin_hlc_is_ignored() {
        let pool = test_pool().await;
        seed(&pool, "E1", "G", 1, 0).await;
        let inserted = append_event(
            &pool,
            "E1-redelivered",
            "B",
            "MESSAGE_CREATE",
            Some("G"),
            None,
            1,
            0,
            &serde_json::json!({}),
            "2024-01-01T00:00:00Z",
        )
        .await
        .expect("append");
        assert!(!inserted);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM federation_events")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn since_query_is_strict_and_ordered() {
        let pool = test_pool().await;
        seed(&pool, "E1", "G", 1, 0).await;
        seed(&pool, "E2", "G", 1, 1).await;
        seed(&pool, "E3", "G", 2, 0).await;
        seed(&pool, "E4", "H", 2, 1).await;

        let rows = list_events_since(&pool, &["G".to_string()], 1, 0, 10)
            .await
            .expect("query");
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["E2", "E3"]);
    }

    #[tokio::test]
    async fn since_query_respects_guild_filter_and_limit() {
        let pool = test_pool().await;
        seed(&pool, "E1", "G", 1, 0).await;
        seed(&pool, "E2", "H", 1, 1).await;
        seed(&pool, "E3", "G", 2, 0).await;

        let rows = list_events_since(&pool, &["G".to_string(), "H".to_string()], 0, 0, 2)
            .await
            .expect("query");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "E1");
        assert_eq!(rows[1].id, "E2");
    }
}
