use crate::{now_db_text, DbPool};
use sqlx::Row;

/// A signed envelope waiting for redelivery.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RetryEnvelopeRow {
    pub id: String,
    pub domain: String,
    pub peer_id: Option<String>,
    pub payload: String,
    pub attempts: i64,
}

pub async fn enqueue_retry(
    pool: &DbPool,
    id: &str,
    domain: &str,
    peer_id: Option<&str>,
    payload: &str,
    next_attempt_at_ms: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO retry_queue (id, domain, peer_id, payload, attempts, next_attempt_at, created_at)
         VALUES ($1, $2, $3, $4, 0, $5, $6)",
    )
    .bind(id)
    .bind(domain)
    .bind(peer_id)
    .bind(payload)
    .bind(next_attempt_at_ms)
    .bind(now_db_text())
    .execute(pool)
    .await?;
    Ok(())
}

/// Claim due envelopes for one consumer pass. Claimed rows are invisible to
/// other consumers until `lock_until_ms`; an orphaned claim is simply
/// redelivered once the lock lapses.
pub async fn claim_due_retries(
    pool: &DbPool,
    now_ms: i64,
    lock_until_ms: i64,
    limit: i64,
) -> Result<Vec<RetryEnvelopeRow>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let rows = sqlx::query_as::<_, RetryEnvelopeRow>(
        "SELECT id, domain, peer_id, payload, attempts FROM retry_queue
         WHERE next_attempt_at <= $1 AND (locked_until IS NULL OR locked_until <= $1)
         ORDER BY next_attempt_at ASC
         LIMIT $2",
    )
    .bind(now_ms)
    .bind(limit)
    .fetch_all(&mut *tx)
    .await?;

    for row in &rows {
        sqlx::query("UPDATE retry_queue SET locked_until = $2 WHERE id = $1")
            .bind(&row.id)
            .bind(lock_until_ms)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(rows)
}

/// Ack: the envelope was delivered (or dead-lettered); drop it.
pub async fn ack_retry(pool: &DbPool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM retry_queue WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Nak with delay: bump the attempt count and reschedule.
pub async fn nak_retry(
    pool: &DbPool,
    id: &str,
    next_attempt_at_ms: i64,
) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        "UPDATE retry_queue
         SET attempts = attempts + 1, next_attempt_at = $2, locked_until = NULL
         WHERE id = $1
         RETURNING attempts",
    )
    .bind(id)
    .bind(next_attempt_at_ms)
    .fetch_one(pool)
    .await?;
    row.try_get("attempts")
}

pub async fn pending_retry_count(pool: &DbPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM retry_queue")
        .fetch_one(pool)
        .await
}

// ---- dead letters ----

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeadLetterRow {
    pub id: String,
    pub target_domain: String,
    pub payload: String,
    pub error_message: String,
    pub attempts: i64,
    pub created_at: String,
}

pub async fn insert_dead_letter(
    pool: &DbPool,
    id: &str,
    target_domain: &str,
    payload: &str,
    error_message: &str,
    attempts: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO dead_letters (id, target_domain, payload, error_message, attempts, created_at)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(id)
    .bind(target_domain)
    .bind(payload)
    .bind(error_message)
    .bind(attempts)
    .bind(now_db_text())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_dead_letters(
    pool: &DbPool,
    limit: i64,
) -> Result<Vec<DeadLetterRow>, sqlx::Error> {
    sqlx::query_as::<_, DeadLetterRow>(
        "SELECT id, target_domain, payload, error_message, attempts, created_at
         FROM dead_letters ORDER BY created_at DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn dead_letter_count(pool: &DbPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
        .fetch_one(pool)
        .await
}

// ---- delivery receipts ----

pub async fn upsert_delivery_receipt(
    pool: &DbPool,
    message_id: &str,
    source: &str,
    target: &str,
    status: &str,
    attempts: i64,
    error: Option<&str>,
) -> Result<(), sqlx::Error> {
    let now = now_db_text();
    let delivered_at = if status == "delivered" {
        Some(now.clone())
    } else {
        None
    };
    sqlx::query(
        "INSERT INTO delivery_receipts (message_id, source, target, status, attempts, \
         last_attempt_at, delivered_at, error)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         ON CONFLICT (message_id, target) DO UPDATE SET
             status = EXCLUDED.status,
             attempts = EXCLUDED.attempts,
             last_attempt_at = EXCLUDED.last_attempt_at,
             delivered_at = EXCLUDED.delivered_at,
             error = EXCLUDED.error",
    )
    .bind(message_id)
    .bind(source)
    .bind(target)
    .bind(status)
    .bind(attempts)
    .bind(&now)
    .bind(delivered_at)
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}
