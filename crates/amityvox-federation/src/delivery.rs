use crate::client::DeliveryOutcome;
use crate::{FederationError, FederationService};
use amityvox_db::delivery as queue;
use std::sync::Arc;
use std::time::Duration;

/// Attempts before an envelope is dead-lettered.
pub const MAX_DELIVERY_ATTEMPTS: i64 = 10;

/// How long a claimed envelope stays invisible before redelivery.
pub const ACK_WAIT: Duration = Duration::from_secs(30);

const RETRY_BATCH: i64 = 50;
const RETRY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Bounded exponential backoff, clamped at the last step.
pub fn backoff_delay(attempt: i64) -> Duration {
    const SCHEDULE: [Duration; 5] = [
        Duration::from_secs(5),
        Duration::from_secs(30),
        Duration::from_secs(120),
        Duration::from_secs(600),
        Duration::from_secs(3_600),
    ];
    SCHEDULE[attempt.clamp(0, SCHEDULE.len() as i64 - 1) as usize]
}

impl FederationService {
    /// One asynchronous delivery to a peer inbox. Transport errors and 5xx
    /// land in the retry queue; 4xx means the peer will never accept this
    /// envelope, so it is dropped with an error count.
    pub async fn deliver_to_peer(
        &self,
        domain: &str,
        peer_id: &str,
        envelope_json: &str,
        message_id: Option<&str>,
    ) {
        match self.client.post_inbox(domain, envelope_json).await {
            DeliveryOutcome::Delivered => {
                self.counters.record_sent(peer_id);
                self.update_peer_health(peer_id, true, 0).await;
                if let Some(message_id) = message_id {
                    let _ = queue::upsert_delivery_receipt(
                        &self.db,
                        message_id,
                        &self.config.domain,
                        domain,
                        "delivered",
                        1,
                        None,
                    )
                    .await;
                }
            }
            DeliveryOutcome::Retryable(error) => {
                tracing::warn!(peer = domain, "delivery failed, queueing retry: {error}");
                let _ = amityvox_db::peers::increment_peer_errors(&self.db, peer_id).await;
                if let Err(e) = self.enqueue_retry(domain, Some(peer_id), envelope_json).await {
                    tracing::error!(peer = domain, "enqueueing retry failed: {e}");
                }
                if let Some(message_id) = message_id {
                    let _ = queue::upsert_delivery_receipt(
                        &self.db,
                        message_id,
                        &self.config.domain,
                        domain,
                        "failed",
                        1,
                        Some(&error),
                    )
                    .await;
                }
            }
            DeliveryOutcome::Rejected(status, body) => {
                tracing::warn!(peer = domain, %status, "delivery rejected, dropping: {body}");
                let _ = amityvox_db::peers::increment_peer_errors(&self.db, peer_id).await;
            }
        }
    }

    pub(crate) async fn enqueue_retry(
        &self,
        domain: &str,
        peer_id: Option<&str>,
        envelope_json: &str,
    ) -> Result<(), FederationError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        queue::enqueue_retry(
            &self.db,
            &amityvox_util::id::generate(),
            domain,
            peer_id,
            envelope_json,
            now_ms + backoff_delay(0).as_millis() as i64,
        )
        .await?;
        Ok(())
    }

    /// Drain due retry envelopes once. Returns how many were processed.
    pub async fn process_retry_queue_once(&self) -> Result<usize, FederationError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let due = queue::claim_due_retries(
            &self.db,
            now_ms,
            now_ms + ACK_WAIT.as_millis() as i64,
            RETRY_BATCH,
        )
        .await?;
        let processed = due.len();

        for envelope in due {
            let attempt = envelope.attempts;
            if attempt >= MAX_DELIVERY_ATTEMPTS {
                self.dead_letter(
                    &envelope.id,
                    &envelope.domain,
                    &envelope.payload,
                    &format!("exhausted {MAX_DELIVERY_ATTEMPTS} retry attempts"),
                    attempt,
                )
                .await;
                continue;
            }

            match self.client.post_inbox(&envelope.domain, &envelope.payload).await {
                DeliveryOutcome::Delivered => {
                    if let Err(e) = queue::ack_retry(&self.db, &envelope.id).await {
                        tracing::error!("acking retry {} failed: {e}", envelope.id);
                    }
                    if let Some(peer_id) = envelope.peer_id.as_deref() {
                        self.counters.record_sent(peer_id);
                        self.update_peer_health(peer_id, true, 0).await;
                    }
                    tracing::info!(peer = %envelope.domain, attempt, "redelivery succeeded");
                }
                DeliveryOutcome::Retryable(error) => {
                    let delay = backoff_delay(attempt);
                    let next = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
                    match queue::nak_retry(&self.db, &envelope.id, next).await {
                        Ok(attempts) => tracing::debug!(
                            peer = %envelope.domain,
                            attempts,
                            delay_secs = delay.as_secs(),
                            "redelivery failed, backing off: {error}"
                        ),
                        Err(e) => tracing::error!("naking retry {} failed: {e}", envelope.id),
                    }
                    if let Some(peer_id) = envelope.peer_id.as_deref() {
                        let _ = amityvox_db::peers::increment_peer_errors(&self.db, peer_id).await;
                    }
                }
                DeliveryOutcome::Rejected(status, body) => {
                    self.dead_letter(
                        &envelope.id,
                        &envelope.domain,
                        &envelope.payload,
                        &format!("peer rejected with {status}: {body}"),
                        attempt,
                    )
                    .await;
                }
            }
        }
        Ok(processed)
    }

    async fn dead_letter(
        &self,
        retry_id: &str,
        domain: &str,
        payload: &str,
        error_message: &str,
        attempts: i64,
    ) {
        tracing::error!(peer = domain, attempts, "dead-lettering envelope: {error_message}");
        if let Err(e) = queue::insert_dead_letter(
            &self.db,
            &amityvox_util::id::generate(),
            domain,
            payload,
            error_message,
            attempts,
        )
        .await
        {
            tracing::error!("writing dead letter failed, envelope stays queued: {e}");
            return;
        }
        if let Err(e) = queue::ack_retry(&self.db, retry_id).await {
            tracing::error!("acking dead-lettered retry {retry_id} failed: {e}");
        }
    }
}

/// The single durable retry consumer. Runs until shutdown is notified.
pub async fn run_retry_consumer(
    service: Arc<FederationService>,
    shutdown: Arc<tokio::sync::Notify>,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = tokio::time::sleep(RETRY_POLL_INTERVAL) => {
                if let Err(e) = service.process_retry_queue_once().await {
                    tracing::error!("retry consumer pass failed: {e}");
                }
            }
        }
    }
}

/// Periodic counter flush; flushes once more on shutdown so no counts are
/// dropped.
pub async fn run_counter_flusher(
    service: Arc<FederationService>,
    shutdown: Arc<tokio::sync::Notify>,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                service.counters.flush(&service.db).await;
                break;
            }
            _ = tick.tick() => service.counters.flush(&service.db).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_service;

    #[test]
    fn backoff_schedule_matches_and_clamps() {
        assert_eq!(backoff_delay(0), Duration::from_secs(5));
        assert_eq!(backoff_delay(1), Duration::from_secs(30));
        assert_eq!(backoff_delay(2), Duration::from_secs(120));
        assert_eq!(backoff_delay(3), Duration::from_secs(600));
        assert_eq!(backoff_delay(4), Duration::from_secs(3_600));
        assert_eq!(backoff_delay(5), Duration::from_secs(3_600));
        assert_eq!(backoff_delay(100), Duration::from_secs(3_600));
        assert_eq!(backoff_delay(-1), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn exhausted_envelope_becomes_dead_letter() {
        let service = test_service().await;
        let now_ms = chrono::Utc::now().timestamp_millis();
        amityvox_db::delivery::enqueue_retry(
            service.db(),
            "R1",
            "b.example",
            Some("B"),
            "{\"payload\":{}}",
            now_ms - 1,
        )
        .await
        .expect("enqueue");
        // Simulate ten spent attempts.
        for _ in 0..MAX_DELIVERY_ATTEMPTS {
            amityvox_db::delivery::nak_retry(service.db(), "R1", now_ms - 1)
                .await
                .expect("nak");
        }

        let processed = service.process_retry_queue_once().await.expect("pass");
        assert_eq!(processed, 1);

        let letters = amityvox_db::delivery::list_dead_letters(service.db(), 10)
            .await
            .expect("letters");
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, MAX_DELIVERY_ATTEMPTS);
        assert!(letters[0]
            .error_message
            .contains("exhausted 10 retry attempts"));

        assert_eq!(
            amityvox_db::delivery::pending_retry_count(service.db())
                .await
                .expect("count"),
            0,
            "dead-lettered envelope must be acked out of the queue"
        );
    }

    #[tokio::test]
    async fn queue_is_empty_pass_is_a_noop() {
        let service = test_service().await;
        let processed = service.process_retry_queue_once().await.expect("pass");
        assert_eq!(processed, 0);
    }
}
