use amityvox_db::DbPool;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default, Clone, Copy)]
struct CounterDelta {
    sent: i64,
    received: i64,
}

/// Batched per-peer sent/received counters.
///
/// Increments land in an in-memory map; a periodic task swaps the map out
/// and flushes it in one transaction. A failed flush merges the deltas back
/// so counts are never lost.
pub struct CounterBatch {
    pending: Mutex<HashMap<String, CounterDelta>>,
}

impl CounterBatch {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_sent(&self, peer_id: &str) {
        let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(peer_id.to_string()).or_default().sent += 1;
    }

    pub fn record_received(&self, peer_id: &str) {
        let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(peer_id.to_string()).or_default().received += 1;
    }

    fn take(&self) -> HashMap<String, CounterDelta> {
        let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *map)
    }

    fn merge_back(&self, deltas: HashMap<String, CounterDelta>) {
        let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for (peer_id, delta) in deltas {
            let entry = map.entry(peer_id).or_default();
            entry.sent += delta.sent;
            entry.received += delta.received;
        }
    }

    /// Swap the pending map and write it to `peer_status` in one
    /// transaction. Runs every few seconds and once more at shutdown.
    pub async fn flush(&self, pool: &DbPool) {
        let taken = self.take();
        if taken.is_empty() {
            return;
        }
        let rows: Vec<(String, i64, i64)> = taken
            .iter()
            .map(|(peer_id, delta)| (peer_id.clone(), delta.sent, delta.received))
            .collect();
        if let Err(e) = amityvox_db::peers::flush_peer_counters(pool, &rows).await {
            tracing::warn!("counter flush failed, retaining deltas: {e}");
            self.merge_back(taken);
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for CounterBatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flush_writes_and_drains() {
        let pool = amityvox_db::create_pool("sqlite::memory:", 1)
            .await
            .expect("pool");
        amityvox_db::run_migrations(&pool).await.expect("migrations");

        let batch = CounterBatch::new();
        batch.record_sent("B");
        batch.record_sent("B");
        batch.record_received("B");
        batch.record_received("C");

        batch.flush(&pool).await;
        assert_eq!(batch.pending_len(), 0);

        let b = amityvox_db::peers::get_peer_status(&pool, "B")
            .await
            .expect("query")
            .expect("row");
        assert_eq!(b.events_sent, 2);
        assert_eq!(b.events_received, 1);

        // A second flush with nothing pending is a no-op.
        batch.flush(&pool).await;
        let b = amityvox_db::peers::get_peer_status(&pool, "B")
            .await
            .expect("query")
            .expect("row");
        assert_eq!(b.events_sent, 2);
    }

    #[tokio::test]
    async fn failed_flush_merges_deltas_back() {
        // A pool with no migrations: the flush transaction fails.
        let pool = amityvox_db::create_pool("sqlite::memory:", 1)
            .await
            .expect("pool");

        let batch = CounterBatch::new();
        batch.record_sent("B");
        batch.flush(&pool).await;
        assert_eq!(batch.pending_len(), 1, "delta must survive a failed flush");
    }
}
