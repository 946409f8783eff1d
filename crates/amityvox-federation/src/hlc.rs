use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// A hybrid logical clock timestamp: wall-clock milliseconds plus a logical
/// counter breaking ties within one millisecond.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Hlc {
    pub wall_ms: i64,
    pub counter: u32,
}

impl Hlc {
    pub fn new(wall_ms: i64, counter: u32) -> Self {
        Self { wall_ms, counter }
    }

    /// Lexicographic order on `(wall_ms, counter)`.
    pub fn before(a: Hlc, b: Hlc) -> bool {
        a < b
    }
}

/// Thread-safe hybrid logical clock.
///
/// Every timestamp handed out strictly succeeds the previous one; updating
/// from a remote timestamp yields one that strictly succeeds both sides.
pub struct HybridLogicalClock {
    inner: Mutex<Hlc>,
}

impl HybridLogicalClock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Hlc::default()),
        }
    }

    fn wall_now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    pub fn now(&self) -> Hlc {
        self.now_at(Self::wall_now_ms())
    }

    pub fn update(&self, remote: Hlc) -> Hlc {
        self.update_at(remote, Self::wall_now_ms())
    }

    fn now_at(&self, now_ms: i64) -> Hlc {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if now_ms > state.wall_ms {
            state.wall_ms = now_ms;
            state.counter = 0;
        } else {
            state.counter += 1;
        }
        *state
    }

    fn update_at(&self, remote: Hlc, now_ms: i64) -> Hlc {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let wall = now_ms.max(state.wall_ms).max(remote.wall_ms);
        let counter = if wall == state.wall_ms && wall == remote.wall_ms {
            state.counter.max(remote.counter) + 1
        } else if wall == state.wall_ms {
            state.counter + 1
        } else if wall == remote.wall_ms {
            remote.counter + 1
        } else {
            0
        };
        state.wall_ms = wall;
        state.counter = counter;
        *state
    }

    /// Current value without advancing the clock.
    pub fn peek(&self) -> Hlc {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for HybridLogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_strictly_monotone() {
        let clock = HybridLogicalClock::new();
        let mut last = clock.now();
        for _ in 0..10_000 {
            let next = clock.now();
            assert!(Hlc::before(last, next));
            last = next;
        }
    }

    #[test]
    fn now_resets_counter_when_wall_advances() {
        let clock = HybridLogicalClock::new();
        let a = clock.now_at(100);
        assert_eq!(a, Hlc::new(100, 0));
        let b = clock.now_at(100);
        assert_eq!(b, Hlc::new(100, 1));
        let c = clock.now_at(150);
        assert_eq!(c, Hlc::new(150, 0));
    }

    #[test]
    fn update_strictly_succeeds_both_sides() {
        let clock = HybridLogicalClock::new();
        let local = clock.now_at(100);
        let remote = Hlc::new(500, 7);
        let merged = clock.update_at(remote, 100);
        assert!(Hlc::before(local, merged));
        assert!(Hlc::before(remote, merged));
        assert_eq!(merged, Hlc::new(500, 8));
    }

    #[test]
    fn update_with_stale_remote_still_advances() {
        let clock = HybridLogicalClock::new();
        let local = clock.now_at(100);
        let merged = clock.update_at(Hlc::new(50, 3), 100);
        assert!(Hlc::before(local, merged));
        assert_eq!(merged.wall_ms, 100);
    }

    #[test]
    fn update_prefers_fresh_wall_clock() {
        let clock = HybridLogicalClock::new();
        clock.now_at(100);
        let merged = clock.update_at(Hlc::new(50, 3), 200);
        assert_eq!(merged, Hlc::new(200, 0));
    }

    #[test]
    fn parallel_callers_never_observe_duplicates() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let clock = Arc::new(HybridLogicalClock::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let clock = Arc::clone(&clock);
            handles.push(std::thread::spawn(move || {
                (0..1_000).map(|_| clock.now()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for ts in handle.join().expect("thread") {
                assert!(seen.insert((ts.wall_ms, ts.counter)), "duplicate {ts:?}");
            }
        }
    }

    #[test]
    fn before_is_lexicographic() {
        assert!(Hlc::before(Hlc::new(1, 5), Hlc::new(2, 0)));
        assert!(Hlc::before(Hlc::new(1, 0), Hlc::new(1, 1)));
        assert!(!Hlc::before(Hlc::new(2, 0), Hlc::new(1, 9)));
        assert!(!Hlc::before(Hlc::new(1, 1), Hlc::new(1, 1)));
    }
}
