//! Token-bucket rate limiting.
//!
//! Three buckets exist per the connection contract: connects per IP,
//! messages per socket, queue joins per user. All are clock-driven so tests
//! stay deterministic.

use crate::clock::Clock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_ms: f64,
    last_refill_ms: i64,
}

impl TokenBucket {
    /// `max` events per `window`, refilling continuously.
    pub fn new(max: u32, window: Duration, now_ms: i64) -> Self {
        let capacity = f64::from(max);
        Self {
            capacity,
            tokens: capacity,
            refill_per_ms: capacity / window.as_millis() as f64,
            last_refill_ms: now_ms,
        }
    }

    pub fn try_take(&mut self, now_ms: i64) -> bool {
        let elapsed = (now_ms - self.last_refill_ms).max(0) as f64;
        self.tokens = (self.tokens + elapsed * self.refill_per_ms).min(self.capacity);
        self.last_refill_ms = now_ms;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Keyed bucket map (per-IP connect limiting). Buckets idle for over an
/// hour are pruned on access.
pub struct KeyedLimiter<K: Eq + Hash + Clone> {
    clock: Arc<dyn Clock>,
    max: u32,
    window: Duration,
    buckets: Mutex<HashMap<K, TokenBucket>>,
}

impl<K: Eq + Hash + Clone> KeyedLimiter<K> {
    const IDLE_PRUNE_MS: i64 = 60 * 60 * 1000;

    pub fn new(clock: Arc<dyn Clock>, max: u32, window: Duration) -> Self {
        Self {
            clock,
            max,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: &K) -> bool {
        let now = self.clock.now_millis();
        let mut buckets = self.buckets.lock().unwrap();
        buckets.retain(|_, b| now - b.last_refill_ms < Self::IDLE_PRUNE_MS);
        buckets
            .entry(key.clone())
            .or_insert_with(|| TokenBucket::new(self.max, self.window, now))
            .try_take(now)
    }
}
