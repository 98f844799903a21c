//! Wall-clock abstraction.
//!
//! Every timestamp the core writes (queue scores, session start times,
//! heartbeats, TTL deadlines in the in-memory store) goes through `Clock`,
//! so scenario tests run against a manually advanced clock.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    /// Epoch milliseconds; the score unit for queue ordering.
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Production clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock advanced by hand.
///
/// Starts at a fixed epoch so assertions on absolute scores are stable.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
    // Serializes advance() from concurrent test tasks.
    step: Mutex<()>,
}

impl ManualClock {
    pub const DEFAULT_EPOCH_MS: i64 = 1_700_000_000_000;

    pub fn new() -> Self {
        Self::starting_at(Self::DEFAULT_EPOCH_MS)
    }

    pub fn starting_at(epoch_millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(epoch_millis),
            step: Mutex::new(()),
        }
    }

    pub fn advance_millis(&self, by: i64) {
        let _guard = self.step.lock().unwrap();
        self.millis.fetch_add(by, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, by: i64) {
        self.advance_millis(by * 1000);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst))
            .unwrap_or_else(Utc::now)
    }

    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}
