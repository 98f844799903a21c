//! Shared-store abstraction.
//!
//! The cluster-global surface every subsystem builds on: strings with TTL,
//! ordered sets scored by f64, pub/sub channels, a prefix scan, and a
//! distributed single-writer lock. Any backend providing these primitives
//! works; `MemoryStore` is the in-process one.
//!
//! Members with equal scores order lexicographically; the queue FIFO
//! tie-break rides on this.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Transport-level failure; callers treat this as a transient refusal.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A value failed to parse; the key is suspect, not the transport.
    #[error("malformed value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One ordered-set member with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

/// Fencing token proving lock ownership; release is a no-op for any other
/// token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(pub String);

/// A message received from a pub/sub channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

/// Receiving half of a channel subscription. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::Receiver<ChannelMessage>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<ChannelMessage>) -> Self {
        Self { rx }
    }

    /// None when the store side shut down.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    // -- strings ----------------------------------------------------------

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    /// True when the key existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;
    /// Refresh a key's TTL; false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    // -- ordered sets -----------------------------------------------------

    /// True when the member was newly inserted (false on score update).
    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<bool>;
    /// Atomic multi-remove; returns how many members were present.
    async fn zrem(&self, key: &str, members: &[&str]) -> StoreResult<usize>;
    /// Inclusive index range over ascending (score, member) order;
    /// negative indices count from the end, Redis-style.
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<ScoredMember>>;
    /// Ascending rank of a member, if present.
    async fn zrank(&self, key: &str, member: &str) -> StoreResult<Option<usize>>;
    async fn zcard(&self, key: &str) -> StoreResult<usize>;
    /// Remove members with `min <= score <= max`; returns the removed
    /// members so callers can clean up sidecar keys.
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>>;

    // -- pub/sub ----------------------------------------------------------

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;
    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;

    // -- scan -------------------------------------------------------------

    /// All live string keys starting with `prefix`.
    async fn scan(&self, prefix: &str) -> StoreResult<Vec<String>>;

    // -- distributed lock -------------------------------------------------

    /// Set-if-absent with TTL. None when another holder has the lock.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> StoreResult<Option<LockToken>>;
    /// Release only if `token` still owns the lock; true on release.
    async fn release(&self, key: &str, token: &LockToken) -> StoreResult<bool>;
}
