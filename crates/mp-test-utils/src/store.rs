//! Fault-injecting store wrapper.
//!
//! Wraps any `SharedStore` and, while tripped, fails every call with
//! `StoreError::Unavailable`, the transport-failure mode callers must
//! treat as a transient refusal.

use async_trait::async_trait;
use mp_core::store::{
    LockToken, ScoredMember, SharedStore, StoreError, StoreResult, Subscription,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub struct FlakyStore {
    inner: Arc<dyn SharedStore>,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn SharedStore>) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
        }
    }

    /// Everything fails until `heal` is called.
    pub fn trip(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected fault".to_owned()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SharedStore for FlakyStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        self.inner.expire(key, ttl).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
        self.check()?;
        self.inner.zadd(key, member, score).await
    }

    async fn zrem(&self, key: &str, members: &[&str]) -> StoreResult<usize> {
        self.check()?;
        self.inner.zrem(key, members).await
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<ScoredMember>> {
        self.check()?;
        self.inner.zrange(key, start, stop).await
    }

    async fn zrank(&self, key: &str, member: &str) -> StoreResult<Option<usize>> {
        self.check()?;
        self.inner.zrank(key, member).await
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        self.check()?;
        self.inner.zcard(key).await
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>> {
        self.check()?;
        self.inner.zremrangebyscore(key, min, max).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        self.check()?;
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        self.check()?;
        self.inner.subscribe(channel).await
    }

    async fn scan(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        self.inner.scan(prefix).await
    }

    async fn try_acquire(&self, key: &str, ttl: Duration) -> StoreResult<Option<LockToken>> {
        self.check()?;
        self.inner.try_acquire(key, ttl).await
    }

    async fn release(&self, key: &str, token: &LockToken) -> StoreResult<bool> {
        self.check()?;
        self.inner.release(key, token).await
    }
}
