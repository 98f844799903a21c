//! In-process shared store.
//!
//! Backs a single logical cluster running in one process group: all state in
//! one mutex-guarded map set, pub/sub over broadcast channels, TTL as
//! clock-checked deadlines with lazy expiry. No call ever fails with
//! `Unavailable` here; fault paths are exercised through the test wrapper
//! that injects them.

use super::{
    ChannelMessage, LockToken, ScoredMember, SharedStore, StoreResult, Subscription,
};
use crate::clock::Clock;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

struct StringEntry {
    value: String,
    expires_at: Option<i64>,
}

struct LockEntry {
    token: String,
    expires_at: i64,
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, StringEntry>,
    zsets: HashMap<String, HashMap<String, f64>>,
    locks: HashMap<String, LockEntry>,
    channels: HashMap<String, broadcast::Sender<ChannelMessage>>,
}

pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn deadline(&self, ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|t| self.clock.now_millis() + t.as_millis() as i64)
    }

    fn live_string<'a>(inner: &'a mut Inner, key: &str, now: i64) -> Option<&'a mut StringEntry> {
        if let Some(entry) = inner.strings.get(key) {
            if entry.expires_at.is_some_and(|at| at <= now) {
                inner.strings.remove(key);
                return None;
            }
        }
        inner.strings.get_mut(key)
    }

    /// Ascending (score, member); the member order carries the FIFO
    /// tie-break for equal scores.
    fn sorted_members(set: &HashMap<String, f64>) -> Vec<ScoredMember> {
        let mut members: Vec<ScoredMember> = set
            .iter()
            .map(|(member, score)| ScoredMember {
                member: member.clone(),
                score: *score,
            })
            .collect();
        members.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.member.cmp(&b.member))
        });
        members
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let expires_at = self.deadline(ttl);
        let mut inner = self.inner.lock().unwrap();
        inner.strings.insert(
            key.to_owned(),
            StringEntry {
                value: value.to_owned(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap();
        Ok(Self::live_string(&mut inner, key, now).map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap();
        let live = Self::live_string(&mut inner, key, now).is_some();
        inner.strings.remove(key);
        Ok(live)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = self.clock.now_millis();
        let deadline = now + ttl.as_millis() as i64;
        let mut inner = self.inner.lock().unwrap();
        match Self::live_string(&mut inner, key, now) {
            Some(entry) => {
                entry.expires_at = Some(deadline);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let set = inner.zsets.entry(key.to_owned()).or_default();
        Ok(set.insert(member.to_owned(), score).is_none())
    }

    async fn zrem(&self, key: &str, members: &[&str]) -> StoreResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        let Some(set) = inner.zsets.get_mut(key) else {
            return Ok(0);
        };
        let removed = members.iter().filter(|m| set.remove(**m).is_some()).count();
        if set.is_empty() {
            inner.zsets.remove(key);
        }
        Ok(removed)
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<ScoredMember>> {
        let inner = self.inner.lock().unwrap();
        let Some(set) = inner.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let members = Self::sorted_members(set);
        let len = members.len() as i64;
        let norm = |idx: i64| -> i64 {
            if idx < 0 { (len + idx).max(0) } else { idx }
        };
        let start = norm(start);
        let stop = norm(stop).min(len - 1);
        if start > stop || start >= len {
            return Ok(Vec::new());
        }
        Ok(members[start as usize..=stop as usize].to_vec())
    }

    async fn zrank(&self, key: &str, member: &str) -> StoreResult<Option<usize>> {
        let inner = self.inner.lock().unwrap();
        let Some(set) = inner.zsets.get(key) else {
            return Ok(None);
        };
        Ok(Self::sorted_members(set)
            .iter()
            .position(|m| m.member == member))
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.zsets.get(key).map_or(0, HashMap::len))
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(set) = inner.zsets.get_mut(key) else {
            return Ok(Vec::new());
        };
        let doomed: Vec<String> = set
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(member, _)| member.clone())
            .collect();
        for member in &doomed {
            set.remove(member);
        }
        if set.is_empty() {
            inner.zsets.remove(key);
        }
        Ok(doomed)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let tx = {
            let inner = self.inner.lock().unwrap();
            inner.channels.get(channel).cloned()
        };
        if let Some(tx) = tx {
            // No subscribers is not an error.
            let _ = tx.send(ChannelMessage {
                channel: channel.to_owned(),
                payload: payload.to_owned(),
            });
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let mut broadcast_rx = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .channels
                .entry(channel.to_owned())
                .or_insert_with(|| broadcast::channel(256).0)
                .subscribe()
        };
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break; // subscriber dropped
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(rx))
    }

    async fn scan(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = self.clock.now_millis();
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .strings
            .iter()
            .filter(|(key, entry)| {
                key.starts_with(prefix) && !entry.expires_at.is_some_and(|at| at <= now)
            })
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn try_acquire(&self, key: &str, ttl: Duration) -> StoreResult<Option<LockToken>> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap();
        if let Some(holder) = inner.locks.get(key) {
            if holder.expires_at > now {
                return Ok(None);
            }
        }
        let token = Uuid::new_v4().to_string();
        inner.locks.insert(
            key.to_owned(),
            LockEntry {
                token: token.clone(),
                expires_at: now + ttl.as_millis() as i64,
            },
        );
        Ok(Some(LockToken(token)))
    }

    async fn release(&self, key: &str, token: &LockToken) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.locks.get(key) {
            Some(holder) if holder.token == token.0 => {
                inner.locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
