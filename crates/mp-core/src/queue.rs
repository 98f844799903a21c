//! Per-modality wait queues.
//!
//! Each modality is an ordered set scored by join time, with a sidecar JSON
//! blob per waiting user carrying the socket id. Pair extraction happens
//! under the per-modality distributed lock and removes both entries or
//! neither.

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::metrics::{MetricsSink, names};
use crate::store::{SharedStore, StoreError, StoreResult};
use mp_protocol::Modality;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Why a waiting entry left its queue; metric label values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    Cancel,
    Matched,
    Timeout,
    Disconnect,
}

impl LeaveReason {
    pub fn as_str(self) -> &'static str {
        match self {
            LeaveReason::Cancel => "cancel",
            LeaveReason::Matched => "matched",
            LeaveReason::Timeout => "timeout",
            LeaveReason::Disconnect => "disconnect",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingEntry {
    pub user_id: String,
    pub socket_id: String,
    /// Epoch milliseconds; doubles as the queue score.
    pub joined_at: i64,
}

/// Both halves of a successful pair extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedPair {
    pub caller: WaitingEntry,
    pub partner: WaitingEntry,
}

pub struct QueueManager {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl QueueManager {
    pub fn new(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        config: CoreConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            metrics,
        }
    }

    fn queue_key(modality: Modality) -> String {
        format!("queue:{modality}")
    }

    fn data_key(modality: Modality, user_id: &str) -> String {
        format!("queue:data:{modality}:{user_id}")
    }

    fn lock_key(modality: Modality) -> String {
        format!("lock:matching:{modality}")
    }

    async fn load_entry(
        &self,
        modality: Modality,
        user_id: &str,
    ) -> StoreResult<Option<WaitingEntry>> {
        let key = Self::data_key(modality, user_id);
        let Some(json) = self.store.get(&key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key,
                reason: e.to_string(),
            })
    }

    async fn store_entry(&self, modality: Modality, entry: &WaitingEntry) -> StoreResult<()> {
        let json = serde_json::to_string(entry).map_err(|e| StoreError::Corrupt {
            key: Self::data_key(modality, &entry.user_id),
            reason: e.to_string(),
        })?;
        // Outlives the queue membership so a sweep always finds it; the
        // sweep deletes both together.
        self.store
            .set(
                &Self::data_key(modality, &entry.user_id),
                &json,
                Some(self.config.queue_timeout * 2),
            )
            .await
    }

    async fn refresh_size_gauge(&self, modality: Modality) {
        if let Ok(size) = self.store.zcard(&Self::queue_key(modality)).await {
            self.metrics.gauge(
                names::QUEUE_SIZE,
                &[("modality", modality.as_str())],
                size as f64,
            );
        }
    }

    /// Insert a waiting entry. False when the user already waits in any
    /// modality.
    pub async fn enqueue(
        &self,
        user_id: &str,
        socket_id: &str,
        modality: Modality,
    ) -> StoreResult<bool> {
        for m in Modality::ALL {
            if self
                .store
                .zrank(&Self::queue_key(m), user_id)
                .await?
                .is_some()
            {
                return Ok(false);
            }
        }
        let entry = WaitingEntry {
            user_id: user_id.to_owned(),
            socket_id: socket_id.to_owned(),
            joined_at: self.clock.now_millis(),
        };
        self.store_entry(modality, &entry).await?;
        self.store
            .zadd(&Self::queue_key(modality), user_id, entry.joined_at as f64)
            .await?;
        debug!(user_id = %user_id, modality = %modality, "user enqueued");
        self.refresh_size_gauge(modality).await;
        Ok(true)
    }

    /// Put an extracted entry back at its original score. Used when session
    /// creation fails after extraction, so queue fairness is preserved.
    pub async fn requeue(&self, modality: Modality, entry: &WaitingEntry) -> StoreResult<()> {
        self.store_entry(modality, entry).await?;
        self.store
            .zadd(&Self::queue_key(modality), &entry.user_id, entry.joined_at as f64)
            .await?;
        Ok(())
    }

    /// Remove a waiting entry. True when a removal occurred.
    pub async fn dequeue(
        &self,
        user_id: &str,
        modality: Modality,
        reason: LeaveReason,
    ) -> StoreResult<bool> {
        let entry = self.load_entry(modality, user_id).await.ok().flatten();
        let removed = self
            .store
            .zrem(&Self::queue_key(modality), &[user_id])
            .await?;
        self.store
            .delete(&Self::data_key(modality, user_id))
            .await?;
        if removed == 0 {
            return Ok(false);
        }
        self.record_leave(modality, reason, entry.as_ref());
        self.refresh_size_gauge(modality).await;
        Ok(true)
    }

    fn record_leave(&self, modality: Modality, reason: LeaveReason, entry: Option<&WaitingEntry>) {
        self.metrics.counter(
            names::QUEUE_LEAVE_TOTAL,
            &[("modality", modality.as_str()), ("reason", reason.as_str())],
            1,
        );
        if let Some(entry) = entry {
            let waited_ms = (self.clock.now_millis() - entry.joined_at).max(0);
            self.metrics.histogram(
                names::QUEUE_WAIT_SECONDS,
                &[("modality", modality.as_str())],
                waited_ms as f64 / 1000.0,
            );
        }
    }

    /// Atomic two-party extraction.
    ///
    /// Under the per-modality lock, reads the two oldest entries; when the
    /// caller is one of them, removes both and returns both rehydrated
    /// entries. Every other outcome (lock busy, short queue, caller not at
    /// the head) returns None and the caller retries on a later tick.
    pub async fn pair(&self, user_id: &str, modality: Modality) -> StoreResult<Option<ExtractedPair>> {
        let lock_key = Self::lock_key(modality);
        let Some(token) = self
            .store
            .try_acquire(&lock_key, self.config.pair_lock_ttl)
            .await?
        else {
            return Ok(None);
        };

        let outcome = self.pair_locked(user_id, modality).await;

        if let Err(e) = self.store.release(&lock_key, &token).await {
            warn!(error = %e, modality = %modality, "pair lock release failed");
        }
        outcome
    }

    async fn pair_locked(
        &self,
        user_id: &str,
        modality: Modality,
    ) -> StoreResult<Option<ExtractedPair>> {
        let queue_key = Self::queue_key(modality);
        let head = self.store.zrange(&queue_key, 0, 1).await?;
        if head.len() < 2 {
            return Ok(None);
        }
        if !head.iter().any(|m| m.member == user_id) {
            // The caller is not at the head; the front two belong to each
            // other and the safety tick will claim them.
            return Ok(None);
        }
        let partner_id = head
            .iter()
            .map(|m| m.member.as_str())
            .find(|m| *m != user_id)
            .map(str::to_owned);
        let Some(partner_id) = partner_id else {
            return Ok(None);
        };
        let caller_score = head
            .iter()
            .find(|m| m.member == user_id)
            .map(|m| m.score)
            .unwrap_or_default();

        // Both out in one atomic removal; never exactly one.
        self.store
            .zrem(&queue_key, &[user_id, partner_id.as_str()])
            .await?;

        let caller = self.load_entry(modality, user_id).await?;
        let partner = self.load_entry(modality, &partner_id).await?;
        self.store
            .delete(&Self::data_key(modality, user_id))
            .await?;
        self.store
            .delete(&Self::data_key(modality, &partner_id))
            .await?;

        let Some(partner) = partner else {
            // Partner lost its sidecar blob (expired or corrupt): the caller
            // goes back at its original position, the corpse stays out.
            let caller = caller.unwrap_or(WaitingEntry {
                user_id: user_id.to_owned(),
                socket_id: String::new(),
                joined_at: caller_score as i64,
            });
            self.requeue(modality, &caller).await?;
            return Ok(None);
        };
        let Some(caller) = caller else {
            // The impersonated caller itself is a corpse; drop it and let
            // the next tick pick up the queue.
            self.requeue(modality, &partner).await?;
            return Ok(None);
        };

        self.record_leave(modality, LeaveReason::Matched, Some(&caller));
        self.record_leave(modality, LeaveReason::Matched, Some(&partner));
        self.refresh_size_gauge(modality).await;
        Ok(Some(ExtractedPair { caller, partner }))
    }

    /// 1-based queue position; 0 when absent.
    pub async fn position(&self, user_id: &str, modality: Modality) -> StoreResult<usize> {
        Ok(self
            .store
            .zrank(&Self::queue_key(modality), user_id)
            .await?
            .map_or(0, |rank| rank + 1))
    }

    pub async fn queue_size(&self, modality: Modality) -> StoreResult<usize> {
        self.store.zcard(&Self::queue_key(modality)).await
    }

    /// The oldest waiting user, if any; the safety tick impersonates it.
    pub async fn oldest_waiting(&self, modality: Modality) -> StoreResult<Option<String>> {
        Ok(self
            .store
            .zrange(&Self::queue_key(modality), 0, 0)
            .await?
            .into_iter()
            .next()
            .map(|m| m.member))
    }

    /// Drop entries older than the staleness cutoff across all modalities.
    pub async fn sweep_stale(&self) -> StoreResult<usize> {
        let cutoff = self.clock.now_millis() - self.config.queue_timeout.as_millis() as i64;
        let mut swept = 0;
        for modality in Modality::ALL {
            let removed = self
                .store
                .zremrangebyscore(&Self::queue_key(modality), f64::MIN, cutoff as f64)
                .await?;
            for user_id in &removed {
                self.store
                    .delete(&Self::data_key(modality, user_id))
                    .await?;
                self.record_leave(modality, LeaveReason::Timeout, None);
                debug!(user_id = %user_id, modality = %modality, "stale queue entry swept");
            }
            if !removed.is_empty() {
                self.refresh_size_gauge(modality).await;
            }
            swept += removed.len();
        }
        Ok(swept)
    }

    /// Disconnect cascade: remove the user wherever they wait.
    pub async fn remove_from_all(&self, user_id: &str) -> StoreResult<bool> {
        let mut removed = false;
        for modality in Modality::ALL {
            removed |= self
                .dequeue(user_id, modality, LeaveReason::Disconnect)
                .await?;
        }
        Ok(removed)
    }

    /// Stale-entry sweeper; runs until shutdown flips.
    pub async fn run_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.queue_cleanup_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sweep_stale().await {
                        Ok(0) => {}
                        Ok(n) => debug!(count = n, "swept stale queue entries"),
                        Err(e) => {
                            warn!(error = %e, "queue sweep failed");
                            self.metrics.counter(names::ERRORS_TOTAL, &[("subsystem", "queue")], 1);
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}
