//! Session lifecycle.
//!
//! A session is the authoritative record of one active pairing. The record
//! and the two reverse pointers (`session:user:{id}` -> session id) live and
//! die together; partner lookup is one pointer walk. A reconciliation sweep
//! closes sessions whose owners vanished.

use crate::clock::Clock;
use crate::collab::SessionHistory;
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::metrics::{MetricsSink, names};
use crate::store::{SharedStore, StoreError, StoreResult};
use chrono::DateTime;
use mp_protocol::Modality;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MATCH_CHANNEL: &str = "fleet:match";
const SESSION_CREATE_LOCK: &str = "lock:session:create";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
    Abandoned,
}

/// Why a session ended; forwarded to the history collaborator and used as a
/// metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    Normal,
    Skip,
    Disconnect,
    Timeout,
    Abandoned,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::Normal => "normal",
            EndReason::Skip => "skip",
            EndReason::Disconnect => "disconnect",
            EndReason::Timeout => "timeout",
            EndReason::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub modality: Modality,
    pub user_a: String,
    pub user_b: String,
    /// Epoch milliseconds.
    pub started_at: i64,
    pub status: SessionStatus,
}

impl Session {
    /// The member that is not `user_id`, if the user belongs to the session.
    pub fn partner_of(&self, user_id: &str) -> Option<&str> {
        if self.user_a == user_id {
            Some(&self.user_b)
        } else if self.user_b == user_id {
            Some(&self.user_a)
        } else {
            None
        }
    }
}

/// Cluster-wide announcement published on session creation.
#[derive(Debug, Serialize, Deserialize)]
pub struct MatchAnnouncement {
    pub session_id: String,
    pub user_a: String,
    pub user_b: String,
    pub modality: Modality,
}

pub struct SessionManager {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
    metrics: Arc<dyn MetricsSink>,
    history: Arc<dyn SessionHistory>,
    /// This instance's view of active sessions, for the gauge only.
    active: [AtomicI64; 3],
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        config: CoreConfig,
        metrics: Arc<dyn MetricsSink>,
        history: Arc<dyn SessionHistory>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            metrics,
            history,
            active: [AtomicI64::new(0), AtomicI64::new(0), AtomicI64::new(0)],
        }
    }

    fn session_key(session_id: &str) -> String {
        format!("session:{session_id}")
    }

    fn pointer_key(user_id: &str) -> String {
        format!("session:user:{user_id}")
    }

    fn modality_slot(modality: Modality) -> usize {
        match modality {
            Modality::Video => 0,
            Modality::Audio => 1,
            Modality::Text => 2,
        }
    }

    fn bump_active(&self, modality: Modality, delta: i64) {
        let slot = &self.active[Self::modality_slot(modality)];
        let value = slot.fetch_add(delta, Ordering::SeqCst) + delta;
        self.metrics.gauge(
            names::SESSIONS_ACTIVE,
            &[("modality", modality.as_str())],
            value.max(0) as f64,
        );
    }

    async fn load_session(&self, session_id: &str) -> StoreResult<Option<Session>> {
        let key = Self::session_key(session_id);
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

    /// Create an active session for two distinct, currently unpaired users.
    pub async fn create(
        &self,
        modality: Modality,
        user_a: &str,
        user_b: &str,
    ) -> Result<Session, CoreError> {
        if user_a == user_b {
            return Err(CoreError::Validation(
                "cannot create a session with yourself".to_owned(),
            ));
        }
        let Some(token) = self
            .store
            .try_acquire(SESSION_CREATE_LOCK, self.config.session_lock_ttl)
            .await?
        else {
            return Err(CoreError::StoreUnavailable(StoreError::Unavailable(
                "session-create lock busy".to_owned(),
            )));
        };

        let outcome = self.create_locked(modality, user_a, user_b).await;

        if let Err(e) = self.store.release(SESSION_CREATE_LOCK, &token).await {
            warn!(error = %e, "session-create lock release failed");
        }
        outcome
    }

    async fn create_locked(
        &self,
        modality: Modality,
        user_a: &str,
        user_b: &str,
    ) -> Result<Session, CoreError> {
        // Two-side probe; the self-healing walk clears dangling pointers.
        if self.session_of(user_a).await?.is_some() || self.session_of(user_b).await?.is_some() {
            return Err(CoreError::AlreadyInSession);
        }

        let session = Session {
            id: Uuid::new_v4().to_string(),
            modality,
            user_a: user_a.to_owned(),
            user_b: user_b.to_owned(),
            started_at: self.clock.now_millis(),
            status: SessionStatus::Active,
        };
        let json = serde_json::to_string(&session).map_err(|e| {
            CoreError::Internal(format!("session serialization failed: {e}"))
        })?;
        let ttl = Some(self.config.session_ttl);
        self.store
            .set(&Self::session_key(&session.id), &json, ttl)
            .await?;
        self.store
            .set(&Self::pointer_key(user_a), &session.id, ttl)
            .await?;
        self.store
            .set(&Self::pointer_key(user_b), &session.id, ttl)
            .await?;

        let announcement = serde_json::to_string(&MatchAnnouncement {
            session_id: session.id.clone(),
            user_a: user_a.to_owned(),
            user_b: user_b.to_owned(),
            modality,
        })
        .unwrap_or_default();
        self.store.publish(MATCH_CHANNEL, &announcement).await?;

        self.metrics.counter(
            names::MATCHES_TOTAL,
            &[("modality", modality.as_str())],
            1,
        );
        self.bump_active(modality, 1);
        info!(
            session_id = %session.id,
            user_a = %user_a,
            user_b = %user_b,
            modality = %modality,
            "session created"
        );
        Ok(session)
    }

    /// The active session containing the user, walked through the reverse
    /// pointer. A pointer whose session is gone gets deleted on the way.
    pub async fn session_of(&self, user_id: &str) -> StoreResult<Option<Session>> {
        let pointer_key = Self::pointer_key(user_id);
        let Some(session_id) = self.store.get(&pointer_key).await? else {
            return Ok(None);
        };
        match self.load_session(&session_id).await? {
            Some(session) => Ok(Some(session)),
            None => {
                // Dangling pointer; self-heal.
                self.store.delete(&pointer_key).await?;
                debug!(user_id = %user_id, session_id = %session_id, "healed dangling session pointer");
                Ok(None)
            }
        }
    }

    /// The partner in the user's active session.
    pub async fn partner_of(&self, user_id: &str) -> StoreResult<Option<String>> {
        Ok(self
            .session_of(user_id)
            .await?
            .and_then(|s| s.partner_of(user_id).map(str::to_owned)))
    }

    /// Tear a session down. Idempotent: only the call that actually deletes
    /// the record reports true and emits the teardown side effects.
    pub async fn end(&self, session_id: &str, reason: EndReason) -> StoreResult<bool> {
        let Some(session) = self.load_session(session_id).await? else {
            return Ok(false);
        };
        if !self.store.delete(&Self::session_key(session_id)).await? {
            // Raced with another teardown; that one owns the side effects.
            return Ok(false);
        }
        for user_id in [&session.user_a, &session.user_b] {
            let pointer_key = Self::pointer_key(user_id);
            // Only clear a pointer that still references this session; the
            // user may already be in a newer one.
            if self.store.get(&pointer_key).await?.as_deref() == Some(session_id) {
                self.store.delete(&pointer_key).await?;
            }
        }

        let ended_at = self.clock.now_millis();
        let duration_secs = (ended_at - session.started_at).max(0) as f64 / 1000.0;
        self.metrics.histogram(
            names::SESSION_DURATION_SECONDS,
            &[
                ("modality", session.modality.as_str()),
                ("reason", reason.as_str()),
            ],
            duration_secs,
        );
        self.bump_active(session.modality, -1);
        if let (Some(started), Some(ended)) = (
            DateTime::from_timestamp_millis(session.started_at),
            DateTime::from_timestamp_millis(ended_at),
        ) {
            self.history
                .record_session_ended(session_id, started, ended, reason)
                .await;
        }
        info!(
            session_id = %session_id,
            reason = reason.as_str(),
            duration_secs,
            "session ended"
        );
        Ok(true)
    }

    /// Partner lookup then teardown. Returns the session and the partner so
    /// callers can notify the surviving side.
    pub async fn end_for_user(
        &self,
        user_id: &str,
        reason: EndReason,
    ) -> StoreResult<Option<(Session, String)>> {
        let Some(session) = self.session_of(user_id).await? else {
            return Ok(None);
        };
        let Some(partner) = session.partner_of(user_id).map(str::to_owned) else {
            return Ok(None);
        };
        if self.end(&session.id, reason).await? {
            Ok(Some((session, partner)))
        } else {
            Ok(None)
        }
    }

    /// Refresh the session TTL on observed activity.
    pub async fn extend(&self, session_id: &str) -> StoreResult<bool> {
        let Some(session) = self.load_session(session_id).await? else {
            return Ok(false);
        };
        let ttl = self.config.session_ttl;
        let mut refreshed = self
            .store
            .expire(&Self::session_key(session_id), ttl)
            .await?;
        refreshed &= self
            .store
            .expire(&Self::pointer_key(&session.user_a), ttl)
            .await?;
        refreshed &= self
            .store
            .expire(&Self::pointer_key(&session.user_b), ttl)
            .await?;
        Ok(refreshed)
    }

    /// Reconciliation sweep: close over-age sessions, delete orphans whose
    /// pointers are gone.
    pub async fn cleanup_once(&self) -> StoreResult<usize> {
        let now = self.clock.now_millis();
        let max_age = self.config.max_session_duration.as_millis() as i64;
        let mut reconciled = 0;

        for key in self.store.scan("session:").await? {
            if key.starts_with("session:user:") {
                continue;
            }
            let Some(session_id) = key.strip_prefix("session:") else {
                continue;
            };
            let session = match self.load_session(session_id).await {
                Ok(Some(session)) => session,
                Ok(None) => continue,
                Err(StoreError::Corrupt { .. }) => {
                    // Unreadable record: nothing can use it, remove it.
                    self.store.delete(&key).await?;
                    reconciled += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if now - session.started_at > max_age {
                if self.end(session_id, EndReason::Abandoned).await? {
                    info!(session_id = %session_id, "abandoned over-age session");
                    reconciled += 1;
                }
                continue;
            }

            // Both reverse pointers must still reference this session.
            let mut orphaned = false;
            for user_id in [&session.user_a, &session.user_b] {
                if self.store.get(&Self::pointer_key(user_id)).await?.as_deref()
                    != Some(session_id)
                {
                    orphaned = true;
                }
            }
            if orphaned {
                if self.end(session_id, EndReason::Abandoned).await? {
                    info!(session_id = %session_id, "reconciled orphaned session");
                    reconciled += 1;
                }
            }
        }
        Ok(reconciled)
    }

    /// Reconciliation loop; runs until shutdown flips.
    pub async fn run_cleanup(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.session_cleanup_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.cleanup_once().await {
                        Ok(0) => {}
                        Ok(n) => info!(count = n, "session cleanup reconciled records"),
                        Err(e) => {
                            warn!(error = %e, "session cleanup failed");
                            self.metrics.counter(names::ERRORS_TOTAL, &[("subsystem", "session")], 1);
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::collab::NoopHistory;
    use crate::metrics::NoopMetrics;
    use crate::store::MemoryStore;

    fn manager() -> (SessionManager, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        (
            SessionManager::new(
                store.clone(),
                clock.clone(),
                CoreConfig::default(),
                Arc::new(NoopMetrics),
                Arc::new(NoopHistory),
            ),
            store,
            clock,
        )
    }

    #[tokio::test]
    async fn create_rejects_self_and_double_sessions() {
        let (sm, _, _) = manager();
        assert!(matches!(
            sm.create(Modality::Video, "a", "a").await,
            Err(CoreError::Validation(_))
        ));

        sm.create(Modality::Video, "a", "b").await.unwrap();
        assert!(matches!(
            sm.create(Modality::Text, "a", "c").await,
            Err(CoreError::AlreadyInSession)
        ));
        assert!(matches!(
            sm.create(Modality::Text, "c", "b").await,
            Err(CoreError::AlreadyInSession)
        ));
    }

    #[tokio::test]
    async fn partner_lookup_walks_the_reverse_pointer() {
        let (sm, _, _) = manager();
        let session = sm.create(Modality::Audio, "a", "b").await.unwrap();
        assert_eq!(sm.partner_of("a").await.unwrap().as_deref(), Some("b"));
        assert_eq!(sm.partner_of("b").await.unwrap().as_deref(), Some("a"));
        assert_eq!(sm.partner_of("c").await.unwrap(), None);
        assert_eq!(sm.session_of("a").await.unwrap().unwrap().id, session.id);
    }

    #[tokio::test]
    async fn end_is_idempotent_and_clears_both_pointers() {
        let (sm, store, _) = manager();
        let session = sm.create(Modality::Video, "a", "b").await.unwrap();

        assert!(sm.end(&session.id, EndReason::Normal).await.unwrap());
        assert!(
            !sm.end(&session.id, EndReason::Normal).await.unwrap(),
            "second end reports false"
        );

        use crate::store::SharedStore;
        assert!(store.get("session:user:a").await.unwrap().is_none());
        assert!(store.get("session:user:b").await.unwrap().is_none());
        assert_eq!(sm.partner_of("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn end_leaves_newer_pointers_alone() {
        let (sm, store, _) = manager();
        let first = sm.create(Modality::Video, "a", "b").await.unwrap();
        sm.end(&first.id, EndReason::Skip).await.unwrap();
        let second = sm.create(Modality::Video, "a", "c").await.unwrap();

        // A late duplicate teardown of the first session must not clear a's
        // pointer into the second.
        assert!(!sm.end(&first.id, EndReason::Skip).await.unwrap());
        use crate::store::SharedStore;
        assert_eq!(
            store.get("session:user:a").await.unwrap().as_deref(),
            Some(second.id.as_str())
        );
    }

    #[tokio::test]
    async fn dangling_pointer_self_heals() {
        let (sm, store, _) = manager();
        let session = sm.create(Modality::Text, "a", "b").await.unwrap();

        use crate::store::SharedStore;
        store
            .delete(&format!("session:{}", session.id))
            .await
            .unwrap();

        assert_eq!(sm.partner_of("a").await.unwrap(), None);
        assert!(
            store.get("session:user:a").await.unwrap().is_none(),
            "dangling pointer deleted during the walk"
        );
        // After healing, the user can be paired again.
        sm.create(Modality::Text, "a", "c").await.unwrap();
    }

    #[tokio::test]
    async fn end_for_user_returns_the_surviving_partner() {
        let (sm, _, _) = manager();
        sm.create(Modality::Video, "a", "b").await.unwrap();
        let (session, partner) = sm
            .end_for_user("a", EndReason::Disconnect)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(partner, "b");
        assert_eq!(session.user_a, "a");
        assert!(sm.end_for_user("a", EndReason::Disconnect).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn session_ttl_expiry_acts_like_abandonment() {
        let (sm, _, clock) = manager();
        sm.create(Modality::Video, "a", "b").await.unwrap();
        clock.advance_secs(2 * 60 * 60 + 1);
        // Record expired in the store; the pointer walk heals and the users
        // are free again.
        assert_eq!(sm.partner_of("a").await.unwrap(), None);
        sm.create(Modality::Video, "a", "c").await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_abandons_over_age_sessions() {
        let (sm, _, clock) = manager();
        let session = sm.create(Modality::Video, "a", "b").await.unwrap();
        clock.advance_secs(60 * 60 + 5);
        let reconciled = sm.cleanup_once().await.unwrap();
        assert_eq!(reconciled, 1);
        assert!(sm.session_of("a").await.unwrap().is_none());
        assert!(!sm.end(&session.id, EndReason::Normal).await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_reconciles_orphaned_records() {
        let (sm, store, _) = manager();
        let session = sm.create(Modality::Audio, "a", "b").await.unwrap();

        use crate::store::SharedStore;
        store.delete("session:user:b").await.unwrap();

        assert_eq!(sm.cleanup_once().await.unwrap(), 1);
        assert!(store
            .get(&format!("session:{}", session.id))
            .await
            .unwrap()
            .is_none());
        assert!(store.get("session:user:a").await.unwrap().is_none());
    }
}
