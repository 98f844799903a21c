//! Pairing engine.
//!
//! Orchestrates the queues, the session manager, and the registry:
//! join -> match -> create -> notify. The engine is constructed over the
//! other subsystems; the session manager never calls back into it.

use crate::collab::Directory;
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::metrics::{MetricsSink, names};
use crate::queue::{ExtractedPair, LeaveReason, QueueManager, WaitingEntry};
use crate::registry::SocketRegistry;
use crate::session::{EndReason, Session, SessionManager};
use mp_protocol::{MatchDisconnected, MatchFound, Modality, ServerMessage, disconnect_reasons};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What a match attempt produced for the calling user.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched(Session),
    Queued { position: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueStatus {
    pub in_queue: bool,
    pub modality: Option<Modality>,
    pub position: usize,
    pub estimated_wait: Duration,
}

pub struct PairingEngine {
    queues: Arc<QueueManager>,
    sessions: Arc<SessionManager>,
    registry: Arc<SocketRegistry>,
    directory: Arc<dyn Directory>,
    metrics: Arc<dyn MetricsSink>,
    config: CoreConfig,
}

impl PairingEngine {
    pub fn new(
        queues: Arc<QueueManager>,
        sessions: Arc<SessionManager>,
        registry: Arc<SocketRegistry>,
        directory: Arc<dyn Directory>,
        metrics: Arc<dyn MetricsSink>,
        config: CoreConfig,
    ) -> Self {
        Self {
            queues,
            sessions,
            registry,
            directory,
            metrics,
            config,
        }
    }

    async fn username_of(&self, user_id: &str) -> String {
        self.directory
            .find_user(user_id)
            .await
            .map_or_else(|| "stranger".to_owned(), |profile| profile.username)
    }

    /// Tell both endpoints about their new session.
    async fn notify_match(&self, session: &Session) {
        for (member, partner) in [
            (&session.user_a, &session.user_b),
            (&session.user_b, &session.user_a),
        ] {
            let msg = ServerMessage::MatchFound(MatchFound {
                session_id: session.id.clone(),
                partner_id: partner.clone(),
                partner_username: self.username_of(partner).await,
                session_type: session.modality,
            });
            if let Err(e) = self.registry.emit_to_user(member, msg).await {
                warn!(user_id = %member, error = %e, "match notification failed");
            }
        }
    }

    /// Session creation for a freshly extracted pair. On failure both users
    /// go back at their original scores so fairness survives the race.
    async fn create_for_pair(
        &self,
        modality: Modality,
        pair: ExtractedPair,
    ) -> Result<Option<Session>, CoreError> {
        match self
            .sessions
            .create(modality, &pair.caller.user_id, &pair.partner.user_id)
            .await
        {
            Ok(session) => {
                self.notify_match(&session).await;
                Ok(Some(session))
            }
            Err(e) => {
                self.metrics
                    .counter(names::ERRORS_TOTAL, &[("subsystem", "engine")], 1);
                warn!(
                    caller = %pair.caller.user_id,
                    partner = %pair.partner.user_id,
                    error = %e,
                    "session creation failed after extraction; requeueing both"
                );
                self.requeue_quietly(modality, &pair.caller).await;
                self.requeue_quietly(modality, &pair.partner).await;
                match e {
                    // One side got a session elsewhere in the meantime; the
                    // requeue keeps everyone matchable, nothing is surfaced.
                    CoreError::AlreadyInSession => Ok(None),
                    other => Err(other),
                }
            }
        }
    }

    async fn requeue_quietly(&self, modality: Modality, entry: &WaitingEntry) {
        if let Err(e) = self.queues.requeue(modality, entry).await {
            warn!(user_id = %entry.user_id, error = %e, "requeue after failed create lost the entry");
        }
    }

    /// Instant-match fast path: enqueue, then immediately try extraction.
    pub async fn quick_match(
        &self,
        user_id: &str,
        socket_id: &str,
        modality: Modality,
    ) -> Result<MatchOutcome, CoreError> {
        if self.sessions.session_of(user_id).await?.is_some() {
            return Err(CoreError::AlreadyInSession);
        }
        if !self.queues.enqueue(user_id, socket_id, modality).await? {
            return Err(CoreError::AlreadyQueued);
        }
        if let Some(pair) = self.queues.pair(user_id, modality).await? {
            if let Some(session) = self.create_for_pair(modality, pair).await? {
                return Ok(MatchOutcome::Matched(session));
            }
        }
        let position = self.queues.position(user_id, modality).await?;
        Ok(MatchOutcome::Queued { position })
    }

    /// Leave the wait queue.
    pub async fn cancel(&self, user_id: &str, modality: Modality) -> Result<(), CoreError> {
        if self
            .queues
            .dequeue(user_id, modality, LeaveReason::Cancel)
            .await?
        {
            Ok(())
        } else {
            Err(CoreError::NotInQueue)
        }
    }

    /// Where the user stands across all queues.
    pub async fn status(&self, user_id: &str) -> Result<QueueStatus, CoreError> {
        for modality in Modality::ALL {
            let position = self.queues.position(user_id, modality).await?;
            if position > 0 {
                let ahead = position.saturating_sub(1) as u32;
                return Ok(QueueStatus {
                    in_queue: true,
                    modality: Some(modality),
                    position,
                    estimated_wait: self.config.estimated_wait_per_position * ahead,
                });
            }
        }
        Ok(QueueStatus {
            in_queue: false,
            modality: None,
            position: 0,
            estimated_wait: Duration::ZERO,
        })
    }

    /// Direct call between friends; no queue involved.
    pub async fn with_friend(
        &self,
        user_id: &str,
        friend_id: &str,
        modality: Modality,
    ) -> Result<Session, CoreError> {
        if user_id == friend_id {
            return Err(CoreError::Validation("cannot call yourself".to_owned()));
        }
        if !self.directory.are_friends(user_id, friend_id).await {
            return Err(CoreError::Validation("not friends".to_owned()));
        }
        if !self.registry.is_present(friend_id).await? {
            return Err(CoreError::PartnerUnavailable);
        }
        let session = self.sessions.create(modality, user_id, friend_id).await?;
        self.notify_match(&session).await;
        Ok(session)
    }

    /// Skip the current partner and go straight back into matching.
    pub async fn rematch(
        &self,
        user_id: &str,
        socket_id: &str,
        modality: Modality,
    ) -> Result<MatchOutcome, CoreError> {
        if let Some((_, partner)) = self.sessions.end_for_user(user_id, EndReason::Skip).await? {
            let notice = ServerMessage::MatchDisconnected(MatchDisconnected {
                reason: disconnect_reasons::SKIP.to_owned(),
            });
            if let Err(e) = self.registry.emit_to_user(&partner, notice).await {
                warn!(user_id = %partner, error = %e, "skip notification failed");
            }
        }
        self.queues.remove_from_all(user_id).await?;
        self.quick_match(user_id, socket_id, modality).await
    }

    /// One safety-tick pass over a modality: while at least two users wait,
    /// impersonate the oldest and attempt extraction on its behalf.
    pub async fn match_tick(&self, modality: Modality) -> Result<usize, CoreError> {
        let size = self.queues.queue_size(modality).await?;
        if size < 2 {
            return Ok(0);
        }
        let mut made = 0;
        for _ in 0..size / 2 {
            let Some(oldest) = self.queues.oldest_waiting(modality).await? else {
                break;
            };
            let Some(pair) = self.queues.pair(&oldest, modality).await? else {
                break;
            };
            debug!(
                caller = %pair.caller.user_id,
                partner = %pair.partner.user_id,
                modality = %modality,
                "safety tick extracted a pair"
            );
            if self.create_for_pair(modality, pair).await?.is_some() {
                made += 1;
            }
        }
        Ok(made)
    }

    /// Safety matcher: covers quick-match races so nobody waits on a lost
    /// extraction. Runs until shutdown flips.
    pub async fn run_matcher(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.match_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for modality in Modality::ALL {
                        match self.match_tick(modality).await {
                            Ok(0) => {}
                            Ok(n) => info!(modality = %modality, count = n, "safety tick paired waiting users"),
                            Err(e) => {
                                warn!(modality = %modality, error = %e, "safety tick failed");
                                self.metrics.counter(names::ERRORS_TOTAL, &[("subsystem", "engine")], 1);
                            }
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
    use crate::collab::{NoopHistory, UserProfile};
    use crate::metrics::NoopMetrics;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    struct TestDirectory {
        friends: HashSet<(String, String)>,
    }

    impl TestDirectory {
        fn new() -> Self {
            Self {
                friends: HashSet::new(),
            }
        }

        fn with_friends(a: &str, b: &str) -> Self {
            let mut dir = Self::new();
            let (x, y) = if a < b { (a, b) } else { (b, a) };
            dir.friends.insert((x.to_owned(), y.to_owned()));
            dir
        }
    }

    #[async_trait]
    impl Directory for TestDirectory {
        async fn find_user(&self, user_id: &str) -> Option<UserProfile> {
            Some(UserProfile {
                user_id: user_id.to_owned(),
                username: format!("name-{user_id}"),
            })
        }

        async fn is_banned(&self, _user_id: &str) -> bool {
            false
        }

        async fn are_friends(&self, a: &str, b: &str) -> bool {
            let (x, y) = if a < b { (a, b) } else { (b, a) };
            self.friends.contains(&(x.to_owned(), y.to_owned()))
        }
    }

    struct Rig {
        engine: PairingEngine,
        queues: Arc<QueueManager>,
        sessions: Arc<SessionManager>,
        registry: Arc<SocketRegistry>,
        clock: Arc<ManualClock>,
    }

    fn rig_with_directory(directory: TestDirectory) -> Rig {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let config = CoreConfig::default();
        let metrics = Arc::new(NoopMetrics);
        let queues = Arc::new(QueueManager::new(
            store.clone(),
            clock.clone(),
            config.clone(),
            metrics.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            clock.clone(),
            config.clone(),
            metrics.clone(),
            Arc::new(NoopHistory),
        ));
        let registry = Arc::new(SocketRegistry::new(
            "inst-test".to_owned(),
            store,
            clock.clone(),
            config.clone(),
            metrics.clone(),
            Arc::new(AtomicUsize::new(0)),
        ));
        let engine = PairingEngine::new(
            queues.clone(),
            sessions.clone(),
            registry.clone(),
            Arc::new(directory),
            metrics,
            config,
        );
        Rig {
            engine,
            queues,
            sessions,
            registry,
            clock,
        }
    }

    fn rig() -> Rig {
        rig_with_directory(TestDirectory::new())
    }

    async fn connect(rig: &Rig, user: &str, socket: &str) -> mpsc::Receiver<crate::registry::OutboundFrame> {
        let (tx, rx) = mpsc::channel(16);
        rig.registry.register(user, socket, tx).await.unwrap();
        rx
    }

    fn expect_match_found(frame: crate::registry::OutboundFrame) -> MatchFound {
        match frame.msg {
            ServerMessage::MatchFound(m) => m,
            other => panic!("expected match:found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn basic_fifo_pairing_scenario() {
        let rig = rig();
        let mut rx_a = connect(&rig, "alice", "s-a").await;
        let mut rx_b = connect(&rig, "bob", "s-b").await;
        let _rx_c = connect(&rig, "carol", "s-c").await;

        // alice at t=0, bob at t=1, carol at t=2.
        let out = rig
            .engine
            .quick_match("alice", "s-a", Modality::Video)
            .await
            .unwrap();
        assert_eq!(out, MatchOutcome::Queued { position: 1 });
        rig.clock.advance_secs(1);

        let out = rig
            .engine
            .quick_match("bob", "s-b", Modality::Video)
            .await
            .unwrap();
        let MatchOutcome::Matched(session) = out else {
            panic!("bob should match alice instantly, got {out:?}");
        };
        assert_eq!(session.partner_of("bob"), Some("alice"));

        rig.clock.advance_secs(1);
        let out = rig
            .engine
            .quick_match("carol", "s-c", Modality::Video)
            .await
            .unwrap();
        assert_eq!(out, MatchOutcome::Queued { position: 1 });

        let found_a = expect_match_found(rx_a.recv().await.unwrap());
        let found_b = expect_match_found(rx_b.recv().await.unwrap());
        assert_eq!(found_a.partner_id, "bob");
        assert_eq!(found_a.partner_username, "name-bob");
        assert_eq!(found_b.partner_id, "alice");
        assert_eq!(found_b.session_id, found_a.session_id);
    }

    #[tokio::test]
    async fn quick_match_rejects_active_session_members_and_double_joins() {
        let rig = rig();
        let _rx_a = connect(&rig, "a", "s-a").await;
        let _rx_b = connect(&rig, "b", "s-b").await;

        rig.engine.quick_match("a", "s-a", Modality::Video).await.unwrap();
        assert!(matches!(
            rig.engine.quick_match("a", "s-a", Modality::Audio).await,
            Err(CoreError::AlreadyQueued)
        ));

        rig.engine.quick_match("b", "s-b", Modality::Video).await.unwrap();
        // Both are paired now; joining again is a session-state error.
        assert!(matches!(
            rig.engine.quick_match("a", "s-a", Modality::Video).await,
            Err(CoreError::AlreadyInSession)
        ));
    }

    #[tokio::test]
    async fn cancel_only_works_while_queued() {
        let rig = rig();
        let _rx = connect(&rig, "a", "s-a").await;
        rig.engine.quick_match("a", "s-a", Modality::Text).await.unwrap();
        rig.engine.cancel("a", Modality::Text).await.unwrap();
        assert!(matches!(
            rig.engine.cancel("a", Modality::Text).await,
            Err(CoreError::NotInQueue)
        ));
    }

    #[tokio::test]
    async fn status_reports_position_and_estimate() {
        let rig = rig();
        let _rx_a = connect(&rig, "a", "s-a").await;
        let _rx_b = connect(&rig, "b", "s-b").await;
        let _rx_c = connect(&rig, "c", "s-c").await;

        rig.engine.quick_match("a", "s-a", Modality::Audio).await.unwrap();
        rig.clock.advance_secs(1);
        // b and c cannot pair with a through quick_match when they are not
        // head-adjacent; seed three distinct join times.
        rig.queues.enqueue("b", "s-b", Modality::Audio).await.unwrap();
        rig.clock.advance_secs(1);
        rig.queues.enqueue("c", "s-c", Modality::Audio).await.unwrap();

        let status = rig.engine.status("c").await.unwrap();
        assert!(status.in_queue);
        assert_eq!(status.modality, Some(Modality::Audio));
        assert_eq!(status.position, 3);
        assert_eq!(status.estimated_wait, Duration::from_secs(10));

        let status = rig.engine.status("nobody").await.unwrap();
        assert!(!status.in_queue);
        assert_eq!(status.estimated_wait, Duration::ZERO);
    }

    #[tokio::test]
    async fn skip_and_rematch_scenario() {
        let rig = rig();
        let _rx_a = connect(&rig, "a", "s-a").await;
        let mut rx_b = connect(&rig, "b", "s-b").await;
        let _rx_d = connect(&rig, "d", "s-d").await;

        rig.engine.quick_match("a", "s-a", Modality::Video).await.unwrap();
        rig.clock.advance_secs(1);
        let MatchOutcome::Matched(first) = rig
            .engine
            .quick_match("b", "s-b", Modality::Video)
            .await
            .unwrap()
        else {
            panic!("expected instant match");
        };
        // Drain b's match:found.
        let _ = rx_b.recv().await.unwrap();

        // d waits alone.
        rig.clock.advance_secs(1);
        rig.engine.quick_match("d", "s-d", Modality::Video).await.unwrap();

        // a skips: b gets the notice, the session ends, a pairs with d.
        rig.clock.advance_secs(1);
        let out = rig
            .engine
            .rematch("a", "s-a", Modality::Video)
            .await
            .unwrap();
        let MatchOutcome::Matched(second) = out else {
            panic!("a should re-pair with d, got {out:?}");
        };
        assert_ne!(first.id, second.id);
        assert_eq!(second.partner_of("a"), Some("d"));

        match rx_b.recv().await.unwrap().msg {
            ServerMessage::MatchDisconnected(m) => assert_eq!(m.reason, "skip"),
            other => panic!("expected match:disconnected, got {other:?}"),
        }
        assert!(rig.sessions.session_of("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn friend_call_bypasses_queue_but_checks_presence_and_sessions() {
        let rig = rig_with_directory(TestDirectory::with_friends("a", "b"));
        let _rx_a = connect(&rig, "a", "s-a").await;

        // b is offline.
        assert!(matches!(
            rig.engine.with_friend("a", "b", Modality::Video).await,
            Err(CoreError::PartnerUnavailable)
        ));

        let _rx_b = connect(&rig, "b", "s-b").await;
        let session = rig
            .engine
            .with_friend("a", "b", Modality::Video)
            .await
            .unwrap();
        assert_eq!(session.partner_of("a"), Some("b"));

        // Either side busy blocks a second call.
        assert!(matches!(
            rig.engine.with_friend("a", "b", Modality::Video).await,
            Err(CoreError::AlreadyInSession)
        ));

        // Strangers cannot friend-call.
        let _rx_c = connect(&rig, "c", "s-c").await;
        let rig2 = rig_with_directory(TestDirectory::new());
        let _rx = connect(&rig2, "x", "s-x").await;
        let _ry = connect(&rig2, "y", "s-y").await;
        assert!(matches!(
            rig2.engine.with_friend("x", "y", Modality::Video).await,
            Err(CoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn safety_tick_pairs_the_queue_head() {
        let rig = rig();
        let mut rx_a = connect(&rig, "a", "s-a").await;
        let _rx_b = connect(&rig, "b", "s-b").await;
        let _rx_c = connect(&rig, "c", "s-c").await;
        let _rx_d = connect(&rig, "d", "s-d").await;

        // Four users appear in the queue without a quick_match win (seeded
        // directly, as after lost extraction races).
        for (user, socket) in [("a", "s-a"), ("b", "s-b"), ("c", "s-c"), ("d", "s-d")] {
            rig.queues.enqueue(user, socket, Modality::Text).await.unwrap();
            rig.clock.advance_secs(1);
        }

        let made = rig.engine.match_tick(Modality::Text).await.unwrap();
        assert_eq!(made, 2, "four waiters become two sessions");
        assert_eq!(rig.queues.queue_size(Modality::Text).await.unwrap(), 0);

        let found = expect_match_found(rx_a.recv().await.unwrap());
        assert_eq!(found.partner_id, "b", "FIFO order preserved");
    }

    #[tokio::test]
    async fn concurrent_quick_matches_partition_the_callers() {
        let rig = Arc::new(rig());
        let users: Vec<String> = (0..8).map(|i| format!("user-{i}")).collect();
        for user in &users {
            let _ = connect(&rig, user, &format!("s-{user}")).await;
        }

        let mut tasks = Vec::new();
        for user in users.clone() {
            let rig = rig.clone();
            tasks.push(tokio::spawn(async move {
                rig.engine
                    .quick_match(&user, &format!("s-{user}"), Modality::Video)
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        // Mop up anyone left waiting after the concurrent storm.
        while rig.engine.match_tick(Modality::Video).await.unwrap() > 0 {}

        let mut seen = HashSet::new();
        for user in &users {
            let session = rig
                .sessions
                .session_of(user)
                .await
                .unwrap()
                .unwrap_or_else(|| panic!("{user} was silently dropped"));
            assert!(session.partner_of(user).is_some());
            seen.insert(session.id.clone());
        }
        assert_eq!(seen.len(), 4, "eight callers form exactly four sessions");
        assert_eq!(rig.queues.queue_size(Modality::Video).await.unwrap(), 0);
    }
}
