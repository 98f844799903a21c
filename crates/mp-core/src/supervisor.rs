//! Connection supervision and dispatch.
//!
//! `Core` is the composition root: it owns every subsystem as an explicit
//! value and is handed to the transport layer. Per connection, the
//! supervisor authenticates, registers, rate-limits, routes inbound
//! messages through one dispatch table, and runs the disconnect cascade.

use crate::clock::Clock;
use crate::collab::{AuthClaims, AuthProvider, Directory, Reports, SessionHistory};
use crate::config::CoreConfig;
use crate::engine::{MatchOutcome, PairingEngine};
use crate::error::CoreError;
use crate::fleet::{FleetCoordinator, LoadSampler};
use crate::metrics::{MetricsSink, names};
use crate::queue::QueueManager;
use crate::rate_limit::{KeyedLimiter, TokenBucket};
use crate::registry::{OutboundFrame, SocketRegistry};
use crate::relay::SignalingRelay;
use crate::session::{EndReason, SessionManager};
use crate::store::SharedStore;
use mp_protocol::{
    ClientMessage, ErrorMessage, MatchDisconnected, QueuePosition, ReportReceived, ScopedError,
    ServerMessage, disconnect_reasons,
};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Everything the core needs injected; the service's `main` builds one of
/// these, tests build theirs with mocks.
pub struct CoreDeps {
    pub store: Arc<dyn SharedStore>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<dyn MetricsSink>,
    pub auth: Arc<dyn AuthProvider>,
    pub directory: Arc<dyn Directory>,
    pub reports: Arc<dyn Reports>,
    pub history: Arc<dyn SessionHistory>,
    pub sampler: Arc<dyn LoadSampler>,
    pub config: CoreConfig,
    pub host: String,
    pub port: u16,
}

/// An authenticated socket, with its per-socket rate budgets.
pub struct ConnectedUser {
    pub user_id: String,
    pub username: String,
    pub socket_id: String,
    msg_bucket: Mutex<TokenBucket>,
    join_bucket: Mutex<TokenBucket>,
}

impl ConnectedUser {
    fn allow_message(&self, now_ms: i64) -> bool {
        self.msg_bucket.lock().unwrap().try_take(now_ms)
    }

    fn allow_queue_join(&self, now_ms: i64) -> bool {
        self.join_bucket.lock().unwrap().try_take(now_ms)
    }
}

/// Which scoped error event carries a failure back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorScope {
    Queue,
    Match,
    Call,
    General,
}

fn error_scope(msg: &ClientMessage) -> ErrorScope {
    match msg {
        ClientMessage::QueueJoin(_) | ClientMessage::QueueLeave(_) => ErrorScope::Queue,
        ClientMessage::MatchNext | ClientMessage::FriendCall(_) => ErrorScope::Match,
        ClientMessage::CallOffer(_)
        | ClientMessage::CallAnswer(_)
        | ClientMessage::CallIce(_)
        | ClientMessage::CallEnd => ErrorScope::Call,
        _ => ErrorScope::General,
    }
}

fn scope_subsystem(scope: ErrorScope) -> &'static str {
    match scope {
        ErrorScope::Queue => "queue",
        ErrorScope::Match => "engine",
        ErrorScope::Call => "relay",
        ErrorScope::General => "supervisor",
    }
}

pub struct Core {
    pub config: CoreConfig,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<dyn MetricsSink>,
    pub fleet: Arc<FleetCoordinator>,
    pub registry: Arc<SocketRegistry>,
    pub queues: Arc<QueueManager>,
    pub sessions: Arc<SessionManager>,
    pub engine: Arc<PairingEngine>,
    pub relay: Arc<SignalingRelay>,
    auth: Arc<dyn AuthProvider>,
    directory: Arc<dyn Directory>,
    connect_limiter: KeyedLimiter<IpAddr>,
}

impl Core {
    pub fn new(deps: CoreDeps) -> Arc<Self> {
        let CoreDeps {
            store,
            clock,
            metrics,
            auth,
            directory,
            reports,
            history,
            sampler,
            config,
            host,
            port,
        } = deps;

        let connections = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fleet = Arc::new(FleetCoordinator::new(
            store.clone(),
            clock.clone(),
            config.clone(),
            metrics.clone(),
            sampler,
            host,
            port,
            connections.clone(),
        ));
        let registry = Arc::new(SocketRegistry::new(
            fleet.instance_id().to_owned(),
            store.clone(),
            clock.clone(),
            config.clone(),
            metrics.clone(),
            connections,
        ));
        let queues = Arc::new(QueueManager::new(
            store.clone(),
            clock.clone(),
            config.clone(),
            metrics.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            store,
            clock.clone(),
            config.clone(),
            metrics.clone(),
            history,
        ));
        let engine = Arc::new(PairingEngine::new(
            queues.clone(),
            sessions.clone(),
            registry.clone(),
            directory.clone(),
            metrics.clone(),
            config.clone(),
        ));
        let relay = Arc::new(SignalingRelay::new(
            sessions.clone(),
            registry.clone(),
            reports,
            metrics.clone(),
            config.clone(),
            clock.clone(),
        ));
        let connect_limiter = KeyedLimiter::new(
            clock.clone(),
            config.rate_connect_per_min,
            Duration::from_secs(60),
        );
        Arc::new(Self {
            config,
            clock,
            metrics,
            fleet,
            registry,
            queues,
            sessions,
            engine,
            relay,
            auth,
            directory,
            connect_limiter,
        })
    }

    /// Per-IP connect budget, checked before the upgrade.
    pub fn allow_connect(&self, ip: IpAddr) -> bool {
        self.connect_limiter.allow(&ip)
    }

    /// Load-aware admission, checked before the upgrade.
    pub fn should_accept(&self) -> bool {
        self.fleet.should_accept()
    }

    /// Token verification plus the ban check.
    pub async fn authenticate(&self, token: &str) -> Result<AuthClaims, CoreError> {
        let Some(claims) = self.auth.verify_access_token(token).await else {
            return Err(CoreError::AuthInvalid);
        };
        if self.directory.is_banned(&claims.user_id).await {
            return Err(CoreError::Banned);
        }
        Ok(claims)
    }

    /// Register an authenticated socket and hand back its connection state.
    pub async fn attach(
        &self,
        claims: &AuthClaims,
        sender: mpsc::Sender<OutboundFrame>,
    ) -> Result<ConnectedUser, CoreError> {
        let socket_id = Uuid::new_v4().to_string();
        self.registry
            .register(&claims.user_id, &socket_id, sender)
            .await?;
        let now = self.clock.now_millis();
        Ok(ConnectedUser {
            user_id: claims.user_id.clone(),
            username: claims.username.clone(),
            socket_id,
            msg_bucket: Mutex::new(TokenBucket::new(
                self.config.rate_ws_msg_per_sec,
                Duration::from_secs(1),
                now,
            )),
            join_bucket: Mutex::new(TokenBucket::new(
                self.config.rate_queue_join_max,
                self.config.rate_queue_join_window,
                now,
            )),
        })
    }

    /// Route one inbound message. Failures become typed events on the
    /// offending socket; the socket stays open.
    pub async fn handle(&self, user: &ConnectedUser, msg: ClientMessage) {
        let scope = error_scope(&msg);
        if !user.allow_message(self.clock.now_millis()) {
            self.emit_error(user, scope, &CoreError::RateLimited).await;
            return;
        }
        if let Err(e) = self.dispatch(user, msg).await {
            self.metrics.counter(
                names::ERRORS_TOTAL,
                &[("subsystem", scope_subsystem(scope))],
                1,
            );
            if matches!(e, CoreError::StoreUnavailable(_) | CoreError::Internal(_)) {
                warn!(user_id = %user.user_id, error = %e, "message handling failed");
            }
            self.emit_error(user, scope, &e).await;
        }
    }

    async fn dispatch(&self, user: &ConnectedUser, msg: ClientMessage) -> Result<(), CoreError> {
        match msg {
            ClientMessage::Auth(_) => {
                Err(CoreError::Validation("already authenticated".to_owned()))
            }
            ClientMessage::QueueJoin(join) => {
                if !user.allow_queue_join(self.clock.now_millis()) {
                    return Err(CoreError::RateLimited);
                }
                let outcome = self
                    .engine
                    .quick_match(&user.user_id, &user.socket_id, join.session_type)
                    .await?;
                self.report_outcome(user, outcome).await;
                Ok(())
            }
            ClientMessage::QueueLeave(leave) => {
                self.engine.cancel(&user.user_id, leave.session_type).await
            }
            ClientMessage::MatchNext => {
                let Some(session) = self.sessions.session_of(&user.user_id).await? else {
                    return Err(CoreError::NotInSession);
                };
                let outcome = self
                    .engine
                    .rematch(&user.user_id, &user.socket_id, session.modality)
                    .await?;
                self.report_outcome(user, outcome).await;
                Ok(())
            }
            ClientMessage::FriendCall(call) => {
                self.engine
                    .with_friend(&user.user_id, &call.friend_id, call.session_type)
                    .await?;
                Ok(())
            }
            ClientMessage::CallOffer(offer) => {
                self.relay
                    .signal(&user.user_id, ServerMessage::CallOffer(offer))
                    .await
            }
            ClientMessage::CallAnswer(answer) => {
                self.relay
                    .signal(&user.user_id, ServerMessage::CallAnswer(answer))
                    .await
            }
            ClientMessage::CallIce(ice) => {
                self.relay
                    .signal(&user.user_id, ServerMessage::CallIce(ice))
                    .await
            }
            ClientMessage::CallEnd => self.relay.call_end(&user.user_id).await,
            ClientMessage::ChatMessage(chat) => {
                self.relay.chat_message(&user.user_id, &chat.text).await
            }
            ClientMessage::ChatTyping => self.relay.typing(&user.user_id, true).await,
            ClientMessage::ChatStopTyping => self.relay.typing(&user.user_id, false).await,
            ClientMessage::ReportUser(report) => {
                let report_id = self
                    .relay
                    .report(
                        &user.user_id,
                        &report.reported_user_id,
                        &report.reason,
                        report.description,
                        report.session_id,
                    )
                    .await?;
                self.registry
                    .emit_to_socket(
                        &user.user_id,
                        &user.socket_id,
                        ServerMessage::ReportReceived(ReportReceived { report_id }),
                    )
                    .await;
                Ok(())
            }
        }
    }

    async fn report_outcome(&self, user: &ConnectedUser, outcome: MatchOutcome) {
        // A match already notified both sides through the registry; a queued
        // outcome reports the position to the joining socket only.
        if let MatchOutcome::Queued { position } = outcome {
            self.registry
                .emit_to_socket(
                    &user.user_id,
                    &user.socket_id,
                    ServerMessage::QueuePosition(QueuePosition { position }),
                )
                .await;
        }
    }

    async fn emit_error(&self, user: &ConnectedUser, scope: ErrorScope, err: &CoreError) {
        let message = err.public_message();
        let event = match scope {
            ErrorScope::Queue => ServerMessage::QueueError(ScopedError { message }),
            ErrorScope::Match => ServerMessage::MatchError(ScopedError { message }),
            ErrorScope::Call => ServerMessage::CallError(ScopedError { message }),
            ErrorScope::General => ServerMessage::Error(ErrorMessage {
                code: err.code().to_owned(),
                message,
                retryable: err.retryable(),
            }),
        };
        self.registry
            .emit_to_socket(&user.user_id, &user.socket_id, event)
            .await;
    }

    /// Disconnect cascade. Errors are logged and swallowed; the pass runs
    /// to completion under the grace deadline even when the rest of the
    /// connection's work is cancelled.
    pub async fn detach(&self, user: &ConnectedUser) {
        let cleanup = async {
            if let Err(e) = self.queues.remove_from_all(&user.user_id).await {
                warn!(user_id = %user.user_id, error = %e, "queue cleanup on disconnect failed");
            }
            match self
                .sessions
                .end_for_user(&user.user_id, EndReason::Disconnect)
                .await
            {
                Ok(Some((_, partner))) => {
                    let notice = ServerMessage::MatchDisconnected(MatchDisconnected {
                        reason: disconnect_reasons::DISCONNECT.to_owned(),
                    });
                    if let Err(e) = self.registry.emit_to_user(&partner, notice).await {
                        warn!(user_id = %partner, error = %e, "partner disconnect notice failed");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(user_id = %user.user_id, error = %e, "session cleanup on disconnect failed");
                }
            }
            if let Err(e) = self
                .registry
                .unregister(&user.user_id, &user.socket_id)
                .await
            {
                warn!(user_id = %user.user_id, error = %e, "socket unregister failed");
            }
        };
        if tokio::time::timeout(self.config.shutdown_grace, cleanup)
            .await
            .is_err()
        {
            warn!(user_id = %user.user_id, "disconnect cleanup hit the grace deadline");
        }
    }

    /// Register with the fleet and start every background task. The tasks
    /// stop when the shutdown signal flips.
    pub async fn start_background(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        if let Err(e) = self.fleet.heartbeat_once().await {
            warn!(error = %e, "initial fleet registration failed");
        }
        let mut handles = Vec::new();
        {
            let core = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                core.fleet.run(shutdown).await;
            }));
        }
        {
            let core = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                core.registry.run_subscriber(shutdown).await;
            }));
        }
        {
            let core = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                core.queues.run_sweeper(shutdown).await;
            }));
        }
        {
            let core = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                core.sessions.run_cleanup(shutdown).await;
            }));
        }
        {
            let core = self.clone();
            handles.push(tokio::spawn(async move {
                core.engine.run_matcher(shutdown).await;
            }));
        }
        info!(instance_id = %self.fleet.instance_id(), "core background tasks running");
        handles
    }

    /// Graceful shutdown: local clients hear it, the fleet forgets us.
    pub async fn shutdown(&self) {
        self.registry
            .broadcast_local(&ServerMessage::MatchDisconnected(MatchDisconnected {
                reason: disconnect_reasons::SHUTDOWN.to_owned(),
            }));
        if let Err(e) = self.fleet.deregister().await {
            warn!(error = %e, "fleet deregistration failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::collab::{NoopHistory, UserProfile};
    use crate::fleet::FixedSampler;
    use crate::metrics::NoopMetrics;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use mp_protocol::{ChatSend, Modality, QueueJoin};
    use std::collections::{HashMap, HashSet};

    struct StaticAuth {
        tokens: HashMap<String, AuthClaims>,
    }

    #[async_trait]
    impl AuthProvider for StaticAuth {
        async fn verify_access_token(&self, token: &str) -> Option<AuthClaims> {
            self.tokens.get(token).cloned()
        }
    }

    struct StaticDirectory {
        banned: HashSet<String>,
    }

    #[async_trait]
    impl Directory for StaticDirectory {
        async fn find_user(&self, user_id: &str) -> Option<UserProfile> {
            Some(UserProfile {
                user_id: user_id.to_owned(),
                username: format!("name-{user_id}"),
            })
        }

        async fn is_banned(&self, user_id: &str) -> bool {
            self.banned.contains(user_id)
        }

        async fn are_friends(&self, _a: &str, _b: &str) -> bool {
            false
        }
    }

    struct SilentReports;

    #[async_trait]
    impl crate::collab::Reports for SilentReports {
        async fn record_report(&self, _report: crate::collab::Report) -> Result<(), String> {
            Ok(())
        }
    }

    fn test_core(clock: Arc<ManualClock>) -> Arc<Core> {
        let mut tokens = HashMap::new();
        tokens.insert(
            "tok-a".to_owned(),
            AuthClaims {
                user_id: "a".to_owned(),
                username: "alice".to_owned(),
                is_guest: false,
            },
        );
        tokens.insert(
            "tok-banned".to_owned(),
            AuthClaims {
                user_id: "banned-user".to_owned(),
                username: "creep".to_owned(),
                is_guest: false,
            },
        );
        let mut banned = HashSet::new();
        banned.insert("banned-user".to_owned());

        Core::new(CoreDeps {
            store: Arc::new(MemoryStore::new(clock.clone())),
            clock: clock.clone(),
            metrics: Arc::new(NoopMetrics),
            auth: Arc::new(StaticAuth { tokens }),
            directory: Arc::new(StaticDirectory { banned }),
            reports: Arc::new(SilentReports),
            history: Arc::new(NoopHistory),
            sampler: Arc::new(FixedSampler::new(5.0, 5.0)),
            config: CoreConfig::default(),
            host: "test-host".to_owned(),
            port: 0,
        })
    }

    async fn attached(
        core: &Arc<Core>,
        token: &str,
    ) -> (ConnectedUser, mpsc::Receiver<OutboundFrame>) {
        let claims = core.authenticate(token).await.unwrap();
        let (tx, rx) = mpsc::channel(32);
        let user = core.attach(&claims, tx).await.unwrap();
        (user, rx)
    }

    #[tokio::test]
    async fn authenticate_rejects_unknown_and_banned_tokens() {
        let core = test_core(Arc::new(ManualClock::new()));
        assert!(matches!(
            core.authenticate("nope").await,
            Err(CoreError::AuthInvalid)
        ));
        assert!(matches!(
            core.authenticate("tok-banned").await,
            Err(CoreError::Banned)
        ));
        let claims = core.authenticate("tok-a").await.unwrap();
        assert_eq!(claims.username, "alice");
    }

    #[tokio::test]
    async fn queue_join_reports_position_on_the_joining_socket() {
        let clock = Arc::new(ManualClock::new());
        let core = test_core(clock);
        let (user, mut rx) = attached(&core, "tok-a").await;

        core.handle(
            &user,
            ClientMessage::QueueJoin(QueueJoin {
                session_type: Modality::Video,
            }),
        )
        .await;

        match rx.recv().await.unwrap().msg {
            ServerMessage::QueuePosition(p) => assert_eq!(p.position, 1),
            other => panic!("expected queue:position, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn queue_errors_arrive_scoped() {
        let clock = Arc::new(ManualClock::new());
        let core = test_core(clock);
        let (user, mut rx) = attached(&core, "tok-a").await;

        let join = ClientMessage::QueueJoin(QueueJoin {
            session_type: Modality::Video,
        });
        core.handle(&user, join.clone()).await;
        let _ = rx.recv().await.unwrap(); // position

        core.handle(&user, join).await;
        match rx.recv().await.unwrap().msg {
            ServerMessage::QueueError(e) => {
                assert!(e.message.contains("already waiting"), "got {}", e.message);
            }
            other => panic!("expected queue:error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chat_without_session_is_a_general_typed_error() {
        let clock = Arc::new(ManualClock::new());
        let core = test_core(clock);
        let (user, mut rx) = attached(&core, "tok-a").await;

        core.handle(
            &user,
            ClientMessage::ChatMessage(ChatSend {
                text: "hello".to_owned(),
            }),
        )
        .await;

        match rx.recv().await.unwrap().msg {
            ServerMessage::Error(e) => {
                assert_eq!(e.code, "NOT_IN_SESSION");
                assert!(!e.retryable);
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn match_next_without_session_is_a_match_error() {
        let clock = Arc::new(ManualClock::new());
        let core = test_core(clock);
        let (user, mut rx) = attached(&core, "tok-a").await;

        core.handle(&user, ClientMessage::MatchNext).await;
        assert!(matches!(
            rx.recv().await.unwrap().msg,
            ServerMessage::MatchError(_)
        ));
    }

    #[tokio::test]
    async fn queue_join_rate_limit_kicks_in() {
        let clock = Arc::new(ManualClock::new());
        let core = test_core(clock.clone());
        let (user, mut rx) = attached(&core, "tok-a").await;

        // Three joins per five seconds; cancel in between so state errors
        // do not mask the limiter.
        for _ in 0..3 {
            core.handle(
                &user,
                ClientMessage::QueueJoin(QueueJoin {
                    session_type: Modality::Video,
                }),
            )
            .await;
            let _ = rx.recv().await.unwrap();
            core.handle(
                &user,
                ClientMessage::QueueLeave(mp_protocol::QueueLeave {
                    session_type: Modality::Video,
                }),
            )
            .await;
            clock.advance_millis(100);
        }
        core.handle(
            &user,
            ClientMessage::QueueJoin(QueueJoin {
                session_type: Modality::Video,
            }),
        )
        .await;
        match rx.recv().await.unwrap().msg {
            ServerMessage::QueueError(e) => {
                assert!(e.message.contains("rate limit"), "got {}", e.message);
            }
            other => panic!("expected queue:error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn message_rate_limit_answers_with_rate_limited() {
        let clock = Arc::new(ManualClock::new());
        let core = test_core(clock.clone());
        let (user, mut rx) = attached(&core, "tok-a").await;

        // Burn the 20-message budget without advancing the clock.
        for _ in 0..20 {
            core.handle(&user, ClientMessage::ChatTyping).await;
        }
        core.handle(&user, ClientMessage::ChatTyping).await;
        match rx.recv().await.unwrap().msg {
            ServerMessage::Error(e) => assert_eq!(e.code, "RATE_LIMITED"),
            other => panic!("expected rate-limit error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_cascade_clears_queue_session_and_registry() {
        let clock = Arc::new(ManualClock::new());
        let core = test_core(clock.clone());
        let (user_a, _rx_a) = attached(&core, "tok-a").await;

        // Seed a second participant directly.
        let (tx_b, mut rx_b) = mpsc::channel(32);
        core.registry.register("b", "s-b", tx_b).await.unwrap();
        core.sessions
            .create(Modality::Video, "a", "b")
            .await
            .unwrap();

        core.detach(&user_a).await;

        assert!(core.sessions.session_of("a").await.unwrap().is_none());
        assert!(core.sessions.session_of("b").await.unwrap().is_none());
        assert!(!core.registry.has_local_sockets("a"));
        match rx_b.recv().await.unwrap().msg {
            ServerMessage::MatchDisconnected(m) => assert_eq!(m.reason, "disconnect"),
            other => panic!("expected match:disconnected, got {other:?}"),
        }

        // Running the cascade again is harmless.
        core.detach(&user_a).await;
    }

    #[tokio::test]
    async fn disconnect_removes_waiting_entries_immediately() {
        let clock = Arc::new(ManualClock::new());
        let core = test_core(clock);
        let (user, _rx) = attached(&core, "tok-a").await;

        core.engine
            .quick_match("a", &user.socket_id, Modality::Video)
            .await
            .unwrap();
        assert_eq!(core.queues.position("a", Modality::Video).await.unwrap(), 1);

        core.detach(&user).await;
        assert_eq!(core.queues.position("a", Modality::Video).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn admission_follows_the_sampler() {
        let clock = Arc::new(ManualClock::new());
        let core = test_core(clock);
        // Before any heartbeat the cached sample is zero: accepting.
        assert!(core.should_accept());
        core.fleet.heartbeat_once().await.unwrap();
        assert!(core.should_accept());
    }

    #[tokio::test]
    async fn connect_limiter_is_per_ip() {
        let clock = Arc::new(ManualClock::new());
        let core = test_core(clock);
        let ip1: IpAddr = "10.0.0.1".parse().unwrap();
        let ip2: IpAddr = "10.0.0.2".parse().unwrap();
        for _ in 0..10 {
            assert!(core.allow_connect(ip1));
        }
        assert!(!core.allow_connect(ip1));
        assert!(core.allow_connect(ip2));
    }
}
