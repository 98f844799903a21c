//! Signaling and chat relay.
//!
//! Stateless pass-through between the two endpoints of a session: the
//! server holds no WebRTC state beyond knowing who the partner is. Chat
//! bodies are validated for size only and never persisted.

use crate::clock::Clock;
use crate::collab::{Report, Reports};
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::metrics::{MetricsSink, names};
use crate::registry::SocketRegistry;
use crate::session::{EndReason, SessionManager};
use mp_protocol::{ChatDeliver, ServerMessage};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct SignalingRelay {
    sessions: Arc<SessionManager>,
    registry: Arc<SocketRegistry>,
    reports: Arc<dyn Reports>,
    metrics: Arc<dyn MetricsSink>,
    config: CoreConfig,
    clock: Arc<dyn Clock>,
}

impl SignalingRelay {
    pub fn new(
        sessions: Arc<SessionManager>,
        registry: Arc<SocketRegistry>,
        reports: Arc<dyn Reports>,
        metrics: Arc<dyn MetricsSink>,
        config: CoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sessions,
            registry,
            reports,
            metrics,
            config,
            clock,
        }
    }

    /// Validate and deliver an in-session chat message; activity refreshes
    /// the session TTL.
    pub async fn chat_message(&self, user_id: &str, text: &str) -> Result<(), CoreError> {
        if text.is_empty() {
            return Err(CoreError::Validation("message is empty".to_owned()));
        }
        if text.chars().count() > self.config.max_chat_len {
            return Err(CoreError::Validation(format!(
                "message exceeds {} characters",
                self.config.max_chat_len
            )));
        }
        let Some(session) = self.sessions.session_of(user_id).await? else {
            return Err(CoreError::NotInSession);
        };
        let Some(partner) = session.partner_of(user_id).map(str::to_owned) else {
            return Err(CoreError::NotInSession);
        };
        self.registry
            .emit_to_user(
                &partner,
                ServerMessage::ChatMessage(ChatDeliver {
                    sender_id: user_id.to_owned(),
                    text: text.to_owned(),
                    timestamp: self.clock.now_millis(),
                }),
            )
            .await?;
        self.sessions.extend(&session.id).await?;
        Ok(())
    }

    /// Typing indicators: session-checked, otherwise dropped on the floor.
    pub async fn typing(&self, user_id: &str, active: bool) -> Result<(), CoreError> {
        let Some(partner) = self.sessions.partner_of(user_id).await? else {
            return Ok(());
        };
        let msg = if active {
            ServerMessage::ChatTyping
        } else {
            ServerMessage::ChatStopTyping
        };
        self.registry.emit_to_user(&partner, msg).await?;
        Ok(())
    }

    /// Relay an opaque signaling payload to the partner. Silence when there
    /// is no partner; the common race at call teardown.
    pub async fn signal(&self, user_id: &str, msg: ServerMessage) -> Result<(), CoreError> {
        let Some(partner) = self.sessions.partner_of(user_id).await? else {
            debug!(user_id = %user_id, "signaling with no partner dropped");
            return Ok(());
        };
        self.registry.emit_to_user(&partner, msg).await?;
        Ok(())
    }

    /// Hang up: the partner hears `call:end`, then the session is torn down.
    pub async fn call_end(&self, user_id: &str) -> Result<(), CoreError> {
        let Some((_, partner)) = self
            .sessions
            .end_for_user(user_id, EndReason::Normal)
            .await?
        else {
            return Ok(());
        };
        if let Err(e) = self.registry.emit_to_user(&partner, ServerMessage::CallEnd).await {
            warn!(user_id = %partner, error = %e, "call-end notification failed");
        }
        Ok(())
    }

    /// Record a report against another user.
    pub async fn report(
        &self,
        reporter_id: &str,
        reported_id: &str,
        reason: &str,
        description: Option<String>,
        session_id: Option<String>,
    ) -> Result<String, CoreError> {
        if reported_id.is_empty() || reporter_id == reported_id {
            return Err(CoreError::Validation("invalid report target".to_owned()));
        }
        if reason.trim().is_empty() {
            return Err(CoreError::Validation("report reason is required".to_owned()));
        }
        let report = Report {
            report_id: Uuid::new_v4().to_string(),
            reporter_id: reporter_id.to_owned(),
            reported_id: reported_id.to_owned(),
            session_id,
            reason: reason.to_owned(),
            description,
            created_at: self.clock.now(),
            status: "open".to_owned(),
        };
        let report_id = report.report_id.clone();
        self.reports.record_report(report).await.map_err(|e| {
            self.metrics
                .counter(names::ERRORS_TOTAL, &[("subsystem", "reports")], 1);
            CoreError::Internal(format!("report sink failed: {e}"))
        })?;
        Ok(report_id)
    }
}
