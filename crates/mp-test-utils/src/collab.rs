//! In-memory collaborator mocks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mp_core::collab::{AuthClaims, AuthProvider, Report, Reports, SessionHistory};
use mp_core::session::EndReason;
use std::collections::HashMap;
use std::sync::Mutex;

/// Token map auth: whatever the test registers, verifies.
#[derive(Default)]
pub struct MockAuth {
    tokens: Mutex<HashMap<String, AuthClaims>>,
}

impl MockAuth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `token` as `user_id` with a derived username.
    pub fn grant(&self, token: &str, user_id: &str) {
        self.tokens.lock().unwrap().insert(
            token.to_owned(),
            AuthClaims {
                user_id: user_id.to_owned(),
                username: format!("name-{user_id}"),
                is_guest: false,
            },
        );
    }
}

#[async_trait]
impl AuthProvider for MockAuth {
    async fn verify_access_token(&self, token: &str) -> Option<AuthClaims> {
        self.tokens.lock().unwrap().get(token).cloned()
    }
}

/// Captures every recorded report.
#[derive(Default)]
pub struct RecordingReports {
    reports: Mutex<Vec<Report>>,
}

impl RecordingReports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Report> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl Reports for RecordingReports {
    async fn record_report(&self, report: Report) -> Result<(), String> {
        self.reports.lock().unwrap().push(report);
        Ok(())
    }
}

/// One ended-session record as the history collaborator saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndedSession {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub reason: EndReason,
}

/// Captures every session teardown.
#[derive(Default)]
pub struct RecordingHistory {
    ended: Mutex<Vec<EndedSession>>,
}

impl RecordingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<EndedSession> {
        self.ended.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionHistory for RecordingHistory {
    async fn record_session_ended(
        &self,
        session_id: &str,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        reason: EndReason,
    ) {
        self.ended.lock().unwrap().push(EndedSession {
            session_id: session_id.to_owned(),
            started_at,
            ended_at,
            reason,
        });
    }
}
