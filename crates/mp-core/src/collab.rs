//! Collaborator traits.
//!
//! Auth, the user directory, report recording, and session history live
//! outside the core; the composition root injects implementations and tests
//! inject mocks.

use crate::session::EndReason;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthClaims {
    pub user_id: String,
    pub username: String,
    pub is_guest: bool,
}

#[async_trait]
pub trait AuthProvider: Send + Sync + 'static {
    /// None means the token is invalid or expired.
    async fn verify_access_token(&self, token: &str) -> Option<AuthClaims>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: String,
    pub username: String,
}

#[async_trait]
pub trait Directory: Send + Sync + 'static {
    async fn find_user(&self, user_id: &str) -> Option<UserProfile>;
    async fn is_banned(&self, user_id: &str) -> bool;
    async fn are_friends(&self, a: &str, b: &str) -> bool;
}

/// A user report. Created by the core, persisted by the collaborator,
/// otherwise opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub report_id: String,
    pub reporter_id: String,
    pub reported_id: String,
    pub session_id: Option<String>,
    pub reason: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: String,
}

#[async_trait]
pub trait Reports: Send + Sync + 'static {
    async fn record_report(&self, report: Report) -> Result<(), String>;
}

#[async_trait]
pub trait SessionHistory: Send + Sync + 'static {
    async fn record_session_ended(
        &self,
        session_id: &str,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        reason: EndReason,
    );
}

/// History sink that drops everything; used where no persistence is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHistory;

#[async_trait]
impl SessionHistory for NoopHistory {
    async fn record_session_ended(
        &self,
        _session_id: &str,
        _started_at: DateTime<Utc>,
        _ended_at: DateTime<Utc>,
        _reason: EndReason,
    ) {
    }
}
