//! Collaborator implementations for the standalone server.
//!
//! Production deployments wire the platform's user service here; this
//! binary ships self-contained stand-ins so it runs on its own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mp_core::collab::{Directory, Report, Reports, SessionHistory, UserProfile};
use mp_core::session::EndReason;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::info;

/// Directory backed by what this process has seen: profiles are cached at
/// auth time, bans and friendships are seeded by configuration (or by
/// tests).
#[derive(Default)]
pub struct OpenDirectory {
    profiles: Mutex<HashMap<String, String>>,
    banned: Mutex<HashSet<String>>,
    friends: Mutex<HashSet<(String, String)>>,
    /// When set, any two users count as friends; dev convenience for the
    /// friend-call flow.
    friends_open: bool,
}

impl OpenDirectory {
    pub fn new(friends_open: bool) -> Self {
        Self {
            friends_open,
            ..Self::default()
        }
    }

    /// Cache a profile observed during the auth handshake.
    pub fn observe(&self, user_id: &str, username: &str) {
        self.profiles
            .lock()
            .unwrap()
            .insert(user_id.to_owned(), username.to_owned());
    }

    pub fn ban(&self, user_id: &str) {
        self.banned.lock().unwrap().insert(user_id.to_owned());
    }

    pub fn befriend(&self, a: &str, b: &str) {
        let (x, y) = if a < b { (a, b) } else { (b, a) };
        self.friends
            .lock()
            .unwrap()
            .insert((x.to_owned(), y.to_owned()));
    }
}

#[async_trait]
impl Directory for OpenDirectory {
    async fn find_user(&self, user_id: &str) -> Option<UserProfile> {
        self.profiles
            .lock()
            .unwrap()
            .get(user_id)
            .map(|username| UserProfile {
                user_id: user_id.to_owned(),
                username: username.clone(),
            })
    }

    async fn is_banned(&self, user_id: &str) -> bool {
        self.banned.lock().unwrap().contains(user_id)
    }

    async fn are_friends(&self, a: &str, b: &str) -> bool {
        if self.friends_open {
            return true;
        }
        let (x, y) = if a < b { (a, b) } else { (b, a) };
        self.friends
            .lock()
            .unwrap()
            .contains(&(x.to_owned(), y.to_owned()))
    }
}

/// Report sink that writes to the log; a real deployment persists these.
pub struct LoggingReports;

#[async_trait]
impl Reports for LoggingReports {
    async fn record_report(&self, report: Report) -> Result<(), String> {
        info!(
            report_id = %report.report_id,
            reporter_id = %report.reporter_id,
            reported_id = %report.reported_id,
            reason = %report.reason,
            "user report recorded"
        );
        Ok(())
    }
}

/// Session history that writes to the log.
pub struct LoggingHistory;

#[async_trait]
impl SessionHistory for LoggingHistory {
    async fn record_session_ended(
        &self,
        session_id: &str,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        reason: EndReason,
    ) {
        info!(
            session_id = %session_id,
            started_at = %started_at,
            ended_at = %ended_at,
            reason = reason.as_str(),
            "session history recorded"
        );
    }
}
