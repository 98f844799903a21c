//! Core configuration.
//!
//! Environment variables are the sole config source; every knob has a
//! default matching the platform contract. Durations are given in seconds
//! (`SESSION_TTL=7200`), counts as plain integers.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Stale waiting-entry cutoff.
    pub queue_timeout: Duration,
    /// Safety matcher tick.
    pub match_interval: Duration,
    /// Stale-queue sweep interval.
    pub queue_cleanup_interval: Duration,
    /// Session record TTL in the shared store.
    pub session_ttl: Duration,
    /// Wall-clock bound after which a session is marked abandoned.
    pub max_session_duration: Duration,
    /// Session reconciliation sweep interval.
    pub session_cleanup_interval: Duration,
    /// Instance record TTL.
    pub instance_ttl: Duration,
    /// Fleet heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Max hold for the per-modality matching lock.
    pub pair_lock_ttl: Duration,
    /// Max hold for the session-create lock.
    pub session_lock_ttl: Duration,
    /// Presence record TTL.
    pub presence_ttl: Duration,
    /// Per-socket inbound message cap, per second.
    pub rate_ws_msg_per_sec: u32,
    /// Queue joins allowed per window.
    pub rate_queue_join_max: u32,
    pub rate_queue_join_window: Duration,
    /// New connections allowed per IP per minute.
    pub rate_connect_per_min: u32,
    /// Outbound frames buffered per socket before backpressure kicks in.
    pub socket_buffer: usize,
    /// Disconnect-cleanup and shutdown grace deadline.
    pub shutdown_grace: Duration,
    /// Longest accepted chat message, in characters.
    pub max_chat_len: usize,
    /// Advertised wait estimate per queue position ahead.
    pub estimated_wait_per_position: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            queue_timeout: Duration::from_secs(60),
            match_interval: Duration::from_secs(2),
            queue_cleanup_interval: Duration::from_secs(10),
            session_ttl: Duration::from_secs(2 * 60 * 60),
            max_session_duration: Duration::from_secs(60 * 60),
            session_cleanup_interval: Duration::from_secs(5 * 60),
            instance_ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            pair_lock_ttl: Duration::from_secs(5),
            session_lock_ttl: Duration::from_secs(3),
            presence_ttl: Duration::from_secs(60),
            rate_ws_msg_per_sec: 20,
            rate_queue_join_max: 3,
            rate_queue_join_window: Duration::from_secs(5),
            rate_connect_per_min: 10,
            socket_buffer: 64,
            shutdown_grace: Duration::from_secs(5),
            max_chat_len: 1000,
            estimated_wait_per_position: Duration::from_secs(5),
        }
    }
}

impl CoreConfig {
    /// Defaults overridden by environment variables of the same name.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            queue_timeout: env_secs("QUEUE_TIMEOUT", d.queue_timeout),
            match_interval: env_secs("MATCH_INTERVAL", d.match_interval),
            queue_cleanup_interval: env_secs("QUEUE_CLEANUP_INTERVAL", d.queue_cleanup_interval),
            session_ttl: env_secs("SESSION_TTL", d.session_ttl),
            max_session_duration: env_secs("MAX_SESSION_DURATION", d.max_session_duration),
            session_cleanup_interval: env_secs(
                "SESSION_CLEANUP_INTERVAL",
                d.session_cleanup_interval,
            ),
            instance_ttl: env_secs("INSTANCE_TTL", d.instance_ttl),
            heartbeat_interval: env_secs("HEARTBEAT_INTERVAL", d.heartbeat_interval),
            pair_lock_ttl: env_secs("PAIR_LOCK_TTL", d.pair_lock_ttl),
            session_lock_ttl: env_secs("SESSION_LOCK_TTL", d.session_lock_ttl),
            presence_ttl: env_secs("PRESENCE_TTL", d.presence_ttl),
            rate_ws_msg_per_sec: env_u32("RATE_WS_MSG", d.rate_ws_msg_per_sec),
            rate_queue_join_max: env_u32("RATE_QUEUE_JOIN", d.rate_queue_join_max),
            rate_queue_join_window: env_secs("RATE_QUEUE_JOIN_WINDOW", d.rate_queue_join_window),
            rate_connect_per_min: env_u32("RATE_CONNECT", d.rate_connect_per_min),
            socket_buffer: env_u32("SOCKET_BUFFER", d.socket_buffer as u32) as usize,
            shutdown_grace: env_secs("SHUTDOWN_GRACE", d.shutdown_grace),
            max_chat_len: env_u32("MAX_CHAT_LEN", d.max_chat_len as u32) as usize,
            estimated_wait_per_position: d.estimated_wait_per_position,
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_platform_contract() {
        let c = CoreConfig::default();
        assert_eq!(c.queue_timeout, Duration::from_secs(60));
        assert_eq!(c.match_interval, Duration::from_secs(2));
        assert_eq!(c.session_ttl, Duration::from_secs(7200));
        assert_eq!(c.max_session_duration, Duration::from_secs(3600));
        assert_eq!(c.instance_ttl, Duration::from_secs(30));
        assert_eq!(c.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(c.pair_lock_ttl, Duration::from_secs(5));
        assert_eq!(c.rate_ws_msg_per_sec, 20);
        assert_eq!(c.rate_queue_join_max, 3);
    }
}
