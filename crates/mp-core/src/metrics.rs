//! Metrics sink trait.
//!
//! The core emits counter/gauge/histogram updates; exposition is the
//! embedding service's problem.

pub trait MetricsSink: Send + Sync + 'static {
    fn counter(&self, name: &'static str, labels: &[(&'static str, &str)], delta: u64);
    fn gauge(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64);
    fn histogram(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn counter(&self, _name: &'static str, _labels: &[(&'static str, &str)], _delta: u64) {}
    fn gauge(&self, _name: &'static str, _labels: &[(&'static str, &str)], _value: f64) {}
    fn histogram(&self, _name: &'static str, _labels: &[(&'static str, &str)], _value: f64) {}
}

/// Metric families emitted by the core.
pub mod names {
    /// Gauge, labeled `modality`.
    pub const QUEUE_SIZE: &str = "queue_size";
    /// Histogram of seconds waited, labeled `modality`.
    pub const QUEUE_WAIT_SECONDS: &str = "queue_wait_seconds";
    /// Counter, labeled `modality` and `reason` (cancel, matched, timeout, disconnect).
    pub const QUEUE_LEAVE_TOTAL: &str = "queue_leave_total";
    /// Gauge, labeled `modality`; this instance's view.
    pub const SESSIONS_ACTIVE: &str = "sessions_active";
    /// Histogram of seconds, labeled `modality` and `reason`.
    pub const SESSION_DURATION_SECONDS: &str = "session_duration_seconds";
    /// Counter, labeled `modality`.
    pub const MATCHES_TOTAL: &str = "matches_total";
    /// Gauge; local socket count.
    pub const WS_CONNECTIONS: &str = "ws_connections";
    /// Counter, labeled `subsystem`.
    pub const ERRORS_TOTAL: &str = "errors_total";
    /// Counter; non-critical frames shed under backpressure.
    pub const FRAMES_DROPPED_TOTAL: &str = "frames_dropped_total";
    /// Counter; sockets closed because a critical frame could not be queued.
    pub const SOCKETS_FORCE_CLOSED_TOTAL: &str = "sockets_force_closed_total";
}
