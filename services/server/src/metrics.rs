//! In-memory metrics recorder.
//!
//! Implements the core's sink and keeps everything queryable for the
//! `/api/v1/metrics` snapshot (and for integration tests).

use mp_core::metrics::MetricsSink;
use std::collections::HashMap;
use std::sync::Mutex;

fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
    let mut key = name.to_owned();
    let mut labels: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    labels.sort();
    for label in labels {
        key.push(',');
        key.push_str(&label);
    }
    key
}

#[derive(Default)]
pub struct SnapshotMetrics {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, f64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
}

impl SnapshotMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(&series_key(name, labels))
            .copied()
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.gauges
            .lock()
            .unwrap()
            .get(&series_key(name, labels))
            .copied()
    }

    pub fn histogram_samples(&self, name: &str, labels: &[(&str, &str)]) -> Vec<f64> {
        self.histograms
            .lock()
            .unwrap()
            .get(&series_key(name, labels))
            .cloned()
            .unwrap_or_default()
    }

    /// JSON view for the metrics endpoint.
    pub fn snapshot(&self) -> serde_json::Value {
        let counters = self.counters.lock().unwrap().clone();
        let gauges = self.gauges.lock().unwrap().clone();
        let histograms: HashMap<String, serde_json::Value> = self
            .histograms
            .lock()
            .unwrap()
            .iter()
            .map(|(key, samples)| {
                let count = samples.len();
                let sum: f64 = samples.iter().sum();
                (
                    key.clone(),
                    serde_json::json!({
                        "count": count,
                        "sum": sum,
                        "avg": if count == 0 { 0.0 } else { sum / count as f64 },
                    }),
                )
            })
            .collect();
        serde_json::json!({
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }
}

impl MetricsSink for SnapshotMetrics {
    fn counter(&self, name: &'static str, labels: &[(&'static str, &str)], delta: u64) {
        *self
            .counters
            .lock()
            .unwrap()
            .entry(series_key(name, labels))
            .or_insert(0) += delta;
    }

    fn gauge(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64) {
        self.gauges
            .lock()
            .unwrap()
            .insert(series_key(name, labels), value);
    }

    fn histogram(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64) {
        self.histograms
            .lock()
            .unwrap()
            .entry(series_key(name, labels))
            .or_default()
            .push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_are_keyed_by_name_and_sorted_labels() {
        let metrics = SnapshotMetrics::new();
        metrics.counter("queue_leave_total", &[("modality", "video"), ("reason", "cancel")], 1);
        metrics.counter("queue_leave_total", &[("reason", "cancel"), ("modality", "video")], 2);
        assert_eq!(
            metrics.counter_value(
                "queue_leave_total",
                &[("modality", "video"), ("reason", "cancel")]
            ),
            3,
            "label order must not split the series"
        );

        metrics.gauge("queue_size", &[("modality", "video")], 4.0);
        assert_eq!(
            metrics.gauge_value("queue_size", &[("modality", "video")]),
            Some(4.0)
        );

        metrics.histogram("session_duration_seconds", &[], 2.5);
        metrics.histogram("session_duration_seconds", &[], 3.5);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["histograms"]["session_duration_seconds"]["count"], 2);
        assert_eq!(snapshot["histograms"]["session_duration_seconds"]["avg"], 3.0);
    }
}
