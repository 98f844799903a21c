//! Fleet coordinator.
//!
//! Each process instance registers itself in the shared store, heartbeats
//! liveness and load, and exposes the cluster view. External routing uses
//! the view to steer traffic away from loaded instances; the connection
//! supervisor uses `should_accept` to refuse upgrades locally.

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::metrics::MetricsSink;
use crate::store::{SharedStore, StoreResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

const CPU_ACCEPT_MAX_PCT: f64 = 90.0;
const MEM_ACCEPT_MAX_PCT: f64 = 85.0;
/// A record this stale is dead no matter what its TTL says.
const DEAD_AFTER: Duration = Duration::from_secs(30);
const REAP_AFTER: Duration = Duration::from_secs(60);
const LOAD_SERIES_CAP: usize = 100;
const LOAD_SERIES_RETAIN: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub active_connections: usize,
    /// Epoch milliseconds of the last heartbeat write.
    pub last_heartbeat: i64,
    pub healthy: bool,
}

impl InstanceRecord {
    /// Routing weight; lower is better.
    pub fn load_score(&self) -> f64 {
        0.4 * self.cpu_pct + 0.3 * self.mem_pct + 0.3 * (self.active_connections as f64 / 100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadSample {
    pub cpu_pct: f64,
    pub mem_pct: f64,
}

#[async_trait]
pub trait LoadSampler: Send + Sync + 'static {
    async fn sample(&self) -> LoadSample;
}

/// Production sampler: CPU% over a 1-second window across all cores, plus
/// memory in use.
pub struct SysinfoSampler {
    sys: tokio::sync::Mutex<sysinfo::System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            sys: tokio::sync::Mutex::new(sysinfo::System::new()),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadSampler for SysinfoSampler {
    async fn sample(&self) -> LoadSample {
        let mut sys = self.sys.lock().await;
        sys.refresh_cpu_usage();
        tokio::time::sleep(Duration::from_secs(1)).await;
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        let cpu_pct = f64::from(sys.global_cpu_usage());
        let mem_pct = if sys.total_memory() == 0 {
            0.0
        } else {
            sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0
        };
        LoadSample { cpu_pct, mem_pct }
    }
}

/// Sampler returning a fixed reading; admission tests set the reading.
pub struct FixedSampler {
    sample: Mutex<LoadSample>,
}

impl FixedSampler {
    pub fn new(cpu_pct: f64, mem_pct: f64) -> Self {
        Self {
            sample: Mutex::new(LoadSample { cpu_pct, mem_pct }),
        }
    }

    pub fn set(&self, cpu_pct: f64, mem_pct: f64) {
        *self.sample.lock().unwrap() = LoadSample { cpu_pct, mem_pct };
    }
}

#[async_trait]
impl LoadSampler for FixedSampler {
    async fn sample(&self) -> LoadSample {
        *self.sample.lock().unwrap()
    }
}

pub struct FleetCoordinator {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
    metrics: Arc<dyn MetricsSink>,
    sampler: Arc<dyn LoadSampler>,
    instance_id: String,
    host: String,
    port: u16,
    connections: Arc<AtomicUsize>,
    latest: Mutex<LoadSample>,
}

impl FleetCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        config: CoreConfig,
        metrics: Arc<dyn MetricsSink>,
        sampler: Arc<dyn LoadSampler>,
        host: String,
        port: u16,
        connections: Arc<AtomicUsize>,
    ) -> Self {
        let boot_nanos = clock.now().timestamp_nanos_opt().unwrap_or_default();
        let instance_id = format!("{host}-{}-{boot_nanos}", std::process::id());
        Self {
            store,
            clock,
            config,
            metrics,
            sampler,
            instance_id,
            host,
            port,
            connections,
            latest: Mutex::new(LoadSample {
                cpu_pct: 0.0,
                mem_pct: 0.0,
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn record_key(&self, instance_id: &str) -> String {
        format!("instance:{instance_id}")
    }

    fn load_key(&self, instance_id: &str) -> String {
        format!("instance:load:{instance_id}")
    }

    /// Write the instance record; called once at boot and then from every
    /// heartbeat tick.
    pub async fn heartbeat_once(&self) -> StoreResult<()> {
        let sample = self.sampler.sample().await;
        *self.latest.lock().unwrap() = sample;

        let now = self.clock.now_millis();
        let record = InstanceRecord {
            instance_id: self.instance_id.clone(),
            host: self.host.clone(),
            port: self.port,
            cpu_pct: sample.cpu_pct,
            mem_pct: sample.mem_pct,
            active_connections: self.connections.load(Ordering::SeqCst),
            last_heartbeat: now,
            healthy: true,
        };
        let json = serde_json::to_string(&record)
            .map_err(|e| crate::store::StoreError::Corrupt {
                key: self.record_key(&self.instance_id),
                reason: e.to_string(),
            })?;
        self.store
            .set(
                &self.record_key(&self.instance_id),
                &json,
                Some(self.config.instance_ttl),
            )
            .await?;

        // Per-instance load timeseries: capped at the last 100 samples,
        // nothing older than an hour.
        let load_key = self.load_key(&self.instance_id);
        let sample_json = serde_json::to_string(&serde_json::json!({
            "ts": now,
            "cpu_pct": sample.cpu_pct,
            "mem_pct": sample.mem_pct,
            "active_connections": record.active_connections,
        }))
        .unwrap_or_default();
        self.store.zadd(&load_key, &sample_json, now as f64).await?;
        self.store
            .zremrangebyscore(
                &load_key,
                f64::MIN,
                (now - LOAD_SERIES_RETAIN.as_millis() as i64) as f64,
            )
            .await?;
        let count = self.store.zcard(&load_key).await?;
        if count > LOAD_SERIES_CAP {
            let excess = self
                .store
                .zrange(&load_key, 0, (count - LOAD_SERIES_CAP) as i64 - 1)
                .await?;
            let members: Vec<&str> = excess.iter().map(|m| m.member.as_str()).collect();
            self.store.zrem(&load_key, &members).await?;
        }

        self.metrics.gauge(
            crate::metrics::names::WS_CONNECTIONS,
            &[],
            record.active_connections as f64,
        );
        Ok(())
    }

    /// Admission check against the latest sample. Cheap and lock-only, so
    /// the upgrade path can call it per connection.
    pub fn should_accept(&self) -> bool {
        let sample = *self.latest.lock().unwrap();
        sample.cpu_pct <= CPU_ACCEPT_MAX_PCT && sample.mem_pct <= MEM_ACCEPT_MAX_PCT
    }

    async fn all_records(&self) -> StoreResult<Vec<InstanceRecord>> {
        let mut records = Vec::new();
        for key in self.store.scan("instance:").await? {
            // Load-series keys are ordered sets, not strings, so the scan
            // only yields record keys; the guard is for foreign writers.
            if key.starts_with("instance:load:") {
                continue;
            }
            let Some(json) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<InstanceRecord>(&json) {
                Ok(record) => records.push(record),
                Err(e) => warn!(key = %key, error = %e, "discarding unparseable instance record"),
            }
        }
        Ok(records)
    }

    /// Instances heartbeating within the last 30 s and flagged healthy.
    pub async fn healthy_instances(&self) -> StoreResult<Vec<InstanceRecord>> {
        let now = self.clock.now_millis();
        Ok(self
            .all_records()
            .await?
            .into_iter()
            .filter(|r| r.healthy && now - r.last_heartbeat <= DEAD_AFTER.as_millis() as i64)
            .collect())
    }

    /// Delete records (and their load series) not heartbeated for 60 s.
    pub async fn reap_dead(&self) -> StoreResult<usize> {
        let now = self.clock.now_millis();
        let mut reaped = 0;
        for record in self.all_records().await? {
            if now - record.last_heartbeat > REAP_AFTER.as_millis() as i64 {
                self.store.delete(&self.record_key(&record.instance_id)).await?;
                self.store
                    .zremrangebyscore(&self.load_key(&record.instance_id), f64::MIN, f64::MAX)
                    .await?;
                info!(instance_id = %record.instance_id, "reaped dead instance");
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    /// Healthy instance with the lowest routing weight; heartbeat age breaks
    /// ties (older wins, it has been stable longer).
    pub async fn least_loaded(&self) -> StoreResult<Option<InstanceRecord>> {
        let mut healthy = self.healthy_instances().await?;
        healthy.sort_by(|a, b| {
            a.load_score()
                .partial_cmp(&b.load_score())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.last_heartbeat.cmp(&b.last_heartbeat))
        });
        Ok(healthy.into_iter().next())
    }

    pub async fn deregister(&self) -> StoreResult<()> {
        self.store.delete(&self.record_key(&self.instance_id)).await?;
        self.store
            .zremrangebyscore(&self.load_key(&self.instance_id), f64::MIN, f64::MAX)
            .await?;
        info!(instance_id = %self.instance_id, "instance deregistered");
        Ok(())
    }

    /// Heartbeat + reap loop; runs until shutdown flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.heartbeat_once().await {
                        warn!(error = %e, "fleet heartbeat failed");
                        self.metrics.counter(
                            crate::metrics::names::ERRORS_TOTAL,
                            &[("subsystem", "fleet")],
                            1,
                        );
                    }
                    if let Err(e) = self.reap_dead().await {
                        warn!(error = %e, "dead-instance reap failed");
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
    use crate::metrics::NoopMetrics;
    use crate::store::MemoryStore;

    fn fleet_with(
        cpu: f64,
        mem: f64,
    ) -> (Arc<FleetCoordinator>, Arc<MemoryStore>, Arc<ManualClock>, Arc<FixedSampler>) {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let sampler = Arc::new(FixedSampler::new(cpu, mem));
        let fleet = Arc::new(FleetCoordinator::new(
            store.clone(),
            clock.clone(),
            CoreConfig::default(),
            Arc::new(NoopMetrics),
            sampler.clone(),
            "host-a".to_owned(),
            8080,
            Arc::new(AtomicUsize::new(0)),
        ));
        (fleet, store, clock, sampler)
    }

    #[tokio::test]
    async fn heartbeat_writes_record_and_admission_follows_load() {
        let (fleet, _store, _clock, sampler) = fleet_with(10.0, 40.0);
        fleet.heartbeat_once().await.unwrap();
        assert!(fleet.should_accept());

        sampler.set(95.0, 40.0);
        fleet.heartbeat_once().await.unwrap();
        assert!(!fleet.should_accept(), "CPU over 90% refuses admission");

        sampler.set(50.0, 86.0);
        fleet.heartbeat_once().await.unwrap();
        assert!(!fleet.should_accept(), "memory over 85% refuses admission");
    }

    #[tokio::test]
    async fn record_ttl_expiry_removes_a_silent_instance() {
        let (fleet, _store, clock, _sampler) = fleet_with(10.0, 10.0);
        fleet.heartbeat_once().await.unwrap();
        assert_eq!(fleet.healthy_instances().await.unwrap().len(), 1);

        // No heartbeat for longer than INSTANCE_TTL: the record is gone.
        clock.advance_secs(31);
        assert!(fleet.healthy_instances().await.unwrap().is_empty());
        assert!(fleet.all_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_records_leave_the_healthy_view_before_the_reaper_takes_them() {
        let clock = Arc::new(ManualClock::new());
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new(clock.clone()));
        let now = clock.now_millis();
        // Records persisted without TTL, as a misbehaving writer would
        // leave them; heartbeat age is what decides their fate.
        for (id, age_secs) in [("fresh", 0i64), ("silent", 31), ("corpse", 61)] {
            let record = InstanceRecord {
                instance_id: id.to_owned(),
                host: id.to_owned(),
                port: 8080,
                cpu_pct: 10.0,
                mem_pct: 10.0,
                active_connections: 0,
                last_heartbeat: now - age_secs * 1000,
                healthy: true,
            };
            store
                .set(
                    &format!("instance:{id}"),
                    &serde_json::to_string(&record).unwrap(),
                    None,
                )
                .await
                .unwrap();
        }
        let fleet = FleetCoordinator::new(
            store.clone(),
            clock,
            CoreConfig::default(),
            Arc::new(NoopMetrics),
            Arc::new(FixedSampler::new(0.0, 0.0)),
            "probe".to_owned(),
            0,
            Arc::new(AtomicUsize::new(0)),
        );

        let healthy = fleet.healthy_instances().await.unwrap();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].instance_id, "fresh");

        // Only the 61-second corpse is old enough to reap.
        assert_eq!(fleet.reap_dead().await.unwrap(), 1);
        assert_eq!(fleet.all_records().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn least_loaded_ranks_by_weighted_score() {
        let clock = Arc::new(ManualClock::new());
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new(clock.clone()));
        let now = clock.now_millis();
        for (id, cpu, conns) in [("a", 80.0, 10), ("b", 20.0, 10), ("c", 20.0, 200)] {
            let record = InstanceRecord {
                instance_id: id.to_owned(),
                host: id.to_owned(),
                port: 8080,
                cpu_pct: cpu,
                mem_pct: 30.0,
                active_connections: conns,
                last_heartbeat: now,
                healthy: true,
            };
            store
                .set(
                    &format!("instance:{id}"),
                    &serde_json::to_string(&record).unwrap(),
                    None,
                )
                .await
                .unwrap();
        }
        let fleet = FleetCoordinator::new(
            store,
            clock,
            CoreConfig::default(),
            Arc::new(NoopMetrics),
            Arc::new(FixedSampler::new(0.0, 0.0)),
            "probe".to_owned(),
            0,
            Arc::new(AtomicUsize::new(0)),
        );
        let best = fleet.least_loaded().await.unwrap().unwrap();
        assert_eq!(best.instance_id, "b");
    }

    #[tokio::test]
    async fn load_series_is_capped() {
        let (fleet, store, clock, _sampler) = fleet_with(5.0, 5.0);
        for _ in 0..110 {
            fleet.heartbeat_once().await.unwrap();
            clock.advance_millis(10);
        }
        let key = fleet.load_key(fleet.instance_id());
        assert!(store.zcard(&key).await.unwrap() <= 100);
    }
}
