//! Device health monitoring
//!
//! Periodic liveness probes (`/system/resource/print`) and diagnostics
//! sweeps feed a per-device record: availability and error-rate EWMAs, a
//! response time ring, and the device's own resource figures. A weighted
//! composite score classifies each device; classification changes and
//! threshold breaches go out on the event bus, alerts rate-limited by a
//! per-device cooldown. Response time samples are also checked against a
//! mean ± k·stddev baseline for anomaly detection.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HealthSettings;
use crate::error::Result;
use crate::events::{CoreEvent, EventBus};
use crate::metrics::{DeviceHealthStats, HealthStats};
use crate::pool::ConnectionPool;
use crate::protocol::{ReplyKind, Sentence};
use crate::types::{DeviceId, HealthStatus};

/// EWMA smoothing for availability and error rate
const RATE_ALPHA: f64 = 0.3;
/// Response sub-score reference: this latency scores zero
const RESPONSE_REF_MS: f64 = 1_000.0;
/// Minimum samples before the anomaly baseline is trusted
const ANOMALY_MIN_SAMPLES: usize = 10;

/// Everything the monitor knows about one device
#[derive(Debug)]
pub struct DeviceHealthRecord {
    pub status: HealthStatus,
    pub score: f64,
    pub consecutive_failures: u32,
    /// 1.0 = every recent liveness probe answered
    availability_ewma: f64,
    /// 1.0 = every recent command failed
    error_ewma: f64,
    response_times_ms: VecDeque<f64>,
    pub cpu_load: Option<f64>,
    pub free_memory_ratio: Option<f64>,
    pub free_disk_ratio: Option<f64>,
    pub diagnostics: HashMap<String, String>,
    last_alert_at: Option<Instant>,
    checked: bool,
}

impl DeviceHealthRecord {
    fn new() -> Self {
        Self {
            status: HealthStatus::Unknown,
            score: 0.0,
            consecutive_failures: 0,
            availability_ewma: 1.0,
            error_ewma: 0.0,
            response_times_ms: VecDeque::new(),
            cpu_load: None,
            free_memory_ratio: None,
            free_disk_ratio: None,
            diagnostics: HashMap::new(),
            last_alert_at: None,
            checked: false,
        }
    }

    pub fn avg_response_ms(&self) -> f64 {
        if self.response_times_ms.is_empty() {
            return 0.0;
        }
        self.response_times_ms.iter().sum::<f64>() / self.response_times_ms.len() as f64
    }
}

/// Push a response sample into the ring and test it against the existing
/// baseline. Returns `Some((value, mean))` when the sample deviates more
/// than `stddev_factor` standard deviations from the history.
fn observe_response(
    record: &mut DeviceHealthRecord,
    sample_ms: f64,
    window: usize,
    stddev_factor: f64,
) -> Option<(f64, f64)> {
    let anomaly = if record.response_times_ms.len() >= ANOMALY_MIN_SAMPLES {
        let n = record.response_times_ms.len() as f64;
        let mean = record.response_times_ms.iter().sum::<f64>() / n;
        let variance = record
            .response_times_ms
            .iter()
            .map(|s| (s - mean).powi(2))
            .sum::<f64>()
            / n;
        let stddev = variance.sqrt();
        // A flat history gets a small floor so one slow probe on an
        // otherwise perfectly steady device still registers
        let band = (stddev * stddev_factor).max(1.0);
        if (sample_ms - mean).abs() > band {
            Some((sample_ms, mean))
        } else {
            None
        }
    } else {
        None
    };

    record.response_times_ms.push_back(sample_ms);
    while record.response_times_ms.len() > window {
        record.response_times_ms.pop_front();
    }
    anomaly
}

/// Weighted composite of the four sub-scores
fn compute_score(record: &DeviceHealthRecord, settings: &HealthSettings) -> f64 {
    let availability = record.availability_ewma;

    // Average over whichever resource figures the device reported
    let mut parts = Vec::with_capacity(3);
    if let Some(cpu) = record.cpu_load {
        parts.push(((100.0 - cpu) / 100.0).clamp(0.0, 1.0));
    }
    if let Some(mem) = record.free_memory_ratio {
        parts.push(mem.clamp(0.0, 1.0));
    }
    if let Some(disk) = record.free_disk_ratio {
        parts.push(disk.clamp(0.0, 1.0));
    }
    let resource = if parts.is_empty() {
        1.0
    } else {
        parts.iter().sum::<f64>() / parts.len() as f64
    };

    let response_time = (1.0 - record.avg_response_ms() / RESPONSE_REF_MS).clamp(0.0, 1.0);
    let error_rate = 1.0 - record.error_ewma;

    let w = &settings.weights;
    w.availability * availability
        + w.resource * resource
        + w.response_time * response_time
        + w.error_rate * error_rate
}

fn classify(record: &DeviceHealthRecord, settings: &HealthSettings) -> HealthStatus {
    if !record.checked {
        return HealthStatus::Unknown;
    }
    if record.consecutive_failures >= settings.unhealthy_failures {
        return HealthStatus::Offline;
    }
    if record.score < settings.critical_threshold {
        return HealthStatus::Unhealthy;
    }
    if record.score < settings.warning_threshold
        || record.consecutive_failures >= settings.degraded_failures
    {
        return HealthStatus::Degraded;
    }
    HealthStatus::Healthy
}

/// Pull the interesting figures out of a `/system/resource/print` reply
fn parse_resource_reply(replies: &[Sentence]) -> (Option<f64>, Option<f64>, Option<f64>) {
    let Some(data) = replies
        .iter()
        .find(|s| s.reply_kind() == Some(ReplyKind::Data))
    else {
        return (None, None, None);
    };
    let ratio = |free_key: &str, total_key: &str| {
        let free: Option<f64> = data.attribute(free_key).and_then(|v| v.parse().ok());
        let total: Option<f64> = data.attribute(total_key).and_then(|v| v.parse().ok());
        match (free, total) {
            (Some(f), Some(t)) if t > 0.0 => Some(f / t),
            _ => None,
        }
    };
    let cpu = data.attribute("cpu-load").and_then(|v| v.parse().ok());
    (
        cpu,
        ratio("free-memory", "total-memory"),
        ratio("free-hdd-space", "total-hdd-space"),
    )
}

/// Fleet-wide health monitor
pub struct HealthMonitor {
    settings: HealthSettings,
    pool: Arc<ConnectionPool>,
    events: EventBus,
    records: RwLock<HashMap<DeviceId, DeviceHealthRecord>>,
    shutting_down: AtomicBool,
    loops: StdMutex<Vec<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(settings: HealthSettings, pool: Arc<ConnectionPool>, events: EventBus) -> Self {
        let records = pool
            .device_ids()
            .into_iter()
            .map(|id| (id, DeviceHealthRecord::new()))
            .collect();
        Self {
            settings,
            pool,
            events,
            records: RwLock::new(records),
            shutting_down: AtomicBool::new(false),
            loops: StdMutex::new(Vec::new()),
        }
    }

    /// One liveness probe against one device, folded into its record
    pub async fn check_device(&self, device_id: DeviceId) -> Result<()> {
        let outcome = self.pool.probe(device_id).await;
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&device_id) else {
            return Ok(());
        };
        record.checked = true;

        let mut anomaly = None;
        match &outcome {
            Ok((elapsed, replies)) => {
                record.consecutive_failures = 0;
                record.availability_ewma =
                    record.availability_ewma * (1.0 - RATE_ALPHA) + RATE_ALPHA;
                anomaly = observe_response(
                    record,
                    elapsed.as_secs_f64() * 1000.0,
                    self.settings.response_time_window,
                    self.settings.anomaly_stddev_factor,
                );
                let (cpu, mem, disk) = parse_resource_reply(replies);
                if cpu.is_some() {
                    record.cpu_load = cpu;
                }
                if mem.is_some() {
                    record.free_memory_ratio = mem;
                }
                if disk.is_some() {
                    record.free_disk_ratio = disk;
                }
            },
            Err(e) => {
                record.consecutive_failures += 1;
                record.availability_ewma *= 1.0 - RATE_ALPHA;
                debug!(device_id = %device_id, error = %e, failures = record.consecutive_failures, "Liveness probe failed");
            },
        }

        self.rescore(device_id, record);

        if let Some((value, mean)) = anomaly {
            warn!(device_id = %device_id, value, mean, "Response time anomaly");
            self.events.publish(CoreEvent::AnomalyDetected {
                device_id,
                metric: "response_time_ms".to_string(),
                value,
                mean,
            });
        }

        outcome.map(|_| ())
    }

    /// Recompute the score and status, publishing changes and alerts
    fn rescore(&self, device_id: DeviceId, record: &mut DeviceHealthRecord) {
        record.score = compute_score(record, &self.settings);
        let status = classify(record, &self.settings);

        if status != record.status {
            info!(
                device_id = %device_id,
                previous = %record.status,
                current = %status,
                score = record.score,
                "Device health changed"
            );
            self.events.publish(CoreEvent::HealthChanged {
                device_id,
                previous: record.status,
                current: status,
                score: record.score,
            });
            record.status = status;
        }

        if matches!(status, HealthStatus::Unhealthy | HealthStatus::Offline) {
            let cooldown = Duration::from_millis(self.settings.alert_cooldown_ms);
            let due = record
                .last_alert_at
                .map_or(true, |at| at.elapsed() >= cooldown);
            if due {
                record.last_alert_at = Some(Instant::now());
                self.events.publish(CoreEvent::HealthAlert {
                    device_id,
                    status,
                    message: format!(
                        "Device {device_id} is {status} (score {:.2}, {} consecutive failures)",
                        record.score, record.consecutive_failures
                    ),
                });
            }
        }
    }

    /// Probe the whole fleet once
    pub async fn run_checks(&self) {
        for device_id in self.pool.device_ids() {
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            let _ = self.check_device(device_id).await;
        }
    }

    /// One diagnostics sweep: board health figures, stored verbatim
    pub async fn run_diagnostics(&self) {
        for device_id in self.pool.device_ids() {
            let Ok(sentence) = Sentence::from_command("/system/health/print") else {
                return;
            };
            match self.pool.execute_once(device_id, sentence).await {
                Ok(replies) => {
                    let mut records = self.records.write().await;
                    if let Some(record) = records.get_mut(&device_id) {
                        for reply in replies
                            .iter()
                            .filter(|s| s.reply_kind() == Some(ReplyKind::Data))
                        {
                            for word in reply.words() {
                                if let Some(rest) = word.strip_prefix('=') {
                                    if let Some((key, value)) = rest.split_once('=') {
                                        record
                                            .diagnostics
                                            .insert(key.to_string(), value.to_string());
                                    }
                                }
                            }
                        }
                    }
                },
                Err(e) => {
                    debug!(device_id = %device_id, error = %e, "Diagnostics sweep failed");
                },
            }
        }
    }

    /// Fold a command outcome into the device's error-rate EWMA. The
    /// facade calls this for every executed command so the score reflects
    /// real traffic, not just probes.
    pub async fn record_command_result(&self, device_id: DeviceId, success: bool) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&device_id) {
            let sample = if success { 0.0 } else { 1.0 };
            record.error_ewma = record.error_ewma * (1.0 - RATE_ALPHA) + sample * RATE_ALPHA;
        }
    }

    /// Start tracking a device added at runtime
    pub async fn add_device(&self, device_id: DeviceId) {
        self.records
            .write()
            .await
            .entry(device_id)
            .or_insert_with(DeviceHealthRecord::new);
    }

    /// Drop a removed device's record
    pub async fn remove_device(&self, device_id: DeviceId) {
        self.records.write().await.remove(&device_id);
    }

    pub async fn status(&self, device_id: DeviceId) -> HealthStatus {
        self.records
            .read()
            .await
            .get(&device_id)
            .map(|r| r.status)
            .unwrap_or(HealthStatus::Unknown)
    }

    pub async fn score(&self, device_id: DeviceId) -> f64 {
        self.records
            .read()
            .await
            .get(&device_id)
            .map(|r| r.score)
            .unwrap_or(0.0)
    }

    fn snapshot(record: &DeviceHealthRecord) -> DeviceHealthStats {
        DeviceHealthStats {
            status: record.status,
            score: record.score,
            consecutive_failures: record.consecutive_failures,
            avg_response_ms: record.avg_response_ms(),
            cpu_load: record.cpu_load,
            free_memory_ratio: record.free_memory_ratio,
            free_disk_ratio: record.free_disk_ratio,
        }
    }

    /// Full health snapshot for one device
    pub async fn device_stats(&self, device_id: DeviceId) -> Option<DeviceHealthStats> {
        self.records
            .read()
            .await
            .get(&device_id)
            .map(Self::snapshot)
    }

    pub async fn stats(&self) -> HealthStats {
        let records = self.records.read().await;
        HealthStats {
            devices: records
                .iter()
                .map(|(id, r)| (*id, Self::snapshot(r)))
                .collect(),
        }
    }

    /// Spawn the liveness and diagnostics loops
    pub fn start(self: &Arc<Self>) {
        let mut handles = Vec::new();

        let monitor = self.clone();
        let interval = Duration::from_millis(self.settings.check_interval_ms);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if monitor.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                monitor.run_checks().await;
            }
        }));

        let monitor = self.clone();
        let interval = Duration::from_millis(self.settings.diagnostics_interval_ms);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if monitor.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                monitor.run_diagnostics().await;
            }
        }));

        if let Ok(mut slot) = self.loops.lock() {
            *slot = handles;
        }
    }

    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.loops.lock() {
            for handle in slot.drain(..) {
                handle.abort();
            }
        }
    }
}
