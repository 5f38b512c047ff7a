//! Device load balancing
//!
//! Picks a device for work that is not pinned to one. Candidates are
//! filtered for availability first (enabled, healthy enough, breaker not
//! open, connection and latency caps respected), then one of six
//! algorithms chooses among them. An affinity map pins a caller-supplied
//! key to its previous device for a TTL so related commands land on the
//! same box.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::config::{BalancerAlgorithm, BalancerSettings, DeviceConfig};
use crate::error::{RosSrvError, Result};
use crate::metrics::BalancerStats;
use crate::types::DeviceId;

/// Response time smoothing factor for the EWMA
const RESPONSE_ALPHA: f64 = 0.2;
/// Performance factor adjustment per outcome
const PERF_SUCCESS_STEP: f64 = 0.05;
const PERF_FAILURE_STEP: f64 = 0.15;
/// Per-adaptation-pass pull of the performance factor back toward 1.0
const PERF_DECAY: f64 = 0.1;

/// Optional steering for one selection
#[derive(Debug, Clone, Default)]
pub struct SelectionHint {
    /// Related selections with the same key stick to the same device
    pub affinity_key: Option<String>,
    /// Restrict candidates to one device group
    pub group: Option<String>,
    /// Preferred region for geographic balancing
    pub region: Option<String>,
}

impl SelectionHint {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_affinity(key: impl Into<String>) -> Self {
        Self {
            affinity_key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn in_group(group: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct DeviceState {
    enabled: bool,
    group: Option<String>,
    region: Option<String>,
    base_weight: f64,
    health_score: f64,
    breaker_open: bool,
    active_connections: usize,
    /// EWMA of observed command latency; 0 until the first sample
    avg_response_ms: f64,
    /// Learned multiplier in [0.1, 1.0], punished by failures
    performance_factor: f64,
    selections: u64,
}

impl DeviceState {
    fn weight(&self) -> f64 {
        (self.base_weight * self.health_score * self.performance_factor).max(0.0)
    }
}

/// Multi-algorithm device selector
pub struct LoadBalancer {
    settings: BalancerSettings,
    devices: RwLock<HashMap<DeviceId, DeviceState>>,
    affinity: DashMap<String, (DeviceId, Instant)>,
    round_robin: AtomicUsize,
    total_selections: AtomicU64,
}

impl LoadBalancer {
    pub fn new(settings: BalancerSettings, devices: &[DeviceConfig]) -> Self {
        let map = devices
            .iter()
            .map(|d| (DeviceId(d.id), Self::state_for(d)))
            .collect();
        Self {
            settings,
            devices: RwLock::new(map),
            affinity: DashMap::new(),
            round_robin: AtomicUsize::new(0),
            total_selections: AtomicU64::new(0),
        }
    }

    fn state_for(d: &DeviceConfig) -> DeviceState {
        DeviceState {
            enabled: d.enabled,
            group: d.group.clone(),
            region: d.region.clone(),
            base_weight: d.base_weight,
            // Optimistic until the health monitor reports
            health_score: 1.0,
            breaker_open: false,
            active_connections: 0,
            avg_response_ms: 0.0,
            performance_factor: 1.0,
            selections: 0,
        }
    }

    /// Pick a device. Affinity wins when the pinned device is still
    /// available; otherwise the configured algorithm decides.
    pub async fn select(&self, hint: &SelectionHint) -> Result<DeviceId> {
        let devices = self.devices.read().await;
        let candidates = self.available(&devices, hint.group.as_deref());
        if candidates.is_empty() {
            return Err(RosSrvError::resource_exhausted(
                "No available device satisfies the selection constraints",
            ));
        }

        if let Some(key) = &hint.affinity_key {
            if let Some(pinned) = self.affinity_lookup(key) {
                if candidates.contains(&pinned) {
                    trace!(key, device_id = %pinned, "Affinity hit");
                    drop(devices);
                    self.record_selection(pinned, hint).await;
                    return Ok(pinned);
                }
            }
        }

        let chosen = match self.settings.algorithm {
            BalancerAlgorithm::RoundRobin => self.pick_round_robin(&candidates),
            BalancerAlgorithm::Weighted => Self::pick_weighted(&devices, &candidates),
            BalancerAlgorithm::LeastConnections => Self::pick_least_connections(&devices, &candidates),
            BalancerAlgorithm::LowestResponseTime => Self::pick_lowest_response(&devices, &candidates),
            BalancerAlgorithm::Geographic => {
                Self::pick_geographic(&devices, &candidates, hint.region.as_deref())
            },
            BalancerAlgorithm::ConsistentHash => {
                Self::pick_consistent_hash(&candidates, hint.affinity_key.as_deref())
                    .unwrap_or_else(|| self.pick_round_robin(&candidates))
            },
        };
        drop(devices);

        self.record_selection(chosen, hint).await;
        Ok(chosen)
    }

    /// Availability filter, sorted by id for deterministic iteration
    fn available(
        &self,
        devices: &HashMap<DeviceId, DeviceState>,
        group: Option<&str>,
    ) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = devices
            .iter()
            .filter(|(_, d)| {
                group.map_or(true, |g| d.group.as_deref() == Some(g))
                    && d.enabled
                    && !d.breaker_open
                    && d.health_score >= self.settings.min_health_score
                    && d.active_connections < self.settings.max_connections_per_device
                    && (d.avg_response_ms == 0.0
                        || d.avg_response_ms <= self.settings.max_avg_response_ms as f64)
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    fn pick_round_robin(&self, candidates: &[DeviceId]) -> DeviceId {
        let n = self.round_robin.fetch_add(1, Ordering::Relaxed);
        candidates[n % candidates.len()]
    }

    fn pick_weighted(
        devices: &HashMap<DeviceId, DeviceState>,
        candidates: &[DeviceId],
    ) -> DeviceId {
        let weights: Vec<f64> = candidates
            .iter()
            .map(|id| devices[id].weight().max(f64::EPSILON))
            .collect();
        let total: f64 = weights.iter().sum();
        let mut roll = rand::thread_rng().gen_range(0.0..total);
        for (id, weight) in candidates.iter().zip(&weights) {
            if roll < *weight {
                return *id;
            }
            roll -= weight;
        }
        candidates[candidates.len() - 1]
    }

    fn pick_least_connections(
        devices: &HashMap<DeviceId, DeviceState>,
        candidates: &[DeviceId],
    ) -> DeviceId {
        candidates
            .iter()
            .min_by_key(|id| devices[*id].active_connections)
            .copied()
            .unwrap_or(candidates[0])
    }

    fn pick_lowest_response(
        devices: &HashMap<DeviceId, DeviceState>,
        candidates: &[DeviceId],
    ) -> DeviceId {
        candidates
            .iter()
            .min_by(|a, b| {
                devices[*a]
                    .avg_response_ms
                    .total_cmp(&devices[*b].avg_response_ms)
            })
            .copied()
            .unwrap_or(candidates[0])
    }

    /// Prefer devices in the hinted region, falling back to the whole
    /// candidate set; least connections breaks ties.
    fn pick_geographic(
        devices: &HashMap<DeviceId, DeviceState>,
        candidates: &[DeviceId],
        region: Option<&str>,
    ) -> DeviceId {
        if let Some(region) = region {
            let local: Vec<DeviceId> = candidates
                .iter()
                .filter(|id| devices[*id].region.as_deref() == Some(region))
                .copied()
                .collect();
            if !local.is_empty() {
                return Self::pick_least_connections(devices, &local);
            }
        }
        Self::pick_least_connections(devices, candidates)
    }

    /// Rendezvous hashing: every key deterministically prefers one device
    /// and only moves when that device leaves the candidate set.
    fn pick_consistent_hash(candidates: &[DeviceId], key: Option<&str>) -> Option<DeviceId> {
        let key = key?;
        candidates
            .iter()
            .max_by_key(|id| {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                id.0.hash(&mut hasher);
                hasher.finish()
            })
            .copied()
    }

    async fn record_selection(&self, device_id: DeviceId, hint: &SelectionHint) {
        self.total_selections.fetch_add(1, Ordering::Relaxed);
        {
            let mut devices = self.devices.write().await;
            if let Some(d) = devices.get_mut(&device_id) {
                d.selections += 1;
            }
        }
        if let Some(key) = &hint.affinity_key {
            self.affinity
                .insert(key.clone(), (device_id, Instant::now()));
        }
    }

    fn affinity_lookup(&self, key: &str) -> Option<DeviceId> {
        let ttl = Duration::from_millis(self.settings.affinity_ttl_ms);
        let entry = self.affinity.get(key)?;
        let (device_id, pinned_at) = *entry;
        drop(entry);
        if pinned_at.elapsed() < ttl {
            Some(device_id)
        } else {
            self.affinity.remove(key);
            None
        }
    }

    /// Feed one command outcome back into the metrics
    pub async fn record_result(&self, device_id: DeviceId, elapsed: Duration, success: bool) {
        let mut devices = self.devices.write().await;
        let Some(d) = devices.get_mut(&device_id) else {
            return;
        };
        let sample = elapsed.as_secs_f64() * 1000.0;
        d.avg_response_ms = if d.avg_response_ms == 0.0 {
            sample
        } else {
            d.avg_response_ms * (1.0 - RESPONSE_ALPHA) + sample * RESPONSE_ALPHA
        };
        if success {
            d.performance_factor = (d.performance_factor + PERF_SUCCESS_STEP).min(1.0);
        } else {
            d.performance_factor = (d.performance_factor - PERF_FAILURE_STEP).max(0.1);
        }
    }

    pub async fn set_health_score(&self, device_id: DeviceId, score: f64) {
        let mut devices = self.devices.write().await;
        if let Some(d) = devices.get_mut(&device_id) {
            d.health_score = score.clamp(0.0, 1.0);
        }
    }

    pub async fn set_breaker_open(&self, device_id: DeviceId, open: bool) {
        let mut devices = self.devices.write().await;
        if let Some(d) = devices.get_mut(&device_id) {
            d.breaker_open = open;
        }
    }

    pub async fn set_enabled(&self, device_id: DeviceId, enabled: bool) {
        let mut devices = self.devices.write().await;
        if let Some(d) = devices.get_mut(&device_id) {
            d.enabled = enabled;
        }
    }

    /// Make a runtime-added device selectable
    pub async fn add_device(&self, config: &DeviceConfig) {
        let mut devices = self.devices.write().await;
        devices
            .entry(DeviceId(config.id))
            .or_insert_with(|| Self::state_for(config));
    }

    /// Withdraw a device from selection and drop its affinity pins
    pub async fn remove_device(&self, device_id: DeviceId) {
        let mut devices = self.devices.write().await;
        devices.remove(&device_id);
        drop(devices);
        self.affinity.retain(|_, (pinned, _)| *pinned != device_id);
    }

    pub async fn connection_opened(&self, device_id: DeviceId) {
        let mut devices = self.devices.write().await;
        if let Some(d) = devices.get_mut(&device_id) {
            d.active_connections += 1;
        }
    }

    pub async fn connection_closed(&self, device_id: DeviceId) {
        let mut devices = self.devices.write().await;
        if let Some(d) = devices.get_mut(&device_id) {
            d.active_connections = d.active_connections.saturating_sub(1);
        }
    }

    /// Periodic adaptation pass: forget old punishment by pulling every
    /// performance factor back toward neutral, and drop expired affinity
    /// pins.
    pub async fn adapt(&self) {
        {
            let mut devices = self.devices.write().await;
            for d in devices.values_mut() {
                d.performance_factor += (1.0 - d.performance_factor) * PERF_DECAY;
            }
        }
        let ttl = Duration::from_millis(self.settings.affinity_ttl_ms);
        self.affinity
            .retain(|_, (_, pinned_at)| pinned_at.elapsed() < ttl);
        debug!(affinity_entries = self.affinity.len(), "Balancer adaptation pass");
    }

    pub async fn stats(&self) -> BalancerStats {
        let devices = self.devices.read().await;
        let available = self.available(&devices, None).len();
        BalancerStats {
            algorithm: format!("{:?}", self.settings.algorithm),
            selections: devices.iter().map(|(id, d)| (*id, d.selections)).collect(),
            affinity_entries: self.affinity.len(),
            available_devices: available,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::tests::device;

    fn settings(algorithm: BalancerAlgorithm) -> BalancerSettings {
        BalancerSettings {
            algorithm,
            ..Default::default()
        }
    }

    fn balancer(algorithm: BalancerAlgorithm, ids: &[u32]) -> LoadBalancer {
        let devices: Vec<_> = ids.iter().map(|id| device(*id)).collect();
        LoadBalancer::new(settings(algorithm), &devices)
    }

    #[tokio::test]
    async fn test_round_robin_cycles_evenly() {
        let lb = balancer(BalancerAlgorithm::RoundRobin, &[1, 2, 3]);
        let mut counts: HashMap<DeviceId, u32> = HashMap::new();
        for _ in 0..9 {
            let id = lb.select(&SelectionHint::none()).await.unwrap();
            *counts.entry(id).or_default() += 1;
        }
        for id in [1, 2, 3] {
            assert_eq!(counts[&DeviceId(id)], 3);
        }
    }

    #[tokio::test]
    async fn test_weighted_follows_weights() {
        let mut devices = vec![device(1), device(2)];
        devices[1].base_weight = 3.0;
        let lb = LoadBalancer::new(settings(BalancerAlgorithm::Weighted), &devices);

        let mut heavy = 0u32;
        for _ in 0..10_000 {
            if lb.select(&SelectionHint::none()).await.unwrap() == DeviceId(2) {
                heavy += 1;
            }
        }
        // Expected 7500 of 10000; allow generous slack for randomness
        assert!((6800..8200).contains(&heavy), "heavy device picked {heavy} times");
    }

    #[tokio::test]
    async fn test_least_connections_prefers_idle_device() {
        let lb = balancer(BalancerAlgorithm::LeastConnections, &[1, 2]);
        lb.connection_opened(DeviceId(1)).await;
        lb.connection_opened(DeviceId(1)).await;
        lb.connection_opened(DeviceId(2)).await;

        assert_eq!(lb.select(&SelectionHint::none()).await.unwrap(), DeviceId(2));
    }

    #[tokio::test]
    async fn test_lowest_response_time() {
        let lb = balancer(BalancerAlgorithm::LowestResponseTime, &[1, 2]);
        lb.record_result(DeviceId(1), Duration::from_millis(200), true)
            .await;
        lb.record_result(DeviceId(2), Duration::from_millis(20), true)
            .await;

        assert_eq!(lb.select(&SelectionHint::none()).await.unwrap(), DeviceId(2));
    }

    #[tokio::test]
    async fn test_geographic_prefers_hinted_region() {
        let mut devices = vec![device(1), device(2)];
        devices[0].region = Some("eu".into());
        devices[1].region = Some("us".into());
        let lb = LoadBalancer::new(settings(BalancerAlgorithm::Geographic), &devices);

        let hint = SelectionHint {
            region: Some("us".into()),
            ..SelectionHint::default()
        };
        assert_eq!(lb.select(&hint).await.unwrap(), DeviceId(2));

        // Unknown region falls back to the full candidate set
        let hint = SelectionHint {
            region: Some("ap".into()),
            ..SelectionHint::default()
        };
        assert!(lb.select(&hint).await.is_ok());
    }

    #[tokio::test]
    async fn test_group_hint_restricts_candidates() {
        let mut devices = vec![device(1), device(2), device(3)];
        devices[0].group = Some("edge".into());
        devices[1].group = Some("core".into());
        let lb = LoadBalancer::new(settings(BalancerAlgorithm::RoundRobin), &devices);

        for _ in 0..5 {
            assert_eq!(
                lb.select(&SelectionHint::in_group("edge")).await.unwrap(),
                DeviceId(1)
            );
        }

        // A group with no members is a hard miss, not a fallback
        assert!(lb.select(&SelectionHint::in_group("lab")).await.is_err());
    }

    #[tokio::test]
    async fn test_consistent_hash_is_sticky() {
        let lb = balancer(BalancerAlgorithm::ConsistentHash, &[1, 2, 3]);
        // Bypass the affinity map so the hash itself is what sticks
        let first = pick_with_key(&lb, "tenant-42").await;
        lb.affinity.clear();
        for _ in 0..5 {
            assert_eq!(pick_with_key(&lb, "tenant-42").await, first);
            lb.affinity.clear();
        }
    }

    async fn pick_with_key(lb: &LoadBalancer, key: &str) -> DeviceId {
        lb.select(&SelectionHint::with_affinity(key)).await.unwrap()
    }

    #[tokio::test]
    async fn test_affinity_pins_follow_up_selections() {
        let lb = balancer(BalancerAlgorithm::RoundRobin, &[1, 2, 3]);
        let hint = SelectionHint::with_affinity("session-7");
        let first = lb.select(&hint).await.unwrap();
        for _ in 0..5 {
            assert_eq!(lb.select(&hint).await.unwrap(), first);
        }
        // Other traffic still rotates
        let other = lb.select(&SelectionHint::none()).await.unwrap();
        let another = lb.select(&SelectionHint::none()).await.unwrap();
        assert_ne!(other, another);
    }

    #[tokio::test]
    async fn test_unhealthy_and_tripped_devices_filtered() {
        let lb = balancer(BalancerAlgorithm::RoundRobin, &[1, 2]);
        lb.set_health_score(DeviceId(1), 0.1).await;
        lb.set_breaker_open(DeviceId(2), true).await;

        let err = lb.select(&SelectionHint::none()).await.unwrap_err();
        assert!(matches!(err, RosSrvError::ResourceExhausted(_)));

        lb.set_breaker_open(DeviceId(2), false).await;
        assert_eq!(lb.select(&SelectionHint::none()).await.unwrap(), DeviceId(2));
    }

    #[tokio::test]
    async fn test_failures_depress_performance_factor() {
        let mut devices = vec![device(1), device(2)];
        devices[0].base_weight = 1.0;
        devices[1].base_weight = 1.0;
        let lb = LoadBalancer::new(settings(BalancerAlgorithm::Weighted), &devices);

        for _ in 0..6 {
            lb.record_result(DeviceId(1), Duration::from_millis(50), false)
                .await;
        }
        // Device 1 is floored at 0.1 weight; expect a heavy skew to 2
        let mut healthy = 0u32;
        for _ in 0..2_000 {
            if lb.select(&SelectionHint::none()).await.unwrap() == DeviceId(2) {
                healthy += 1;
            }
        }
        assert!(healthy > 1_500, "healthy device picked {healthy} of 2000");

        // Adaptation forgets over time
        for _ in 0..50 {
            lb.adapt().await;
        }
        let devices = lb.devices.read().await;
        assert!(devices[&DeviceId(1)].performance_factor > 0.9);
    }
}
