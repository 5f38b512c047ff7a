//! Statistics snapshots
//!
//! Plain serializable structs the components fill on demand. Counters are
//! sampled, never live references, so a snapshot is internally consistent
//! and safe to serialize from any task.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{DeviceId, HealthStatus};

/// Pool counters for one device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevicePoolStats {
    pub live_sessions: usize,
    pub idle_sessions: usize,
    pub waiting_acquirers: usize,
    /// "closed" | "open" | "half_open"
    pub breaker_state: String,
    pub sessions_created: u64,
    pub sessions_recycled: u64,
    pub acquire_timeouts: u64,
}

/// Connection pool snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub devices: HashMap<DeviceId, DevicePoolStats>,
}

impl PoolStats {
    pub fn total_live(&self) -> usize {
        self.devices.values().map(|d| d.live_sessions).sum()
    }
}

/// Command queue snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Entries waiting, keyed by priority lane name
    pub queued_by_priority: HashMap<String, usize>,
    pub queued_total: usize,
    pub scheduled: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub deduplicated: u64,
    pub dead_lettered: u64,
    pub rejected: u64,
    pub open_transactions: usize,
}

/// Load balancer snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalancerStats {
    pub algorithm: String,
    pub selections: HashMap<DeviceId, u64>,
    pub affinity_entries: usize,
    pub available_devices: usize,
}

/// One device as the health monitor sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceHealthStats {
    pub status: HealthStatus,
    pub score: f64,
    pub consecutive_failures: u32,
    pub avg_response_ms: f64,
    pub cpu_load: Option<f64>,
    pub free_memory_ratio: Option<f64>,
    pub free_disk_ratio: Option<f64>,
}

/// Health monitor snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthStats {
    pub devices: HashMap<DeviceId, DeviceHealthStats>,
}

/// Everything at once, for the status surface
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreStats {
    pub pool: PoolStats,
    pub queue: QueueStats,
    pub balancer: BalancerStats,
    pub health: HealthStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes() {
        let mut stats = CoreStats::default();
        stats.pool.devices.insert(
            DeviceId(1),
            DevicePoolStats {
                live_sessions: 3,
                idle_sessions: 1,
                breaker_state: "closed".into(),
                ..Default::default()
            },
        );
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"live_sessions\":3"));
        assert_eq!(stats.pool.total_live(), 3);
    }
}
