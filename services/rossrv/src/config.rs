//! Service configuration
//!
//! YAML-based configuration with environment overrides via figment.
//! Every component gets its own section with workable defaults; durations
//! are plain `*_ms` integers in the file and converted at the edges.

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ErrorExt, Result, RosSrvError};

/// Load-balancing algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BalancerAlgorithm {
    RoundRobin,
    #[default]
    Weighted,
    LeastConnections,
    LowestResponseTime,
    Geographic,
    ConsistentHash,
}

/// One managed device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable numeric id, unique across the fleet
    pub id: u32,
    /// Display name
    pub name: String,
    /// host:port of the API endpoint
    pub address: String,
    pub username: String,
    pub password: String,
    /// Pool group for balancing (devices without a group form one pool)
    #[serde(default)]
    pub group: Option<String>,
    /// Region label for geographic balancing
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Base weight for weighted selection
    #[serde(default = "default_weight")]
    pub base_weight: f64,
}

fn default_true() -> bool {
    true
}

fn default_weight() -> f64 {
    1.0
}

/// Session-level knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "SessionSettings::default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "SessionSettings::default_max_lifetime_ms")]
    pub max_lifetime_ms: u64,
    #[serde(default = "SessionSettings::default_error_ceiling")]
    pub error_ceiling: u32,
}

impl SessionSettings {
    fn default_command_timeout_ms() -> u64 {
        10_000
    }
    fn default_max_lifetime_ms() -> u64 {
        30 * 60 * 1000
    }
    fn default_error_ceiling() -> u32 {
        10
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            command_timeout_ms: Self::default_command_timeout_ms(),
            max_lifetime_ms: Self::default_max_lifetime_ms(),
            error_ceiling: Self::default_error_ceiling(),
        }
    }
}

impl From<&SessionSettings> for crate::session::SessionConfig {
    fn from(s: &SessionSettings) -> Self {
        Self {
            command_timeout: Duration::from_millis(s.command_timeout_ms),
            max_lifetime: Duration::from_millis(s.max_lifetime_ms),
            error_ceiling: s.error_ceiling,
        }
    }
}

/// Connection pool settings (applied per device)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "PoolSettings::default_min")]
    pub min_connections: usize,
    #[serde(default = "PoolSettings::default_max")]
    pub max_connections: usize,
    #[serde(default = "PoolSettings::default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "PoolSettings::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "PoolSettings::default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "PoolSettings::default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Backoff retry for the direct execute path (the queue has its own)
    #[serde(default = "PoolSettings::default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "PoolSettings::default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "PoolSettings::default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "PoolSettings::default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,
    /// Circuit breaker
    #[serde(default = "PoolSettings::default_failure_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "PoolSettings::default_reset_timeout_ms")]
    pub breaker_reset_timeout_ms: u64,
    #[serde(default = "PoolSettings::default_success_threshold")]
    pub breaker_success_threshold: u32,
}

impl PoolSettings {
    fn default_min() -> usize {
        1
    }
    fn default_max() -> usize {
        4
    }
    fn default_acquire_timeout_ms() -> u64 {
        5_000
    }
    fn default_connect_timeout_ms() -> u64 {
        5_000
    }
    fn default_health_check_interval_ms() -> u64 {
        30_000
    }
    fn default_idle_timeout_ms() -> u64 {
        5 * 60 * 1000
    }
    fn default_retry_attempts() -> u32 {
        3
    }
    fn default_retry_initial_delay_ms() -> u64 {
        1_000
    }
    fn default_retry_max_delay_ms() -> u64 {
        30_000
    }
    fn default_retry_backoff_multiplier() -> f64 {
        2.0
    }
    fn default_failure_threshold() -> u32 {
        5
    }
    fn default_reset_timeout_ms() -> u64 {
        30_000
    }
    fn default_success_threshold() -> u32 {
        1
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: Self::default_min(),
            max_connections: Self::default_max(),
            acquire_timeout_ms: Self::default_acquire_timeout_ms(),
            connect_timeout_ms: Self::default_connect_timeout_ms(),
            health_check_interval_ms: Self::default_health_check_interval_ms(),
            idle_timeout_ms: Self::default_idle_timeout_ms(),
            retry_attempts: Self::default_retry_attempts(),
            retry_initial_delay_ms: Self::default_retry_initial_delay_ms(),
            retry_max_delay_ms: Self::default_retry_max_delay_ms(),
            retry_backoff_multiplier: Self::default_retry_backoff_multiplier(),
            breaker_failure_threshold: Self::default_failure_threshold(),
            breaker_reset_timeout_ms: Self::default_reset_timeout_ms(),
            breaker_success_threshold: Self::default_success_threshold(),
        }
    }
}

/// Command queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Total admission cap across all lanes
    #[serde(default = "QueueSettings::default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "QueueSettings::default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "QueueSettings::default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
    #[serde(default = "QueueSettings::default_commands_per_second")]
    pub commands_per_second: u32,
    #[serde(default = "QueueSettings::default_burst_size")]
    pub burst_size: u32,
    #[serde(default = "QueueSettings::default_dedup_window_ms")]
    pub dedup_window_ms: u64,
    #[serde(default = "QueueSettings::default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,
    #[serde(default = "QueueSettings::default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    #[serde(default = "QueueSettings::default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "QueueSettings::default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "QueueSettings::default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,
    #[serde(default = "QueueSettings::default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "QueueSettings::default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
}

impl QueueSettings {
    fn default_max_queue_size() -> usize {
        10_000
    }
    fn default_batch_size() -> usize {
        32
    }
    fn default_max_concurrent_batches() -> usize {
        4
    }
    fn default_commands_per_second() -> u32 {
        100
    }
    fn default_burst_size() -> u32 {
        200
    }
    fn default_dedup_window_ms() -> u64 {
        5_000
    }
    fn default_transaction_timeout_ms() -> u64 {
        60_000
    }
    fn default_dispatch_interval_ms() -> u64 {
        50
    }
    fn default_max_retries() -> u32 {
        3
    }
    fn default_retry_base_delay_ms() -> u64 {
        1_000
    }
    fn default_retry_backoff_multiplier() -> f64 {
        2.0
    }
    fn default_max_retry_delay_ms() -> u64 {
        30_000
    }
    fn default_dead_letter_capacity() -> usize {
        1_000
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_queue_size: Self::default_max_queue_size(),
            batch_size: Self::default_batch_size(),
            max_concurrent_batches: Self::default_max_concurrent_batches(),
            commands_per_second: Self::default_commands_per_second(),
            burst_size: Self::default_burst_size(),
            dedup_window_ms: Self::default_dedup_window_ms(),
            transaction_timeout_ms: Self::default_transaction_timeout_ms(),
            dispatch_interval_ms: Self::default_dispatch_interval_ms(),
            default_max_retries: Self::default_max_retries(),
            retry_base_delay_ms: Self::default_retry_base_delay_ms(),
            retry_backoff_multiplier: Self::default_retry_backoff_multiplier(),
            max_retry_delay_ms: Self::default_max_retry_delay_ms(),
            dead_letter_capacity: Self::default_dead_letter_capacity(),
        }
    }
}

/// Load balancer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerSettings {
    #[serde(default)]
    pub algorithm: BalancerAlgorithm,
    #[serde(default = "BalancerSettings::default_min_health_score")]
    pub min_health_score: f64,
    #[serde(default = "BalancerSettings::default_max_connections_per_device")]
    pub max_connections_per_device: usize,
    #[serde(default = "BalancerSettings::default_max_avg_response_ms")]
    pub max_avg_response_ms: u64,
    #[serde(default = "BalancerSettings::default_affinity_ttl_ms")]
    pub affinity_ttl_ms: u64,
    #[serde(default = "BalancerSettings::default_adaptation_interval_ms")]
    pub adaptation_interval_ms: u64,
}

impl BalancerSettings {
    fn default_min_health_score() -> f64 {
        0.3
    }
    fn default_max_connections_per_device() -> usize {
        16
    }
    fn default_max_avg_response_ms() -> u64 {
        5_000
    }
    fn default_affinity_ttl_ms() -> u64 {
        10 * 60 * 1000
    }
    fn default_adaptation_interval_ms() -> u64 {
        30_000
    }
}

impl Default for BalancerSettings {
    fn default() -> Self {
        Self {
            algorithm: BalancerAlgorithm::default(),
            min_health_score: Self::default_min_health_score(),
            max_connections_per_device: Self::default_max_connections_per_device(),
            max_avg_response_ms: Self::default_max_avg_response_ms(),
            affinity_ttl_ms: Self::default_affinity_ttl_ms(),
            adaptation_interval_ms: Self::default_adaptation_interval_ms(),
        }
    }
}

/// Health score sub-score weights. Tunable; must sum to 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthWeights {
    #[serde(default = "HealthWeights::default_availability")]
    pub availability: f64,
    #[serde(default = "HealthWeights::default_resource")]
    pub resource: f64,
    #[serde(default = "HealthWeights::default_response_time")]
    pub response_time: f64,
    #[serde(default = "HealthWeights::default_error_rate")]
    pub error_rate: f64,
}

impl HealthWeights {
    fn default_availability() -> f64 {
        0.4
    }
    fn default_resource() -> f64 {
        0.2
    }
    fn default_response_time() -> f64 {
        0.2
    }
    fn default_error_rate() -> f64 {
        0.2
    }

    pub fn sum(&self) -> f64 {
        self.availability + self.resource + self.response_time + self.error_rate
    }
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            availability: Self::default_availability(),
            resource: Self::default_resource(),
            response_time: Self::default_response_time(),
            error_rate: Self::default_error_rate(),
        }
    }
}

/// Health monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "HealthSettings::default_check_interval_ms")]
    pub check_interval_ms: u64,
    #[serde(default = "HealthSettings::default_diagnostics_interval_ms")]
    pub diagnostics_interval_ms: u64,
    /// Ring size for per-device response time history
    #[serde(default = "HealthSettings::default_response_window")]
    pub response_time_window: usize,
    #[serde(default)]
    pub weights: HealthWeights,
    #[serde(default = "HealthSettings::default_warning_threshold")]
    pub warning_threshold: f64,
    #[serde(default = "HealthSettings::default_critical_threshold")]
    pub critical_threshold: f64,
    #[serde(default = "HealthSettings::default_alert_cooldown_ms")]
    pub alert_cooldown_ms: u64,
    /// k in the mean ± k·stddev anomaly baseline
    #[serde(default = "HealthSettings::default_anomaly_stddev_factor")]
    pub anomaly_stddev_factor: f64,
    /// Consecutive failures before a device counts as degraded/unhealthy
    #[serde(default = "HealthSettings::default_degraded_failures")]
    pub degraded_failures: u32,
    #[serde(default = "HealthSettings::default_unhealthy_failures")]
    pub unhealthy_failures: u32,
}

impl HealthSettings {
    fn default_check_interval_ms() -> u64 {
        15_000
    }
    fn default_diagnostics_interval_ms() -> u64 {
        5 * 60 * 1000
    }
    fn default_response_window() -> usize {
        50
    }
    fn default_warning_threshold() -> f64 {
        0.5
    }
    fn default_critical_threshold() -> f64 {
        0.25
    }
    fn default_alert_cooldown_ms() -> u64 {
        5 * 60 * 1000
    }
    fn default_anomaly_stddev_factor() -> f64 {
        3.0
    }
    fn default_degraded_failures() -> u32 {
        2
    }
    fn default_unhealthy_failures() -> u32 {
        5
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            check_interval_ms: Self::default_check_interval_ms(),
            diagnostics_interval_ms: Self::default_diagnostics_interval_ms(),
            response_time_window: Self::default_response_window(),
            weights: HealthWeights::default(),
            warning_threshold: Self::default_warning_threshold(),
            critical_threshold: Self::default_critical_threshold(),
            alert_cooldown_ms: Self::default_alert_cooldown_ms(),
            anomaly_stddev_factor: Self::default_anomaly_stddev_factor(),
            degraded_failures: Self::default_degraded_failures(),
            unhealthy_failures: Self::default_unhealthy_failures(),
        }
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub balancer: BalancerSettings,
    #[serde(default)]
    pub health: HealthSettings,
}

impl ServiceConfig {
    /// Load from a YAML file with `ROSSRV_`-prefixed environment
    /// overrides (e.g. `ROSSRV_POOL__MAX_CONNECTIONS=8`).
    pub fn load(path: &str) -> Result<Self> {
        let config: ServiceConfig = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("ROSSRV_").split("__"))
            .extract()
            .config_error("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a YAML string (tests, embedded defaults)
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ServiceConfig = Figment::new()
            .merge(Yaml::string(yaml))
            .extract()
            .config_error("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.min_connections > self.pool.max_connections {
            return Err(RosSrvError::ConfigError(format!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                self.pool.min_connections, self.pool.max_connections
            )));
        }
        if self.pool.max_connections == 0 {
            return Err(RosSrvError::config("pool.max_connections must be > 0"));
        }
        let weight_sum = self.health.weights.sum();
        if (weight_sum - 1.0).abs() > 1e-6 {
            return Err(RosSrvError::ConfigError(format!(
                "health.weights must sum to 1.0, got {weight_sum}"
            )));
        }
        if self.queue.batch_size == 0 || self.queue.max_concurrent_batches == 0 {
            return Err(RosSrvError::config(
                "queue.batch_size and queue.max_concurrent_batches must be > 0",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id) {
                return Err(RosSrvError::ConfigError(format!(
                    "Duplicate device id {}",
                    device.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.max_connections, 4);
        assert_eq!(config.queue.batch_size, 32);
        assert!((config.health.weights.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let yaml = r#"
devices:
  - id: 1
    name: edge-router-1
    address: "10.0.0.1:8728"
    username: api
    password: secret
    group: edge
    region: eu-west
pool:
  min_connections: 2
  max_connections: 8
balancer:
  algorithm: least_connections
"#;
        let config = ServiceConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].region.as_deref(), Some("eu-west"));
        assert!(config.devices[0].enabled);
        assert_eq!(config.pool.max_connections, 8);
        assert_eq!(
            config.balancer.algorithm,
            BalancerAlgorithm::LeastConnections
        );
        // Untouched sections keep defaults
        assert_eq!(config.queue.commands_per_second, 100);
    }

    #[test]
    fn test_invalid_pool_bounds_rejected() {
        let yaml = r#"
pool:
  min_connections: 8
  max_connections: 2
"#;
        assert!(ServiceConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_bad_weights_rejected() {
        let yaml = r#"
health:
  weights:
    availability: 0.9
    resource: 0.9
    response_time: 0.1
    error_rate: 0.1
"#;
        assert!(ServiceConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_duplicate_device_id_rejected() {
        let yaml = r#"
devices:
  - { id: 1, name: a, address: "h:1", username: u, password: p }
  - { id: 1, name: b, address: "h:2", username: u, password: p }
"#;
        assert!(ServiceConfig::from_yaml(yaml).is_err());
    }
}
