//! Connection pooling
//!
//! Per-device session pools with circuit breakers in front of connection
//! establishment. `acquire` hands out an authenticated session, reusing
//! idle ones when possible and opening new ones up to the per-device cap;
//! past the cap callers wait FIFO until a session comes back or the
//! acquire timeout fires. All connection attempts go through the device's
//! breaker, so a dead device fails fast instead of tying up the pool.

pub mod circuit_breaker;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{DeviceConfig, PoolSettings};
use crate::error::{RosSrvError, Result};
use crate::events::{CoreEvent, EventBus};
use crate::metrics::{DevicePoolStats, PoolStats};
use crate::protocol::Sentence;
use crate::session::{DeviceSession, SessionConfig};
use crate::types::DeviceId;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

/// Seam between the pool and the transport. Production connects TCP and
/// authenticates; tests substitute in-memory devices.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, device: &DeviceConfig, config: SessionConfig)
        -> Result<DeviceSession>;
}

/// Real transport: TCP connect, then the login handshake
pub struct TcpConnector {
    pub connect_timeout: Duration,
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        device: &DeviceConfig,
        config: SessionConfig,
    ) -> Result<DeviceSession> {
        let session =
            DeviceSession::connect(DeviceId(device.id), &device.address, self.connect_timeout, config)
                .await?;
        session.authenticate(&device.username, &device.password).await?;
        Ok(session)
    }
}

type Waiter = oneshot::Sender<Result<Arc<DeviceSession>>>;

struct PoolInner {
    idle: VecDeque<Arc<DeviceSession>>,
    /// Sessions in existence for this device, idle and checked out alike
    live: usize,
    waiters: VecDeque<Waiter>,
}

struct DevicePool {
    config: DeviceConfig,
    breaker: CircuitBreaker,
    inner: Mutex<PoolInner>,
    online: AtomicBool,
    sessions_created: AtomicU64,
    sessions_recycled: AtomicU64,
    acquire_timeouts: AtomicU64,
}

/// Session pools for the whole fleet, one breaker-guarded pool per device.
/// Devices can join and leave at runtime.
pub struct ConnectionPool {
    settings: PoolSettings,
    session_config: SessionConfig,
    connector: Arc<dyn Connector>,
    devices: DashMap<DeviceId, Arc<DevicePool>>,
    events: EventBus,
    shutting_down: AtomicBool,
    maintenance: StdMutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(
        settings: PoolSettings,
        session_config: SessionConfig,
        devices: &[DeviceConfig],
        connector: Arc<dyn Connector>,
        events: EventBus,
    ) -> Self {
        let pool = Self {
            settings,
            session_config,
            connector,
            devices: DashMap::new(),
            events,
            shutting_down: AtomicBool::new(false),
            maintenance: StdMutex::new(None),
        };
        for device in devices {
            pool.devices
                .insert(DeviceId(device.id), pool.make_pool(device.clone()));
        }
        pool
    }

    fn make_pool(&self, config: DeviceConfig) -> Arc<DevicePool> {
        let breaker_config = CircuitBreakerConfig {
            failure_threshold: self.settings.breaker_failure_threshold,
            reset_timeout: Duration::from_millis(self.settings.breaker_reset_timeout_ms),
            success_threshold: self.settings.breaker_success_threshold,
        };
        Arc::new(DevicePool {
            config,
            breaker: CircuitBreaker::new(breaker_config),
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                live: 0,
                waiters: VecDeque::new(),
            }),
            online: AtomicBool::new(false),
            sessions_created: AtomicU64::new(0),
            sessions_recycled: AtomicU64::new(0),
            acquire_timeouts: AtomicU64::new(0),
        })
    }

    fn device(&self, device_id: DeviceId) -> Result<Arc<DevicePool>> {
        self.devices
            .get(&device_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RosSrvError::validation(format!("Unknown device {device_id}")))
    }

    /// Snapshot of the device pools; iteration never holds map locks
    /// across awaits.
    fn pools(&self) -> Vec<(DeviceId, Arc<DevicePool>)> {
        self.devices
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.iter().map(|entry| *entry.key()).collect()
    }

    /// Register a device at runtime. Its pool fills on first use or the
    /// next maintenance pass.
    pub fn add_device(&self, config: DeviceConfig) -> Result<()> {
        let device_id = DeviceId(config.id);
        if self.devices.contains_key(&device_id) {
            return Err(RosSrvError::validation(format!(
                "Device {device_id} already registered"
            )));
        }
        info!(device_id = %device_id, name = %config.name, "Device added to pool");
        self.devices.insert(device_id, self.make_pool(config));
        Ok(())
    }

    /// Deregister a device: close its idle sessions and fail its waiters.
    /// Checked-out sessions die on release once their pool is gone.
    pub async fn remove_device(&self, device_id: DeviceId) -> Result<()> {
        let Some((_, dp)) = self.devices.remove(&device_id) else {
            return Err(RosSrvError::validation(format!(
                "Unknown device {device_id}"
            )));
        };
        let mut inner = dp.inner.lock().await;
        for session in inner.idle.drain(..) {
            session.close();
        }
        inner.live = 0;
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.send(Err(RosSrvError::validation(format!(
                "Device {device_id} removed"
            ))));
        }
        info!(device_id = %device_id, "Device removed from pool");
        Ok(())
    }

    /// Check out a session, waiting up to the configured acquire timeout.
    pub async fn acquire(&self, device_id: DeviceId) -> Result<Arc<DeviceSession>> {
        self.acquire_with_timeout(
            device_id,
            Duration::from_millis(self.settings.acquire_timeout_ms),
        )
        .await
    }

    /// Check out a session with an explicit timeout covering the whole
    /// wait, connection establishment included.
    pub async fn acquire_with_timeout(
        &self,
        device_id: DeviceId,
        timeout: Duration,
    ) -> Result<Arc<DeviceSession>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RosSrvError::connection("Pool is shutting down"));
        }
        let dp = self.device(device_id)?;
        if !dp.config.enabled {
            return Err(RosSrvError::validation(format!(
                "Device {device_id} is disabled"
            )));
        }
        let deadline = Instant::now() + timeout;

        let rx = {
            let mut inner = dp.inner.lock().await;

            // Reuse an idle session, recycling stale ones along the way
            while let Some(session) = inner.idle.pop_front() {
                if session.is_usable() {
                    return Ok(session);
                }
                inner.live -= 1;
                dp.sessions_recycled.fetch_add(1, Ordering::Relaxed);
                session.close();
            }

            if inner.live < self.settings.max_connections {
                if !dp.breaker.can_execute().await {
                    return Err(RosSrvError::CircuitOpen(format!(
                        "Device {device_id} circuit is open"
                    )));
                }
                // Reserve the slot before releasing the lock
                inner.live += 1;
                drop(inner);
                return self.open_session(&dp).await;
            }

            // At capacity: join the FIFO wait queue
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(tx);
            rx
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RosSrvError::connection("Pool dropped the wait queue")),
            Err(_) => {
                dp.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                Err(RosSrvError::AcquireTimeout(format!(
                    "No session for device {device_id} within {timeout:?}"
                )))
            },
        }
    }

    /// Connect and authenticate a fresh session. The live slot is already
    /// reserved; give it back on failure.
    async fn open_session(&self, dp: &Arc<DevicePool>) -> Result<Arc<DeviceSession>> {
        match self
            .connector
            .connect(&dp.config, self.session_config.clone())
            .await
        {
            Ok(session) => {
                dp.sessions_created.fetch_add(1, Ordering::Relaxed);
                dp.breaker.record_success().await;
                self.mark_online(dp);
                debug!(
                    device_id = dp.config.id,
                    session_id = session.id(),
                    "Opened pooled session"
                );
                Ok(Arc::new(session))
            },
            Err(e) => {
                {
                    let mut inner = dp.inner.lock().await;
                    inner.live -= 1;
                }
                warn!(device_id = dp.config.id, error = %e, "Session open failed");
                if dp.breaker.record_failure().await {
                    self.handle_trip(dp, &e.to_string()).await;
                }
                Err(e)
            },
        }
    }

    /// Return a session. Unusable sessions are recycled; otherwise the
    /// longest-waiting acquirer gets it, or it goes idle.
    pub async fn release(&self, session: Arc<DeviceSession>) {
        let Ok(dp) = self.device(session.device_id()) else {
            session.close();
            return;
        };

        // A session checked out before a breaker trip must not reach a
        // later acquirer while the device is still open
        let breaker_open = dp.breaker.state().await == CircuitState::Open;

        let mut inner = dp.inner.lock().await;
        if self.shutting_down.load(Ordering::SeqCst) || breaker_open || !session.is_usable() {
            inner.live -= 1;
            dp.sessions_recycled.fetch_add(1, Ordering::Relaxed);
            session.close();
            return;
        }

        let mut session = session;
        while let Some(waiter) = inner.waiters.pop_front() {
            match waiter.send(Ok(session)) {
                Ok(()) => return,
                // Waiter timed out and went away; try the next one
                Err(Ok(back)) => session = back,
                Err(Err(_)) => return,
            }
        }
        inner.idle.push_back(session);
    }

    /// Execute a command on any pooled session of the device. Single
    /// attempt; queue dispatch uses this path and owns its own retries.
    pub async fn execute_once(
        &self,
        device_id: DeviceId,
        sentence: Sentence,
    ) -> Result<Vec<Sentence>> {
        let dp = self.device(device_id)?;
        let session = self.acquire(device_id).await?;
        let result = session.send(sentence).await;
        self.release(session).await;

        match &result {
            Ok(_) => {
                dp.breaker.record_success().await;
                self.mark_online(&dp);
            },
            Err(e) if Self::is_channel_failure(e) => {
                if dp.breaker.record_failure().await {
                    self.handle_trip(&dp, &e.to_string()).await;
                }
            },
            // Device-level traps mean the channel works fine
            Err(_) => {},
        }
        result
    }

    /// Execute a command with exponential backoff on transient failures.
    /// This is the direct facade path; queued work never stacks a second
    /// retry layer on top of this one.
    pub async fn execute_command(
        &self,
        device_id: DeviceId,
        sentence: Sentence,
    ) -> Result<Vec<Sentence>> {
        let attempts = self.settings.retry_attempts.max(1);
        let mut delay = Duration::from_millis(self.settings.retry_initial_delay_ms);
        let max_delay = Duration::from_millis(self.settings.retry_max_delay_ms);

        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.execute_once(device_id, sentence.clone()).await {
                Ok(replies) => return Ok(replies),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    debug!(
                        device_id = %device_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(Self::jittered(delay)).await;
                    delay = std::cmp::min(
                        delay.mul_f64(self.settings.retry_backoff_multiplier),
                        max_delay,
                    );
                    last_err = Some(e);
                },
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| RosSrvError::internal("Retry loop exhausted")))
    }

    /// Liveness probe used by the health monitor: one resource query,
    /// timed. Outcomes feed the breaker through `execute_once`.
    pub async fn probe(&self, device_id: DeviceId) -> Result<(Duration, Vec<Sentence>)> {
        let sentence = Sentence::from_command("/system/resource/print")?;
        let started = Instant::now();
        let replies = self.execute_once(device_id, sentence).await?;
        Ok((started.elapsed(), replies))
    }

    pub async fn breaker_state(&self, device_id: DeviceId) -> Result<CircuitState> {
        Ok(self.device(device_id)?.breaker.state().await)
    }

    /// Operator action: force a device's breaker closed
    pub async fn reset_breaker(&self, device_id: DeviceId) -> Result<()> {
        self.device(device_id)?.breaker.reset().await;
        Ok(())
    }

    fn is_channel_failure(e: &RosSrvError) -> bool {
        matches!(
            e,
            RosSrvError::ConnectionError(_)
                | RosSrvError::ConnectionLost(_)
                | RosSrvError::TimeoutError(_)
        )
    }

    /// Uniform jitter in [0.8, 1.2) of the nominal delay
    fn jittered(delay: Duration) -> Duration {
        let factor = rand::thread_rng().gen_range(0.8..1.2);
        delay.mul_f64(factor)
    }

    fn mark_online(&self, dp: &Arc<DevicePool>) {
        if !dp.online.swap(true, Ordering::SeqCst) {
            info!(device_id = dp.config.id, "Device online");
            self.events.publish(CoreEvent::DeviceOnline {
                device_id: DeviceId(dp.config.id),
            });
        }
    }

    /// Breaker just tripped open: drop idle sessions, fail every waiter,
    /// announce the device offline. Runs exactly once per trip.
    async fn handle_trip(&self, dp: &Arc<DevicePool>, reason: &str) {
        let (idle, waiters) = {
            let mut inner = dp.inner.lock().await;
            let idle: Vec<_> = inner.idle.drain(..).collect();
            inner.live -= idle.len();
            let waiters: Vec<_> = inner.waiters.drain(..).collect();
            (idle, waiters)
        };
        for session in idle {
            dp.sessions_recycled.fetch_add(1, Ordering::Relaxed);
            session.close();
        }
        for waiter in waiters {
            let _ = waiter.send(Err(RosSrvError::CircuitOpen(format!(
                "Device {} circuit opened: {reason}",
                dp.config.id
            ))));
        }

        dp.online.store(false, Ordering::SeqCst);
        warn!(device_id = dp.config.id, reason, "Device offline, circuit open");
        self.events.publish(CoreEvent::DeviceOffline {
            device_id: DeviceId(dp.config.id),
            reason: reason.to_string(),
        });
    }

    /// One maintenance pass: prune idle sessions past their idle timeout
    /// or usability, then top pools back up to the minimum size.
    pub async fn maintain(&self) {
        let idle_timeout = Duration::from_millis(self.settings.idle_timeout_ms);

        for (_, dp) in self.pools() {
            if !dp.config.enabled {
                continue;
            }

            // Prune
            {
                let mut inner = dp.inner.lock().await;
                let mut kept = VecDeque::with_capacity(inner.idle.len());
                while let Some(session) = inner.idle.pop_front() {
                    if session.is_usable() && session.idle_time() < idle_timeout {
                        kept.push_back(session);
                    } else {
                        inner.live -= 1;
                        dp.sessions_recycled.fetch_add(1, Ordering::Relaxed);
                        session.close();
                    }
                }
                inner.idle = kept;
            }

            // Replenish, but never fight an open breaker
            loop {
                if dp.breaker.state().await != CircuitState::Closed {
                    break;
                }
                {
                    let mut inner = dp.inner.lock().await;
                    if inner.live >= self.settings.min_connections {
                        break;
                    }
                    inner.live += 1;
                }
                match self.open_session(&dp).await {
                    Ok(session) => {
                        let mut inner = dp.inner.lock().await;
                        inner.idle.push_back(session);
                    },
                    Err(_) => break,
                }
            }
        }
    }

    /// Spawn the background maintenance loop.
    pub fn start(self: &Arc<Self>) {
        let pool = self.clone();
        let interval = Duration::from_millis(self.settings.health_check_interval_ms);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if pool.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                pool.maintain().await;
            }
        });
        if let Ok(mut slot) = self.maintenance.lock() {
            *slot = Some(handle);
        }
    }

    /// Stop maintenance and tear down every session.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.maintenance.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        for (_, dp) in self.pools() {
            let mut inner = dp.inner.lock().await;
            for session in inner.idle.drain(..) {
                session.close();
            }
            inner.live = 0;
            for waiter in inner.waiters.drain(..) {
                let _ = waiter.send(Err(RosSrvError::connection("Pool is shutting down")));
            }
        }
        info!("Connection pool shut down");
    }

    pub async fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for (device_id, dp) in self.pools() {
            let inner = dp.inner.lock().await;
            let breaker_state = match dp.breaker.state().await {
                CircuitState::Closed => "closed",
                CircuitState::Open => "open",
                CircuitState::HalfOpen => "half_open",
            };
            stats.devices.insert(
                device_id,
                DevicePoolStats {
                    live_sessions: inner.live,
                    idle_sessions: inner.idle.len(),
                    waiting_acquirers: inner.waiters.len(),
                    breaker_state: breaker_state.to_string(),
                    sessions_created: dp.sessions_created.load(Ordering::Relaxed),
                    sessions_recycled: dp.sessions_recycled.load(Ordering::Relaxed),
                    acquire_timeouts: dp.acquire_timeouts.load(Ordering::Relaxed),
                },
            );
        }
        stats
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::session::tests::echo_device;
    use std::sync::atomic::AtomicUsize;

    /// In-memory connector backed by the echo mock device
    pub(crate) struct MockConnector {
        connects: AtomicUsize,
        /// Fail the first N connection attempts
        fail_first: usize,
    }

    impl MockConnector {
        pub(crate) fn new() -> Self {
            Self {
                connects: AtomicUsize::new(0),
                fail_first: 0,
            }
        }

        pub(crate) fn failing_first(n: usize) -> Self {
            Self {
                connects: AtomicUsize::new(0),
                fail_first: n,
            }
        }

        pub(crate) fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(
            &self,
            device: &DeviceConfig,
            config: SessionConfig,
        ) -> Result<DeviceSession> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(RosSrvError::connection("mock connect refused"));
            }
            let (client, server) = tokio::io::duplex(64 * 1024);
            echo_device(server);
            Ok(DeviceSession::from_stream(
                DeviceId(device.id),
                client,
                config,
            ))
        }
    }

    pub(crate) fn device(id: u32) -> DeviceConfig {
        DeviceConfig {
            id,
            name: format!("dev-{id}"),
            address: format!("10.0.0.{id}:8728"),
            username: "api".into(),
            password: "pw".into(),
            group: None,
            region: None,
            enabled: true,
            base_weight: 1.0,
        }
    }

    /// A working pool over mock devices, for tests in other modules
    pub(crate) fn mock_pool(device_ids: &[u32]) -> Arc<ConnectionPool> {
        let devices: Vec<DeviceConfig> = device_ids.iter().map(|id| device(*id)).collect();
        Arc::new(ConnectionPool::new(
            settings(0, 4),
            SessionConfig::default(),
            &devices,
            Arc::new(MockConnector::new()),
            EventBus::new(),
        ))
    }

    pub(crate) fn settings(min: usize, max: usize) -> PoolSettings {
        PoolSettings {
            min_connections: min,
            max_connections: max,
            acquire_timeout_ms: 200,
            retry_attempts: 1,
            retry_initial_delay_ms: 10,
            breaker_failure_threshold: 100,
            ..Default::default()
        }
    }

    fn pool(settings: PoolSettings, connector: Arc<MockConnector>) -> ConnectionPool {
        ConnectionPool::new(
            settings,
            SessionConfig::default(),
            &[device(1)],
            connector,
            EventBus::new(),
        )
    }

    #[tokio::test]
    async fn test_acquire_reuses_idle_session() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(settings(0, 4), connector.clone());

        let s1 = pool.acquire(DeviceId(1)).await.unwrap();
        let first_id = s1.id();
        pool.release(s1).await;

        let s2 = pool.acquire(DeviceId(1)).await.unwrap();
        assert_eq!(s2.id(), first_id);
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_max_connections_bounds_sessions() {
        let connector = Arc::new(MockConnector::new());
        let pool = Arc::new(pool(settings(2, 4), connector.clone()));

        // Five concurrent acquirers against a cap of four
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.acquire(DeviceId(1)).await.unwrap());
        }
        let err = pool
            .acquire_with_timeout(DeviceId(1), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, RosSrvError::AcquireTimeout(_)));
        assert_eq!(connector.connect_count(), 4);

        let stats = pool.stats().await;
        let dev = &stats.devices[&DeviceId(1)];
        assert_eq!(dev.live_sessions, 4);
        assert_eq!(dev.acquire_timeouts, 1);
    }

    #[tokio::test]
    async fn test_waiter_served_on_release() {
        let connector = Arc::new(MockConnector::new());
        let pool = Arc::new(pool(settings(0, 1), connector.clone()));

        let held = pool.acquire(DeviceId(1)).await.unwrap();
        let held_id = held.id();

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move {
            waiter_pool
                .acquire_with_timeout(DeviceId(1), Duration::from_secs(2))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release(held).await;

        let session = waiter.await.unwrap().unwrap();
        // Same session handed over, no new connect
        assert_eq!(session.id(), held_id);
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_fails_fast() {
        let connector = Arc::new(MockConnector::failing_first(usize::MAX));
        let mut s = settings(0, 4);
        s.breaker_failure_threshold = 2;
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let pool = ConnectionPool::new(
            s,
            SessionConfig::default(),
            &[device(1)],
            connector.clone(),
            events,
        );

        for _ in 0..2 {
            let err = pool.acquire(DeviceId(1)).await.unwrap_err();
            assert!(matches!(err, RosSrvError::ConnectionError(_)));
        }
        assert_eq!(pool.breaker_state(DeviceId(1)).await.unwrap(), CircuitState::Open);

        // Fails fast without touching the connector
        let before = connector.connect_count();
        let err = pool.acquire(DeviceId(1)).await.unwrap_err();
        assert!(matches!(err, RosSrvError::CircuitOpen(_)));
        assert_eq!(connector.connect_count(), before);

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event.kind(), "device_offline");
    }

    #[tokio::test]
    async fn test_execute_command_retries_transient_failures() {
        let connector = Arc::new(MockConnector::failing_first(2));
        let mut s = settings(0, 4);
        s.retry_attempts = 3;
        s.retry_initial_delay_ms = 10;
        s.retry_max_delay_ms = 50;
        let pool = pool(s, connector.clone());

        let replies = pool
            .execute_command(DeviceId(1), Sentence::from_command("/ping").unwrap())
            .await
            .unwrap();
        assert_eq!(replies[0].attribute("echo"), Some("/ping"));
        assert_eq!(connector.connect_count(), 3);
    }

    #[tokio::test]
    async fn test_release_closes_session_while_breaker_open() {
        let connector = Arc::new(MockConnector::new());
        let mut s = settings(0, 4);
        s.breaker_failure_threshold = 1;
        let pool = pool(s, connector.clone());

        let session = pool.acquire(DeviceId(1)).await.unwrap();

        // Trip the breaker while the session is checked out
        let dp = pool.device(DeviceId(1)).unwrap();
        dp.breaker.record_failure().await;
        assert_eq!(dp.breaker.state().await, CircuitState::Open);

        // The returned session is closed, not parked for a later acquire
        pool.release(session).await;
        let stats = pool.stats().await;
        let dev = &stats.devices[&DeviceId(1)];
        assert_eq!(dev.live_sessions, 0);
        assert_eq!(dev.idle_sessions, 0);
        assert_eq!(dev.sessions_recycled, 1);
    }

    #[tokio::test]
    async fn test_unusable_session_recycled_on_release() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(settings(0, 4), connector.clone());

        let session = pool.acquire(DeviceId(1)).await.unwrap();
        session.close();
        pool.release(session).await;

        let stats = pool.stats().await;
        let dev = &stats.devices[&DeviceId(1)];
        assert_eq!(dev.live_sessions, 0);
        assert_eq!(dev.sessions_recycled, 1);

        // Next acquire opens a fresh one
        let fresh = pool.acquire(DeviceId(1)).await.unwrap();
        assert!(fresh.is_usable());
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_maintain_replenishes_to_minimum() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(settings(2, 4), connector.clone());

        pool.maintain().await;

        let stats = pool.stats().await;
        let dev = &stats.devices[&DeviceId(1)];
        assert_eq!(dev.live_sessions, 2);
        assert_eq!(dev.idle_sessions, 2);
    }

    #[tokio::test]
    async fn test_unknown_device_rejected() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(settings(0, 4), connector);
        let err = pool.acquire(DeviceId(99)).await.unwrap_err();
        assert!(matches!(err, RosSrvError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_probe_returns_latency_and_replies() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(settings(0, 4), connector);

        let (elapsed, replies) = pool.probe(DeviceId(1)).await.unwrap();
        assert!(elapsed < Duration::from_secs(1));
        assert_eq!(
            replies[0].attribute("echo"),
            Some("/system/resource/print")
        );
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_acquires() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(settings(0, 4), connector);

        pool.shutdown().await;
        let err = pool.acquire(DeviceId(1)).await.unwrap_err();
        assert!(matches!(err, RosSrvError::ConnectionError(_)));
    }
}
