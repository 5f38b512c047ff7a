//! Service facade
//!
//! `RouterCore` owns the pool, queue, balancer, health monitor, and cache,
//! and wires them together over the event bus: breaker trips disable a
//! device in the balancer and flush its cache entries, health scores feed
//! selection weights. Callers get one surface for direct execution,
//! balanced execution, queued submission, and transactions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::balancer::{LoadBalancer, SelectionHint};
use crate::cache::{CommandCache, MemoryCache};
use crate::config::{DeviceConfig, ServiceConfig};
use crate::error::Result;
use crate::events::{CoreEvent, EventBus};
use crate::health::HealthMonitor;
use crate::metrics::{CoreStats, DeviceHealthStats};
use crate::pool::{ConnectionPool, Connector, TcpConnector};
use crate::protocol::Sentence;
use crate::queue::{CommandHandle, CommandQueue, CommandRequest};
use crate::types::{DeviceId, TransactionId};

/// How long query replies stay cached
const CACHE_TTL: Duration = Duration::from_secs(5);

/// The assembled control-channel core
pub struct RouterCore {
    pool: Arc<ConnectionPool>,
    queue: Arc<CommandQueue>,
    balancer: Arc<LoadBalancer>,
    health: Arc<HealthMonitor>,
    cache: Arc<dyn CommandCache>,
    events: EventBus,
    adaptation_interval: Duration,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl RouterCore {
    /// Production assembly over TCP
    pub fn new(config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        let connector = Arc::new(TcpConnector {
            connect_timeout: Duration::from_millis(config.pool.connect_timeout_ms),
        });
        Self::with_connector(config, connector, Arc::new(MemoryCache::new(CACHE_TTL)))
    }

    /// Assembly with explicit transport and cache, used by tests and
    /// embedders
    pub fn with_connector(
        config: ServiceConfig,
        connector: Arc<dyn Connector>,
        cache: Arc<dyn CommandCache>,
    ) -> Result<Self> {
        let events = EventBus::new();
        let pool = Arc::new(ConnectionPool::new(
            config.pool.clone(),
            (&config.session).into(),
            &config.devices,
            connector,
            events.clone(),
        ));
        let balancer = Arc::new(LoadBalancer::new(config.balancer.clone(), &config.devices));
        let queue = Arc::new(CommandQueue::new(
            config.queue.clone(),
            pool.clone(),
            Some(balancer.clone()),
            events.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            pool.clone(),
            events.clone(),
        ));

        Ok(Self {
            pool,
            queue,
            balancer,
            health,
            cache,
            events,
            adaptation_interval: Duration::from_millis(config.balancer.adaptation_interval_ms),
            background: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Run a command on a specific device, with backoff retry for
    /// transient failures. Query replies may come from the cache; writes
    /// flush the device's cached entries.
    pub async fn execute(&self, device_id: DeviceId, sentence: Sentence) -> Result<Vec<Sentence>> {
        let read = Self::is_query(&sentence);
        if read {
            if let Some(replies) = self.cache.get(device_id, sentence.words()) {
                debug!(device_id = %device_id, "Serving query from cache");
                return Ok(replies);
            }
        }

        let started = Instant::now();
        let result = self.pool.execute_command(device_id, sentence.clone()).await;
        let elapsed = started.elapsed();

        self.balancer
            .record_result(device_id, elapsed, result.is_ok())
            .await;
        self.health
            .record_command_result(device_id, result.is_ok())
            .await;

        if let Ok(replies) = &result {
            if read {
                self.cache.put(device_id, sentence.words(), replies.clone());
            } else {
                self.cache.invalidate_device(device_id);
            }
        }
        result
    }

    /// Run a command on whichever device the balancer picks
    pub async fn execute_on_any(
        &self,
        sentence: Sentence,
        hint: &SelectionHint,
    ) -> Result<(DeviceId, Vec<Sentence>)> {
        let device_id = self.balancer.select(hint).await?;
        self.balancer.connection_opened(device_id).await;
        let result = self.execute(device_id, sentence).await;
        self.balancer.connection_closed(device_id).await;
        result.map(|replies| (device_id, replies))
    }

    /// Run several commands concurrently on one session of the device
    pub async fn execute_batch(
        &self,
        device_id: DeviceId,
        sentences: Vec<Sentence>,
    ) -> Result<Vec<Result<Vec<Sentence>>>> {
        let session = self.pool.acquire(device_id).await?;
        let started = Instant::now();
        let results = session.send_batch(sentences).await;
        let elapsed = started.elapsed();
        self.pool.release(session).await;

        let all_ok = results.iter().all(Result::is_ok);
        self.balancer.record_result(device_id, elapsed, all_ok).await;
        self.health.record_command_result(device_id, all_ok).await;
        self.cache.invalidate_device(device_id);
        Ok(results)
    }

    /// Queue a command; the handle resolves when it completes or exhausts
    /// its retries
    pub async fn submit(&self, request: CommandRequest) -> Result<CommandHandle> {
        self.queue.submit(request).await
    }

    pub async fn begin_transaction(&self) -> TransactionId {
        self.queue.begin_transaction().await
    }

    pub async fn commit(&self, txn: TransactionId) -> Result<()> {
        self.queue.commit(txn).await
    }

    pub async fn rollback(&self, txn: TransactionId) -> Result<()> {
        self.queue.rollback(txn).await
    }

    /// Bring a new device under management at runtime
    pub async fn add_device(&self, config: DeviceConfig) -> Result<()> {
        let device_id = DeviceId(config.id);
        self.pool.add_device(config.clone())?;
        self.balancer.add_device(&config).await;
        self.health.add_device(device_id).await;
        info!(device_id = %device_id, name = %config.name, "Device added");
        Ok(())
    }

    /// Stop managing a device: withdraw it from selection, tear down its
    /// pool, and drop its cached replies and health record
    pub async fn remove_device(&self, device_id: DeviceId) -> Result<()> {
        self.balancer.remove_device(device_id).await;
        self.pool.remove_device(device_id).await?;
        self.health.remove_device(device_id).await;
        self.cache.invalidate_device(device_id);
        info!(device_id = %device_id, "Device removed");
        Ok(())
    }

    /// Enable or disable a device for balanced selection without
    /// deregistering it
    pub async fn set_device_enabled(&self, device_id: DeviceId, enabled: bool) {
        self.balancer.set_enabled(device_id, enabled).await;
    }

    /// Full health snapshot for one device; None if it is not managed
    pub async fn device_health(&self, device_id: DeviceId) -> Option<DeviceHealthStats> {
        self.health.device_stats(device_id).await
    }

    pub async fn stats(&self) -> CoreStats {
        CoreStats {
            pool: self.pool.stats().await,
            queue: self.queue.stats().await,
            balancer: self.balancer.stats().await,
            health: self.health.stats().await,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn is_query(sentence: &Sentence) -> bool {
        sentence
            .first()
            .map_or(false, |path| path.ends_with("/print") || path.ends_with("/getall"))
    }

    /// Start every background loop: pool maintenance, queue dispatch,
    /// health checks, balancer adaptation, and the event wiring that keeps
    /// the balancer's availability view current.
    pub fn start(self: &Arc<Self>) {
        self.pool.start();
        self.queue.start();
        self.health.start();

        let mut handles = Vec::new();

        let core = self.clone();
        let interval = self.adaptation_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                core.balancer.adapt().await;
            }
        }));

        let core = self.clone();
        let mut rx = self.events.subscribe();
        handles.push(tokio::spawn(async move {
            while let Ok(envelope) = rx.recv().await {
                match envelope.event {
                    CoreEvent::DeviceOffline { device_id, .. } => {
                        core.balancer.set_breaker_open(device_id, true).await;
                        core.cache.invalidate_device(device_id);
                    },
                    CoreEvent::DeviceOnline { device_id } => {
                        core.balancer.set_breaker_open(device_id, false).await;
                    },
                    CoreEvent::HealthChanged {
                        device_id, score, ..
                    } => {
                        core.balancer.set_health_score(device_id, score).await;
                    },
                    _ => {},
                }
            }
        }));

        if let Ok(mut slot) = self.background.lock() {
            *slot = handles;
        }
        info!("Router core started");
    }

    /// Orderly teardown: stop accepting, drain nothing, close everything
    pub async fn shutdown(&self) {
        if let Ok(mut slot) = self.background.lock() {
            for handle in slot.drain(..) {
                handle.abort();
            }
        }
        self.queue.shutdown().await;
        self.health.shutdown();
        self.pool.shutdown().await;
        info!("Router core stopped");
    }
}
