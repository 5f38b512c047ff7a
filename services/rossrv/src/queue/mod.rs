//! Command queue and dispatcher
//!
//! Five priority lanes drain in strict priority order, FIFO within a
//! lane. Admission enforces a total size cap and a keyed dedup window;
//! scheduled commands wait in a time-indexed holding structure until due.
//! Dispatch is paced by a token bucket and grouped into per-device
//! batches bounded by a concurrency semaphore, with unpinned commands
//! resolved through the balancer. The queue owns retries for queued work:
//! transient failures reschedule with exponential backoff, exhausted
//! commands land in a dead letter buffer. Transactional commands sit in
//! an isolated holding area the dispatcher never sees; `commit` moves all
//! of them into their lanes in one step, while `rollback` or a missed
//! deadline discards the whole group.

pub mod entry;
pub mod rate_limiter;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::balancer::{LoadBalancer, SelectionHint};
use crate::config::QueueSettings;
use crate::error::{RosSrvError, Result};
use crate::events::{CoreEvent, EventBus};
use crate::metrics::QueueStats;
use crate::pool::ConnectionPool;
use crate::protocol::Sentence;
use crate::types::{CommandId, DeviceId, TransactionId};

pub use entry::{AttemptRecord, CommandRequest, DeadLetter, Priority, QueueEntry};
pub use rate_limiter::TokenBucket;

/// Awaitable result of a submitted command
#[derive(Debug)]
pub struct CommandHandle {
    pub id: CommandId,
    rx: oneshot::Receiver<Result<Vec<Sentence>>>,
}

impl CommandHandle {
    /// Wait for the command to complete, however many retries it takes
    pub async fn wait(self) -> Result<Vec<Sentence>> {
        self.rx
            .await
            .map_err(|_| RosSrvError::internal("Command dropped by the queue"))?
    }
}

/// Holding area for one open transaction; its entries are invisible to
/// the dispatcher until commit
struct TransactionState {
    deadline: Instant,
    entries: Vec<QueueEntry>,
}

struct QueueState {
    lanes: [VecDeque<QueueEntry>; Priority::COUNT],
    /// Time-indexed holding set: scheduled submissions and retries
    /// waiting out their backoff delay
    scheduled: Vec<(Instant, QueueEntry)>,
    /// Dedup key -> window expiry
    dedup: HashMap<String, Instant>,
    transactions: HashMap<TransactionId, TransactionState>,
}

impl QueueState {
    /// Route an entry to its lane, or hold it while its due time is still
    /// ahead
    fn place(&mut self, entry: QueueEntry, now: Instant) {
        match entry.schedule_at {
            Some(at) if at > now => self.scheduled.push((at, entry)),
            _ => self.lanes[entry.priority.lane()].push_back(entry),
        }
    }

    fn queued_total(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum::<usize>()
            + self.scheduled.len()
            + self
                .transactions
                .values()
                .map(|txn| txn.entries.len())
                .sum::<usize>()
    }
}

/// Prioritized, deduplicating, transactional command queue
pub struct CommandQueue {
    settings: QueueSettings,
    pool: Arc<ConnectionPool>,
    /// Resolves unpinned commands at dispatch time; None means pins are
    /// mandatory
    balancer: Option<Arc<LoadBalancer>>,
    events: EventBus,
    state: Mutex<QueueState>,
    batch_permits: Arc<Semaphore>,
    bucket: TokenBucket,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    in_flight: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    deduplicated: AtomicU64,
    dead_lettered: AtomicU64,
    rejected: AtomicU64,
    shutting_down: AtomicBool,
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
}

impl CommandQueue {
    pub fn new(
        settings: QueueSettings,
        pool: Arc<ConnectionPool>,
        balancer: Option<Arc<LoadBalancer>>,
        events: EventBus,
    ) -> Self {
        let batch_permits = Arc::new(Semaphore::new(settings.max_concurrent_batches));
        let bucket = TokenBucket::new(settings.commands_per_second, settings.burst_size);
        Self {
            settings,
            pool,
            balancer,
            events,
            state: Mutex::new(QueueState {
                lanes: std::array::from_fn(|_| VecDeque::new()),
                scheduled: Vec::new(),
                dedup: HashMap::new(),
                transactions: HashMap::new(),
            }),
            batch_permits,
            bucket,
            dead_letters: Mutex::new(VecDeque::new()),
            in_flight: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            dispatcher: StdMutex::new(None),
        }
    }

    /// Admit a command. Fails fast on a full queue, a duplicate inside the
    /// dedup window, an unknown transaction, or an unpinned command when no
    /// balancer is attached.
    pub async fn submit(&self, request: CommandRequest) -> Result<CommandHandle> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RosSrvError::internal("Queue is shutting down"));
        }
        if request.device_id.is_none() && self.balancer.is_none() {
            return Err(RosSrvError::validation(
                "Unpinned command needs a load balancer".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        if state.queued_total() >= self.settings.max_queue_size {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(RosSrvError::QueueFull(format!(
                "Queue at capacity ({})",
                self.settings.max_queue_size
            )));
        }

        let now = Instant::now();
        if let Some(key) = &request.dedup_key {
            if state.dedup.get(key).is_some_and(|expiry| *expiry > now) {
                self.deduplicated.fetch_add(1, Ordering::Relaxed);
                return Err(RosSrvError::DuplicateCommand(format!(
                    "Command with dedup key '{key}' inside the dedup window"
                )));
            }
        }

        if let Some(txn_id) = request.transaction {
            if !state.transactions.contains_key(&txn_id) {
                return Err(RosSrvError::validation(format!(
                    "Unknown transaction {txn_id}"
                )));
            }
        }

        if let Some(key) = request.dedup_key.clone() {
            state
                .dedup
                .insert(key, now + Duration::from_millis(self.settings.dedup_window_ms));
        }

        let (entry, rx) = QueueEntry::from_request(request, self.settings.default_max_retries);
        let id = entry.id;
        debug!(command_id = %id, device_id = ?entry.device_id, priority = entry.priority.name(), "Command queued");
        match entry.transaction {
            // Held back until the transaction commits
            Some(txn_id) => {
                if let Some(txn) = state.transactions.get_mut(&txn_id) {
                    txn.entries.push(entry);
                }
            },
            None => state.place(entry, now),
        }

        Ok(CommandHandle { id, rx })
    }

    /// Open a transaction. Commands submitted into it are held back from
    /// dispatch until `commit`; `rollback` or a missed deadline discards
    /// every one of them.
    pub async fn begin_transaction(&self) -> TransactionId {
        let id = TransactionId::new();
        let mut state = self.state.lock().await;
        state.transactions.insert(
            id,
            TransactionState {
                deadline: Instant::now()
                    + Duration::from_millis(self.settings.transaction_timeout_ms),
                entries: Vec::new(),
            },
        );
        debug!(transaction_id = %id, "Transaction opened");
        id
    }

    /// Release a transaction's commands for dispatch. All of them enter
    /// their priority lanes in one step, in submission order.
    pub async fn commit(&self, txn_id: TransactionId) -> Result<()> {
        let mut state = self.state.lock().await;
        let txn = state
            .transactions
            .remove(&txn_id)
            .ok_or_else(|| RosSrvError::validation(format!("Unknown transaction {txn_id}")))?;
        let count = txn.entries.len();
        let now = Instant::now();
        for mut entry in txn.entries {
            entry.transaction = None;
            state.place(entry, now);
        }
        info!(transaction_id = %txn_id, commands = count, "Transaction committed");
        Ok(())
    }

    /// Discard a transaction and every command held in it. The commands
    /// never ran, so their handles resolve with an error.
    pub async fn rollback(&self, txn_id: TransactionId) -> Result<()> {
        let txn = {
            let mut state = self.state.lock().await;
            state
                .transactions
                .remove(&txn_id)
                .ok_or_else(|| RosSrvError::validation(format!("Unknown transaction {txn_id}")))?
        };
        self.discard_transaction(txn_id, txn.entries, "explicit rollback");
        Ok(())
    }

    fn discard_transaction(&self, txn_id: TransactionId, entries: Vec<QueueEntry>, reason: &str) {
        let count = entries.len();
        for entry in entries {
            let _ = entry.resolver.send(Err(RosSrvError::validation(format!(
                "Transaction {txn_id} rolled back: {reason}"
            ))));
        }
        info!(transaction_id = %txn_id, commands = count, reason, "Transaction rolled back");
        self.events.publish(CoreEvent::TransactionRolledBack {
            transaction_id: txn_id,
            reason: reason.to_string(),
        });
    }

    /// One dispatcher pass: promote due entries, expire dedup entries and
    /// transaction deadlines, then drain lanes into per-device batches.
    pub async fn dispatch_tick(self: &Arc<Self>) {
        let now = Instant::now();

        let (batches_input, expired_txns) = {
            let mut state = self.state.lock().await;

            // Promote entries whose due time or backoff elapsed
            if state.scheduled.iter().any(|(at, _)| *at <= now) {
                let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.scheduled)
                    .into_iter()
                    .partition(|(at, _)| *at <= now);
                state.scheduled = pending;
                for (_, entry) in ready {
                    state.lanes[entry.priority.lane()].push_back(entry);
                }
            }

            state.dedup.retain(|_, expiry| *expiry > now);

            // Transactions past their deadline auto-roll-back
            let expired: Vec<TransactionId> = state
                .transactions
                .iter()
                .filter(|(_, txn)| txn.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            let mut expired_txns = Vec::new();
            for id in expired {
                if let Some(txn) = state.transactions.remove(&id) {
                    expired_txns.push((id, txn.entries));
                }
            }

            // Drain lanes in priority order, paced by the token bucket
            let mut batch: Vec<QueueEntry> = Vec::new();
            'drain: for lane in 0..Priority::COUNT {
                while batch.len() < self.settings.batch_size {
                    if state.lanes[lane].is_empty() {
                        break;
                    }
                    if !self.bucket.try_acquire() {
                        break 'drain;
                    }
                    if let Some(entry) = state.lanes[lane].pop_front() {
                        batch.push(entry);
                    }
                }
                if batch.len() >= self.settings.batch_size {
                    break;
                }
            }

            (batch, expired_txns)
        };

        for (txn_id, entries) in expired_txns {
            self.discard_transaction(txn_id, entries, "deadline expired");
        }

        // Group by target device; unpinned entries get one from the
        // balancer now, so the pick reflects current health and load
        let mut batches: HashMap<DeviceId, Vec<QueueEntry>> = HashMap::new();
        for mut entry in batches_input {
            let device_id = match entry.device_id {
                Some(id) => id,
                None => match self.resolve_target().await {
                    Ok(id) => {
                        entry.device_id = Some(id);
                        id
                    },
                    Err(e) => {
                        self.fail_entry(entry, e).await;
                        continue;
                    },
                },
            };
            batches.entry(device_id).or_default().push(entry);
        }

        for (device_id, entries) in batches {
            let queue = self.clone();
            let permits = self.batch_permits.clone();
            tokio::spawn(async move {
                let Ok(permit) = permits.acquire_owned().await else {
                    return;
                };
                queue.execute_batch(device_id, entries).await;
                drop(permit);
            });
        }
    }

    async fn resolve_target(&self) -> Result<DeviceId> {
        match &self.balancer {
            Some(balancer) => balancer.select(&SelectionHint::none()).await,
            None => Err(RosSrvError::validation(
                "Unpinned command needs a load balancer".to_string(),
            )),
        }
    }

    /// Run one device's batch sequentially on the pool
    async fn execute_batch(self: &Arc<Self>, device_id: DeviceId, entries: Vec<QueueEntry>) {
        self.in_flight.fetch_add(entries.len(), Ordering::Relaxed);
        for entry in entries {
            let result = self
                .pool
                .execute_once(device_id, entry.sentence.clone())
                .await;
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
            match result {
                Ok(replies) => self.complete_entry(entry, replies),
                Err(e) => self.fail_entry(entry, e).await,
            }
        }
    }

    fn complete_entry(&self, entry: QueueEntry, replies: Vec<Sentence>) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        let _ = entry.resolver.send(Ok(replies));
    }

    /// Failure path: reschedule with backoff while the error is transient
    /// and the retry budget lasts, otherwise dead-letter the command.
    async fn fail_entry(&self, mut entry: QueueEntry, error: RosSrvError) {
        entry.record_failure(&error.to_string());

        if error.is_retryable() && entry.retries_left() {
            self.retried.fetch_add(1, Ordering::Relaxed);
            let delay = self.retry_delay(entry.attempts);
            debug!(
                command_id = %entry.id,
                attempt = entry.attempts,
                delay_ms = delay.as_millis() as u64,
                "Rescheduling command after transient failure"
            );
            let mut state = self.state.lock().await;
            state.scheduled.push((Instant::now() + delay, entry));
            return;
        }

        self.failed.fetch_add(1, Ordering::Relaxed);
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        warn!(
            command_id = %entry.id,
            device_id = ?entry.device_id,
            attempts = entry.attempts,
            error = %error,
            "Command exhausted retries, dead-lettering"
        );

        {
            let mut letters = self.dead_letters.lock().await;
            if letters.len() >= self.settings.dead_letter_capacity {
                letters.pop_front();
            }
            letters.push_back(DeadLetter {
                id: entry.id,
                device_id: entry.device_id,
                words: entry.sentence.words().to_vec(),
                attempts: entry.attempts,
                attempt_history: entry.attempt_history.clone(),
                last_error: error.to_string(),
                at: Utc::now(),
            });
        }

        self.events.publish(CoreEvent::CommandDeadLettered {
            command_id: entry.id,
            device_id: entry.device_id,
            error: error.to_string(),
        });

        let _ = entry.resolver.send(Err(error));
    }

    /// base * multiplier^(attempt-1), capped
    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.settings.retry_base_delay_ms as f64;
        let exp = self
            .settings
            .retry_backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        let ms = (base * exp).min(self.settings.max_retry_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Spawn the dispatcher loop
    pub fn start(self: &Arc<Self>) {
        let queue = self.clone();
        let interval = Duration::from_millis(self.settings.dispatch_interval_ms);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if queue.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                queue.dispatch_tick().await;
            }
        });
        if let Ok(mut slot) = self.dispatcher.lock() {
            *slot = Some(handle);
        }
    }

    /// Stop dispatching and fail everything still queued
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.dispatcher.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        let mut state = self.state.lock().await;
        for lane in &mut state.lanes {
            for entry in lane.drain(..) {
                let _ = entry
                    .resolver
                    .send(Err(RosSrvError::internal("Queue shut down")));
            }
        }
        for (_, entry) in state.scheduled.drain(..) {
            let _ = entry
                .resolver
                .send(Err(RosSrvError::internal("Queue shut down")));
        }
        for (_, txn) in state.transactions.drain() {
            for entry in txn.entries {
                let _ = entry
                    .resolver
                    .send(Err(RosSrvError::internal("Queue shut down")));
            }
        }
        info!("Command queue shut down");
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().await.iter().cloned().collect()
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let mut queued_by_priority = HashMap::new();
        for priority in Priority::all() {
            queued_by_priority.insert(
                priority.name().to_string(),
                state.lanes[priority.lane()].len(),
            );
        }
        QueueStats {
            queued_by_priority,
            queued_total: state.queued_total(),
            scheduled: state.scheduled.len(),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            open_transactions: state.transactions.len(),
        }
    }
}
