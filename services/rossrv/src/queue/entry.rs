//! Queue entry model
//!
//! Priority lanes, entry lifecycle states, and attempt bookkeeping. The
//! dispatcher in the parent module owns the queues themselves.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::Result;
use crate::protocol::Sentence;
use crate::types::{CommandId, DeviceId, TransactionId};

/// Dispatch priority. Lower lane index drains first; entries within a
/// lane keep FIFO order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

impl Priority {
    pub const COUNT: usize = 5;

    pub fn lane(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
            Priority::Background => 4,
        }
    }

    pub fn all() -> [Priority; Self::COUNT] {
        [
            Priority::Critical,
            Priority::High,
            Priority::Normal,
            Priority::Low,
            Priority::Background,
        ]
    }

    pub fn name(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Background => "background",
        }
    }
}

/// One failed execution attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// What the caller hands to `CommandQueue::submit`
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Target pin; None lets the balancer pick at dispatch time
    pub device_id: Option<DeviceId>,
    pub sentence: Sentence,
    pub priority: Priority,
    /// Retry budget; None uses the queue default
    pub max_retries: Option<u32>,
    pub transaction: Option<TransactionId>,
    /// Commands sharing a key inside the dedup window are rejected
    pub dedup_key: Option<String>,
    /// Hold the command back until this instant
    pub schedule_at: Option<Instant>,
}

impl CommandRequest {
    pub fn new(device_id: DeviceId, sentence: Sentence) -> Self {
        Self {
            device_id: Some(device_id),
            ..Self::any(sentence)
        }
    }

    /// Unpinned: the dispatcher asks the balancer for a target
    pub fn any(sentence: Sentence) -> Self {
        Self {
            device_id: None,
            sentence,
            priority: Priority::Normal,
            max_retries: None,
            transaction: None,
            dedup_key: None,
            schedule_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn in_transaction(mut self, transaction: TransactionId) -> Self {
        self.transaction = Some(transaction);
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn with_schedule_at(mut self, at: Instant) -> Self {
        self.schedule_at = Some(at);
        self
    }
}

/// An admitted command moving through the queue
pub struct QueueEntry {
    pub id: CommandId,
    pub device_id: Option<DeviceId>,
    pub sentence: Sentence,
    pub priority: Priority,
    pub max_retries: u32,
    pub attempts: u32,
    pub attempt_history: Vec<AttemptRecord>,
    pub enqueued_at: Instant,
    pub transaction: Option<TransactionId>,
    pub schedule_at: Option<Instant>,
    pub resolver: oneshot::Sender<Result<Vec<Sentence>>>,
}

impl QueueEntry {
    pub fn from_request(
        request: CommandRequest,
        default_max_retries: u32,
    ) -> (Self, oneshot::Receiver<Result<Vec<Sentence>>>) {
        let (resolver, rx) = oneshot::channel();
        let entry = Self {
            id: CommandId::new(),
            device_id: request.device_id,
            sentence: request.sentence,
            priority: request.priority,
            max_retries: request.max_retries.unwrap_or(default_max_retries),
            attempts: 0,
            attempt_history: Vec::new(),
            enqueued_at: Instant::now(),
            transaction: request.transaction,
            schedule_at: request.schedule_at,
            resolver,
        };
        (entry, rx)
    }

    pub fn record_failure(&mut self, error: &str) {
        self.attempts += 1;
        self.attempt_history.push(AttemptRecord {
            attempt: self.attempts,
            error: error.to_string(),
            at: Utc::now(),
        });
    }

    pub fn retries_left(&self) -> bool {
        self.attempts <= self.max_retries
    }
}

/// A command that exhausted its retries, kept for inspection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: CommandId,
    /// None when the command never resolved to a target
    pub device_id: Option<DeviceId>,
    pub words: Vec<String>,
    pub attempts: u32,
    /// Every failed attempt in order, errors and timestamps included
    pub attempt_history: Vec<AttemptRecord>,
    pub last_error: String,
    pub at: DateTime<Utc>,
}
