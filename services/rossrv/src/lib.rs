//! RouterOS Control-Channel Service (`rossrv`)
//!
//! An async control-channel core for fleets of RouterOS devices: binary
//! API sentences over TCP, pooled and authenticated sessions, and a
//! command pipeline that keeps misbehaving devices from dragging the rest
//! of the fleet down.
//!
//! # Features
//!
//! - **Wire protocol**: length-prefixed sentence framing with a streaming
//!   decoder, `.tag` correlation, and the MD5 challenge login handshake
//! - **Sessions**: many concurrent commands per connection, replies routed
//!   by tag in whatever order the device answers
//! - **Pooling**: per-device session pools with circuit breakers, FIFO
//!   acquire queues, and background pruning/replenishment
//! - **Queueing**: five priority lanes, keyed dedup window, scheduled
//!   delivery, token-bucket pacing, retry with exponential backoff, dead
//!   letters, and transactions that commit or discard their commands as
//!   one unit; unpinned commands pick their device through the balancer
//! - **Balancing**: six selection algorithms with health- and
//!   performance-aware filtering plus TTL affinity pinning
//! - **Health**: periodic liveness and diagnostics sweeps, weighted
//!   composite scoring, anomaly detection, and alerting over a typed
//!   event bus
//! - **Configuration**: YAML with environment overrides via figment
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │  Command Queue  │───►│ Connection Pool │───►│ Device Sessions │
//! │ (lanes/txns)    │    │ (breakers/FIFO) │    │ (tag routing)   │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!          ▲                       │                       │
//!          │                       ▼                       ▼
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │  Load Balancer  │◄───│ Health Monitor  │◄───│  Wire Protocol  │
//! │ (6 algorithms)  │    │ (scores/alerts) │    │ (codec + login) │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use rossrv::config::ServiceConfig;
//! use rossrv::service::RouterCore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> rossrv::error::Result<()> {
//!     let config = ServiceConfig::load("config/rossrv.yaml")?;
//!     let core = Arc::new(RouterCore::new(config)?);
//!     core.start();
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     core.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod balancer;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod service;
pub mod session;
pub mod types;

pub use balancer::{LoadBalancer, SelectionHint};
pub use cache::{CommandCache, MemoryCache, NoopCache};
pub use config::ServiceConfig;
pub use error::{Result, RosSrvError};
pub use events::{CoreEvent, EventBus};
pub use health::HealthMonitor;
pub use pool::{CircuitState, ConnectionPool, Connector, TcpConnector};
pub use protocol::Sentence;
pub use queue::{CommandHandle, CommandQueue, CommandRequest, Priority};
pub use service::RouterCore;
pub use session::{DeviceSession, SessionConfig};
pub use types::{CommandId, DeviceId, HealthStatus, Tag, TransactionId};
