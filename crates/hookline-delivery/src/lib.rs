//! Webhook dispatch engine with retry and observability guarantees.
//!
//! This crate processes events that have already passed signature
//! verification: it routes each to the handler registered for its topic,
//! tracks every attempt, retries failures with exponential backoff and
//! aggregates processing metrics.
//!
//! # Architecture
//!
//! 1. **Dispatch** - [`Dispatcher`] finds the handler and runs it under a
//!    timeout with panic containment
//! 2. **Monitor** - [`EventMonitor`] keeps one delivery record per event
//! 3. **Metrics** - [`MetricsAggregator`] updates global, topic and shop
//!    buckets
//! 4. **Retry** - [`RetryScheduler`] arms a timer for failed events and
//!    re-enters dispatch when it fires
//!
//! All state lives behind the `KeyValueStore` seam from `hookline-core`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hookline_core::{MemoryStore, NoMerchantDirectory, RealClock};
//! use hookline_delivery::{DeliveryError, EngineConfig, WebhookEngine};
//!
//! # async fn example() -> std::result::Result<(), DeliveryError> {
//! let mut engine = WebhookEngine::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(RealClock::new()),
//!     Arc::new(NoMerchantDirectory),
//!     EngineConfig::default(),
//! )?;
//!
//! engine.recover().await?;
//! engine.start()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;

pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod retry;
pub mod scheduler;

pub use dispatcher::Dispatcher;
pub use engine::{EngineConfig, WebhookEngine};
pub use error::{DeliveryError, Result};
pub use metrics::{HealthStatus, MetricBucket, MetricsAggregator, MetricsReport};
pub use monitor::{EventMonitor, MonitorStats};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{Redispatch, RetryScheduler, RetryScope, RetryState, ScheduleOutcome};

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(60);

/// Default cap on a single retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60 * 60);

/// Default bound on a single handler call.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Default threshold above which an attempt is logged as slow.
pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_millis(1000);

/// Default retention window for delivery records.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);
