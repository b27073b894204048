//! Webhook engine wiring dispatch, monitoring, metrics and retries.
//!
//! ```text
//! ┌───────────────┐   ┌────────────┐   ┌─────────────────┐
//! │ WebhookEngine │──▶│ Dispatcher │──▶│ WebhookHandlers │
//! └───────────────┘   └────────────┘   └─────────────────┘
//!         │              │   │   ▲
//!         │              ▼   ▼   │ redispatch
//!         │      ┌─────────┐ ┌───────────────┐
//!         │      │ Monitor │ │ RetryScheduler│
//!         │      └─────────┘ └───────────────┘
//!         ▼              ▼           │
//! ┌───────────────┐  ┌───────────────┐
//! │ Sweep tasks   │  │ KeyValueStore │◀──── metrics, checkpoints
//! └───────────────┘  └───────────────┘
//! ```
//!
//! [`WebhookEngine::start`] spawns three supervised background tasks: the
//! retry scheduler loop, the retention sweep and the periodic sweep that
//! re-arms failed deliveries left without a retry. [`WebhookEngine::shutdown`] cancels them and waits
//! for running retry attempts within the configured timeout.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use hookline_core::{
    Clock, EventContext, HandlerResult, IngestError, KeyValueStore, MerchantDirectory,
    WebhookHandler,
};
use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    dispatcher::Dispatcher,
    error::{DeliveryError, Result},
    metrics::{HealthStatus, MetricsAggregator, MetricsReport},
    monitor::EventMonitor,
    retry::RetryPolicy,
    scheduler::{Redispatch, RetryScheduler, RetryScope},
};

/// Configuration for the webhook engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on a single handler call.
    pub handler_timeout: Duration,

    /// Retry policy used when callers supply none.
    pub retry_policy: RetryPolicy,

    /// Attempts slower than this are logged at warn level.
    pub slow_threshold: Duration,

    /// Delivery records older than this are purged.
    pub retention: Duration,

    /// How often the retention sweep runs.
    pub retention_sweep_interval: Duration,

    /// How often every failed record is re-armed.
    pub failed_sweep_interval: Duration,

    /// Base stagger between re-armed failed records.
    pub recovery_stagger: Duration,

    /// Maximum time to wait for background tasks on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            handler_timeout: crate::DEFAULT_HANDLER_TIMEOUT,
            retry_policy: RetryPolicy::default(),
            slow_threshold: crate::DEFAULT_SLOW_THRESHOLD,
            retention: crate::DEFAULT_RETENTION,
            retention_sweep_interval: Duration::from_secs(24 * 60 * 60),
            failed_sweep_interval: Duration::from_secs(60 * 60),
            recovery_stagger: crate::DEFAULT_INITIAL_DELAY,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.retry_policy.validate()?;

        for (name, value) in [
            ("handler_timeout", self.handler_timeout),
            ("retention", self.retention),
            ("retention_sweep_interval", self.retention_sweep_interval),
            ("failed_sweep_interval", self.failed_sweep_interval),
            ("shutdown_timeout", self.shutdown_timeout),
            ("recovery_stagger", self.recovery_stagger),
        ] {
            if value.is_zero() {
                return Err(DeliveryError::configuration(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

/// Webhook processing engine.
pub struct WebhookEngine {
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    monitor: EventMonitor,
    metrics: Arc<MetricsAggregator>,
    scheduler: Arc<RetryScheduler>,
    dispatcher: Arc<Dispatcher>,
    cancellation_token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl WebhookEngine {
    /// Creates an engine over the given store.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        merchants: Arc<dyn MerchantDirectory>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;

        let monitor = EventMonitor::new(Arc::clone(&store), Arc::clone(&clock), merchants);
        let metrics = Arc::new(MetricsAggregator::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.slow_threshold,
        ));
        let scheduler = Arc::new(RetryScheduler::new(
            monitor.clone(),
            store,
            Arc::clone(&clock),
            config.retry_policy.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            monitor.clone(),
            Arc::clone(&metrics),
            Arc::clone(&scheduler),
            config.handler_timeout,
        ));

        Ok(Self {
            clock,
            config,
            monitor,
            metrics,
            scheduler,
            dispatcher,
            cancellation_token: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// Starts the scheduler loop and periodic sweeps.
    ///
    /// Returns immediately after spawning. Use `shutdown()` to stop
    /// gracefully.
    pub fn start(&mut self) -> Result<()> {
        if !self.tasks.is_empty() {
            return Err(DeliveryError::configuration("engine already started"));
        }

        info!(
            handler_timeout_ms = u64::try_from(self.config.handler_timeout.as_millis()).unwrap_or(u64::MAX),
            max_retries = self.config.retry_policy.max_retries,
            "starting webhook engine"
        );

        let redispatch: Arc<dyn Redispatch> = Arc::clone(&self.dispatcher) as Arc<dyn Redispatch>;
        let scheduler_task = tokio::spawn(
            Arc::clone(&self.scheduler).run(redispatch, self.cancellation_token.clone()),
        );
        self.tasks.push(("retry-scheduler", scheduler_task));

        let retention_task = self.spawn_retention_sweep();
        self.tasks.push(("retention-sweep", retention_task));

        let failed_task = self.spawn_failed_sweep();
        self.tasks.push(("failed-sweep", failed_task));

        info!(tasks = self.tasks.len(), "webhook engine started");
        Ok(())
    }

    fn spawn_retention_sweep(&self) -> JoinHandle<()> {
        let monitor = self.monitor.clone();
        let scheduler = Arc::clone(&self.scheduler);
        let clock = Arc::clone(&self.clock);
        let retention = self.config.retention;
        let period = self.config.retention_sweep_interval;
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let cutoff = retention_cutoff(clock.now(), retention);
                        if let Err(error) = purge_records(&monitor, &scheduler, cutoff).await {
                            error!(error = %error, "retention sweep failed");
                        }
                    },
                }
            }
        })
    }

    fn spawn_failed_sweep(&self) -> JoinHandle<()> {
        let scheduler = Arc::clone(&self.scheduler);
        let stagger = self.config.recovery_stagger;
        let period = self.config.failed_sweep_interval;
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let swept = scheduler.retry_all_failed(stagger, RetryScope::Stranded).await;
                        if let Err(error) = swept {
                            error!(error = %error, "failed-delivery sweep failed");
                        }
                    },
                }
            }
        })
    }

    /// Gracefully shuts down background tasks.
    ///
    /// Stops arming new retry attempts and waits for running ones to finish
    /// within the configured shutdown timeout.
    pub async fn shutdown(mut self) -> Result<()> {
        let timeout = self.config.shutdown_timeout;
        info!(tasks = self.tasks.len(), timeout_seconds = timeout.as_secs(), "shutting down webhook engine");

        self.cancellation_token.cancel();
        let tasks = std::mem::take(&mut self.tasks);

        let join_all = async {
            let mut failures = Vec::new();
            for (task, handle) in tasks {
                if let Err(join_error) = handle.await {
                    error!(task, error = %join_error, "background task failed during shutdown");
                    failures.push(DeliveryError::task_panic(task, join_error));
                }
            }
            failures
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(failures) => match failures.into_iter().next() {
                Some(failure) => Err(failure),
                None => {
                    info!("webhook engine shutdown completed");
                    Ok(())
                },
            },
            Err(_elapsed) => {
                error!(timeout_seconds = timeout.as_secs(), "webhook engine shutdown timed out");
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Registers a handler for every topic it claims.
    pub fn register(&self, handler: Arc<dyn WebhookHandler>) {
        self.dispatcher.register(handler);
    }

    /// Registers several handlers in order.
    pub fn register_all(&self, handlers: impl IntoIterator<Item = Arc<dyn WebhookHandler>>) {
        self.dispatcher.register_all(handlers);
    }

    /// Normalizes a verified inbound request using the engine's clock.
    pub fn ingest(
        &self,
        topic: &str,
        shop: &str,
        body: serde_json::Value,
        headers: BTreeMap<String, String>,
    ) -> std::result::Result<EventContext, IngestError> {
        EventContext::ingest(topic, shop, body, headers, self.clock.as_ref())
    }

    /// Dispatches a newly received event.
    pub async fn dispatch(&self, context: &EventContext) -> HandlerResult {
        self.dispatcher.dispatch(context).await
    }

    /// Re-arms retries checkpointed by a previous process.
    pub async fn recover(&self) -> Result<usize> {
        self.scheduler.recover().await
    }

    /// Re-arms every failed delivery with the configured stagger.
    ///
    /// Unlike the periodic sweep this also supersedes pending retries and
    /// revives deliveries whose retries were stopped.
    pub async fn retry_all_failed(&self) -> Result<usize> {
        self.scheduler.retry_all_failed(self.config.recovery_stagger, RetryScope::All).await
    }

    /// Deletes delivery records older than the retention window.
    pub async fn purge_expired(&self) -> Result<usize> {
        let cutoff = retention_cutoff(self.clock.now(), self.config.retention);
        purge_records(&self.monitor, &self.scheduler, cutoff).await
    }

    /// Clears every metric bucket.
    pub async fn reset_metrics(&self) -> Result<usize> {
        self.metrics.reset_all().await
    }

    /// Success percentage across all topics.
    pub async fn global_success_rate(&self) -> Result<f64> {
        self.metrics.global_success_rate().await
    }

    /// Health derived from the global success rate.
    ///
    /// Reports healthy before any traffic has been processed.
    pub async fn health(&self) -> Result<HealthStatus> {
        let global = self.metrics.global_metrics().await?;
        if global.count == 0 {
            return Ok(HealthStatus::Healthy);
        }
        Ok(HealthStatus::from_success_rate(global.success_rate()))
    }

    /// Full metrics report.
    pub async fn metrics_report(&self) -> Result<MetricsReport> {
        self.metrics.report().await
    }

    /// Delivery record bookkeeping.
    pub fn monitor(&self) -> &EventMonitor {
        &self.monitor
    }

    /// Metrics aggregation.
    pub fn metrics(&self) -> &MetricsAggregator {
        &self.metrics
    }

    /// Retry scheduling.
    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    /// Topic registry and dispatch.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

fn retention_cutoff(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|retention| now.checked_sub_signed(retention))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Purges expired records and drops any retry state still held for them.
async fn purge_records(
    monitor: &EventMonitor,
    scheduler: &RetryScheduler,
    cutoff: DateTime<Utc>,
) -> Result<usize> {
    let purged = monitor.purge_older_than(cutoff).await?;
    scheduler.forget(&purged).await;
    Ok(purged.len())
}

impl Drop for WebhookEngine {
    fn drop(&mut self) {
        let active = self.tasks.iter().filter(|(_, handle)| !handle.is_finished()).count();

        if active > 0 && !self.cancellation_token.is_cancelled() {
            warn!(
                active_tasks = active,
                "WebhookEngine dropped without shutdown, cancelling background tasks"
            );
            self.cancellation_token.cancel();
        }
    }
}
