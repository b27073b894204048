//! Topic registry and dispatch coordinator.
//!
//! The dispatcher maps topics to handlers, runs each attempt under a bounded
//! timeout with panic containment, and feeds the outcome to the monitor,
//! the metrics aggregator and, on failure, the retry scheduler. It owns no
//! delivery state of its own.

use std::{
    any::Any,
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use futures::FutureExt;
use hookline_core::{EventContext, HandlerError, HandlerResult, Topic, WebhookHandler};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    metrics::MetricsAggregator,
    monitor::EventMonitor,
    scheduler::{Redispatch, RetryScheduler, ScheduleOutcome},
};

/// Routes events to their registered handler.
#[derive(Debug)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<Topic, Arc<dyn WebhookHandler>>>,
    monitor: EventMonitor,
    metrics: Arc<MetricsAggregator>,
    scheduler: Arc<RetryScheduler>,
    handler_timeout: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher with no handlers registered.
    pub fn new(
        monitor: EventMonitor,
        metrics: Arc<MetricsAggregator>,
        scheduler: Arc<RetryScheduler>,
        handler_timeout: Duration,
    ) -> Self {
        Self { handlers: RwLock::new(HashMap::new()), monitor, metrics, scheduler, handler_timeout }
    }

    /// Registers a handler for every topic it claims.
    ///
    /// A topic that already has a handler is taken over by the new one; the
    /// replacement is logged at warn level.
    pub fn register(&self, handler: Arc<dyn WebhookHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);

        for &topic in handler.topics() {
            if let Some(previous) = handlers.insert(topic, Arc::clone(&handler)) {
                warn!(
                    topic = %topic,
                    previous = previous.name(),
                    replacement = handler.name(),
                    "topic already had a handler, replacing it"
                );
            }
        }

        info!(handler = handler.name(), topics = handler.topics().len(), "registered webhook handler");
    }

    /// Registers several handlers in order.
    pub fn register_all(&self, handlers: impl IntoIterator<Item = Arc<dyn WebhookHandler>>) {
        for handler in handlers {
            self.register(handler);
        }
    }

    /// Topics that currently have a handler, in topic order.
    pub fn registered_topics(&self) -> Vec<Topic> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut topics: Vec<Topic> = handlers.keys().copied().collect();
        topics.sort_unstable();
        topics
    }

    /// Handler registered for `topic`, if any.
    pub fn handler_for(&self, topic: Topic) -> Option<Arc<dyn WebhookHandler>> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).get(&topic).cloned()
    }

    /// Processes a newly received event.
    ///
    /// Always returns a result: handler errors, panics and timeouts become a
    /// failed result, and bookkeeping failures are logged without stopping
    /// the remaining steps. A failed attempt is handed to the retry
    /// scheduler unless no handler exists for the topic.
    pub async fn dispatch(&self, context: &EventContext) -> HandlerResult {
        let event_id = context.event_id();

        if let Err(error) = self.monitor.record_receipt(context).await {
            error!(event_id = %event_id, error = %error, "failed to record webhook receipt");
        }

        let Some(handler) = self.handler_for(context.topic()) else {
            warn!(
                event_id = %event_id,
                topic = %context.topic(),
                shop = %context.shop(),
                "no handler registered for topic"
            );
            let result = HandlerResult::no_handler(context.topic());
            if let Err(error) = self.monitor.record_result(event_id, &result).await {
                error!(event_id = %event_id, error = %error, "failed to record webhook result");
            }
            return result;
        };

        let result = self.attempt(handler.as_ref(), context).await;

        if let Err(error) = self.monitor.record_result(event_id, &result).await {
            error!(event_id = %event_id, error = %error, "failed to record webhook result");
        }

        if result.is_retryable() {
            let retry_count = self.monitor.retry_count(event_id).await.unwrap_or_else(|error| {
                error!(event_id = %event_id, error = %error, "failed to read retry count");
                0
            });

            if let ScheduleOutcome::InFlight =
                self.scheduler.schedule_retry(context, retry_count, None).await
            {
                debug!(event_id = %event_id, "retry already executing, not rescheduled");
            }
        }

        result
    }

    /// Runs one timed, contained handler call and records its metrics.
    async fn attempt(&self, handler: &dyn WebhookHandler, context: &EventContext) -> HandlerResult {
        let started = Instant::now();
        let result = self.invoke(handler, context).await;
        let elapsed = started.elapsed();

        if let Err(error) =
            self.metrics.record(context.topic(), context.shop(), elapsed, result.is_success()).await
        {
            error!(event_id = %context.event_id(), error = %error, "failed to record metrics");
        }

        if result.is_success() {
            debug!(
                event_id = %context.event_id(),
                topic = %context.topic(),
                handler = handler.name(),
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                "webhook processed"
            );
        } else {
            warn!(
                event_id = %context.event_id(),
                topic = %context.topic(),
                shop = %context.shop(),
                handler = handler.name(),
                error = result.error_message().as_deref().unwrap_or_default(),
                "webhook processing failed"
            );
        }

        result
    }

    async fn invoke(&self, handler: &dyn WebhookHandler, context: &EventContext) -> HandlerResult {
        let call = AssertUnwindSafe(handler.process(context)).catch_unwind();

        let error = match tokio::time::timeout(self.handler_timeout, call).await {
            Ok(Ok(Ok(result))) => return result,
            Ok(Ok(Err(error))) => HandlerError::failed(format!("{error:#}")),
            Ok(Err(panic)) => HandlerError::panicked(panic_message(panic.as_ref())),
            Err(_elapsed) => HandlerError::TimedOut {
                timeout_ms: u64::try_from(self.handler_timeout.as_millis()).unwrap_or(u64::MAX),
            },
        };

        HandlerResult::failed_with(error.to_string(), error)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[async_trait]
impl Redispatch for Dispatcher {
    async fn redispatch(&self, context: &EventContext) -> HandlerResult {
        match self.handler_for(context.topic()) {
            Some(handler) => self.attempt(handler.as_ref(), context).await,
            None => HandlerResult::no_handler(context.topic()),
        }
    }
}
