//! Full engine wired against in-memory storage and a controllable clock.
//!
//! Retry timers run on tokio time, so tests using [`TestEnv::advance`] should
//! run with `#[tokio::test(start_paused = true)]`. Advancing moves the wall
//! clock and sleeps on tokio time, which lets due retries fire.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookline_core::{
    DeliveryRecord, EventContext, EventId, HandlerResult, KeyValueStore, MemoryStore,
    MerchantDirectory, NoMerchantDirectory, TestClock, WebhookHandler,
};
use hookline_delivery::{EngineConfig, WebhookEngine};

/// Engine under test plus the handles needed to drive it.
pub struct TestEnv {
    /// Backing store shared with the engine.
    pub store: Arc<dyn KeyValueStore>,
    /// Wall clock shared with the engine.
    pub clock: TestClock,
    /// Engine under test, started.
    pub engine: WebhookEngine,
}

impl TestEnv {
    /// Creates and starts an engine with default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(EngineConfig::default())
    }

    /// Creates and starts an engine with `config`.
    pub fn with_config(config: EngineConfig) -> Result<Self> {
        Self::build(Arc::new(MemoryStore::new()), Arc::new(NoMerchantDirectory), config)
    }

    /// Creates and starts an engine over `store` with a merchant directory.
    pub fn build(
        store: Arc<dyn KeyValueStore>,
        merchants: Arc<dyn MerchantDirectory>,
        config: EngineConfig,
    ) -> Result<Self> {
        let clock = TestClock::new();
        let mut engine =
            WebhookEngine::new(Arc::clone(&store), Arc::new(clock.clone()), merchants, config)
                .context("failed to build engine")?;
        engine.start().context("failed to start engine")?;

        Ok(Self { store, clock, engine })
    }

    /// Registers a handler.
    pub fn register(&self, handler: Arc<dyn WebhookHandler>) {
        self.engine.register(handler);
    }

    /// Dispatches an event through the engine.
    pub async fn dispatch(&self, context: &EventContext) -> HandlerResult {
        self.engine.dispatch(context).await
    }

    /// Moves wall and tokio time forward, letting due retries run.
    pub async fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
        tokio::time::sleep(duration).await;
    }

    /// Delivery record for an event.
    pub async fn record(&self, event_id: &EventId) -> Result<DeliveryRecord> {
        self.engine
            .monitor()
            .get(event_id)
            .await?
            .with_context(|| format!("no delivery record for {event_id}"))
    }

    /// Shuts the engine down.
    pub async fn shutdown(self) -> Result<()> {
        self.engine.shutdown().await.context("engine shutdown failed")
    }
}
