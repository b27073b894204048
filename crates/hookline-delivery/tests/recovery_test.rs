//! Retry checkpoints surviving an engine restart.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use bytes::Bytes;
use hookline_core::{KeyValueStore, MemoryStore, NoMerchantDirectory, Topic};
use hookline_delivery::{EngineConfig, RetryState};
use hookline_testing::{EventBuilder, Outcome, ScriptedHandler, TestEnv};

#[tokio::test(start_paused = true)]
async fn pending_retry_resumes_after_restart() -> Result<()> {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

    let before = TestEnv::build(Arc::clone(&store), Arc::new(NoMerchantDirectory), EngineConfig::default())?;
    before.register(Arc::new(
        ScriptedHandler::new([Topic::OrdersCreate]).otherwise(Outcome::error("database offline")),
    ));
    let context = EventBuilder::new(Topic::OrdersCreate).id("wh-restart").build();
    before.dispatch(&context).await;
    assert_eq!(before.engine.scheduler().pending_count(), 1);
    before.shutdown().await?;

    let after = TestEnv::build(Arc::clone(&store), Arc::new(NoMerchantDirectory), EngineConfig::default())?;
    let handler = Arc::new(ScriptedHandler::new([Topic::OrdersCreate]));
    after.register(handler.clone());

    assert_eq!(after.engine.recover().await?, 1);
    assert_eq!(after.engine.scheduler().retry_state(context.event_id()), RetryState::Scheduled);

    after.advance(Duration::from_secs(61)).await;

    assert_eq!(handler.seen(), vec![context.event_id().clone()]);
    let record = after.record(context.event_id()).await?;
    assert!(record.success);
    assert_eq!(record.retry_count, 1);
    assert!(store.scan_prefix("retry/").await?.is_empty());

    after.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn overdue_checkpoint_fires_immediately() -> Result<()> {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

    let before = TestEnv::build(Arc::clone(&store), Arc::new(NoMerchantDirectory), EngineConfig::default())?;
    before.register(Arc::new(
        ScriptedHandler::new([Topic::ProductsDelete]).otherwise(Outcome::Reject("busy".into())),
    ));
    let context = EventBuilder::new(Topic::ProductsDelete).build();
    before.dispatch(&context).await;
    before.shutdown().await?;

    let after = TestEnv::build(Arc::clone(&store), Arc::new(NoMerchantDirectory), EngineConfig::default())?;
    let handler = Arc::new(ScriptedHandler::new([Topic::ProductsDelete]));
    after.register(handler.clone());
    after.clock.advance(Duration::from_secs(10 * 60));

    assert_eq!(after.engine.recover().await?, 1);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(handler.calls(), 1);
    assert!(after.record(context.event_id()).await?.success);

    after.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn failed_sweep_rearms_deliveries_that_lost_their_checkpoint() -> Result<()> {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

    let before = TestEnv::build(Arc::clone(&store), Arc::new(NoMerchantDirectory), EngineConfig::default())?;
    before.register(Arc::new(
        ScriptedHandler::new([Topic::CheckoutsCreate]).otherwise(Outcome::error("cart service down")),
    ));
    let context = EventBuilder::new(Topic::CheckoutsCreate).build();
    before.dispatch(&context).await;
    before.shutdown().await?;
    assert!(store.delete(&format!("retry/{}", context.event_id())).await?);

    let after = TestEnv::build(Arc::clone(&store), Arc::new(NoMerchantDirectory), EngineConfig::default())?;
    let handler = Arc::new(ScriptedHandler::new([Topic::CheckoutsCreate]));
    after.register(handler.clone());
    assert_eq!(after.engine.recover().await?, 0);

    // First sweep at one hour, then a stagger of 60s * (retry_count + 1).
    after.advance(Duration::from_secs(3600 + 61)).await;

    assert_eq!(handler.calls(), 1);
    let record = after.record(context.event_id()).await?;
    assert!(record.success);
    assert_eq!(record.retry_count, 1);

    after.shutdown().await
}

#[tokio::test]
async fn unreadable_checkpoints_are_dropped() -> Result<()> {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    store.put("retry/garbage", Bytes::from_static(b"not json")).await?;

    let env = TestEnv::build(Arc::clone(&store), Arc::new(NoMerchantDirectory), EngineConfig::default())?;

    assert_eq!(env.engine.recover().await?, 0);
    assert!(store.get("retry/garbage").await?.is_none());

    env.shutdown().await
}

#[tokio::test]
async fn recover_with_nothing_checkpointed_is_a_no_op() -> Result<()> {
    let env = TestEnv::new()?;
    assert_eq!(env.engine.recover().await?, 0);
    assert_eq!(env.engine.scheduler().pending_count(), 0);
    env.shutdown().await
}
