//! End-to-end tests for the webhook engine.
//!
//! Every test runs on paused tokio time so retry timers fire exactly when
//! the test advances the clock.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::Result;
use hookline_core::{Clock, HandlerError, IngestError, Topic};
use hookline_delivery::{EngineConfig, HealthStatus, RetryPolicy, RetryState};
use hookline_testing::{sample_payload, EventBuilder, Outcome, ScriptedHandler, TestEnv, TEST_SHOP};

#[tokio::test(start_paused = true)]
async fn failed_delivery_recovers_on_first_retry() -> Result<()> {
    let env = TestEnv::new()?;
    let handler = Arc::new(
        ScriptedHandler::new([Topic::OrdersCreate])
            .then(Outcome::error("inventory service unavailable")),
    );
    env.register(handler.clone());

    let context = EventBuilder::new(Topic::OrdersCreate).id("wh-1").build();
    let result = env.dispatch(&context).await;

    assert!(!result.is_success());
    assert!(matches!(result.error(), Some(HandlerError::Failed { .. })));

    let record = env.record(context.event_id()).await?;
    assert!(!record.success);
    assert_eq!(record.retry_count, 0);
    assert_eq!(
        record.error_message.as_deref(),
        Some("handler failed: inventory service unavailable")
    );
    assert_eq!(env.engine.scheduler().retry_state(context.event_id()), RetryState::Scheduled);

    env.advance(Duration::from_secs(61)).await;

    let record = env.record(context.event_id()).await?;
    assert!(record.success);
    assert_eq!(record.retry_count, 1);
    assert!(record.last_retry_at.is_some());
    assert!(record.error_message.is_none());
    assert_eq!(handler.calls(), 2);

    let metrics = env.engine.metrics().topic_metrics(Topic::OrdersCreate).await?;
    assert_eq!(metrics.count, 2);
    assert_eq!(metrics.success_count, 1);
    assert_eq!(metrics.failure_count, 1);
    assert_eq!(env.engine.scheduler().retry_state(context.event_id()), RetryState::Idle);

    env.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn retries_stop_after_max_attempts() -> Result<()> {
    let env = TestEnv::new()?;
    let handler = Arc::new(
        ScriptedHandler::new([Topic::ProductsUpdate]).otherwise(Outcome::error("still down")),
    );
    env.register(handler.clone());

    let context = EventBuilder::new(Topic::ProductsUpdate).build();
    env.dispatch(&context).await;

    for delay_secs in [60, 120, 240, 480, 960] {
        env.advance(Duration::from_secs(delay_secs + 1)).await;
    }

    assert_eq!(handler.calls(), 6);
    assert_eq!(env.engine.scheduler().retry_state(context.event_id()), RetryState::Exhausted);
    assert_eq!(env.engine.scheduler().pending_count(), 0);

    let record = env.record(context.event_id()).await?;
    assert!(!record.success);
    assert_eq!(record.retry_count, 5);
    assert_eq!(record.error_message.as_deref(), Some("handler failed: still down"));

    env.advance(Duration::from_secs(1000)).await;
    assert_eq!(handler.calls(), 6);

    let global = env.engine.metrics().global_metrics().await?;
    assert_eq!(global.count, 6);
    assert_eq!(global.failure_count, 6);

    env.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn missing_handler_is_recorded_without_retry() -> Result<()> {
    let env = TestEnv::new()?;

    let context = EventBuilder::new(Topic::CustomersCreate).build();
    let result = env.dispatch(&context).await;

    assert!(matches!(result.error(), Some(HandlerError::NoHandler { .. })));
    assert!(!result.is_retryable());
    assert_eq!(env.engine.scheduler().retry_state(context.event_id()), RetryState::Idle);

    let record = env.record(context.event_id()).await?;
    assert!(record.is_failed());
    assert_eq!(record.error_message.as_deref(), Some("no handler for topic customers/create"));

    assert!(record.retries_stopped);

    // Crosses three hourly failed-delivery sweeps.
    env.advance(Duration::from_secs(3 * 3600 + 1)).await;
    let record = env.record(context.event_id()).await?;
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.last_retry_at, None);
    assert_eq!(env.engine.scheduler().retry_state(context.event_id()), RetryState::Idle);
    assert_eq!(env.engine.metrics().global_metrics().await?.count, 0);

    env.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn rejected_result_is_retried() -> Result<()> {
    let env = TestEnv::new()?;
    let handler = Arc::new(
        ScriptedHandler::new([Topic::InventoryLevelsUpdate])
            .then(Outcome::Reject("sku locked".into())),
    );
    env.register(handler.clone());

    let context = EventBuilder::new(Topic::InventoryLevelsUpdate).build();
    assert!(env.dispatch(&context).await.is_retryable());

    env.advance(Duration::from_secs(61)).await;

    assert_eq!(handler.calls(), 2);
    assert!(env.record(context.event_id()).await?.success);

    env.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn panicking_handler_is_contained() -> Result<()> {
    let env = TestEnv::new()?;
    let handler = Arc::new(
        ScriptedHandler::new([Topic::OrdersPaid]).then(Outcome::Panic("index out of bounds".into())),
    );
    env.register(handler.clone());

    let context = EventBuilder::new(Topic::OrdersPaid).build();
    let result = env.dispatch(&context).await;

    match result.error() {
        Some(HandlerError::Panicked { message }) => assert_eq!(message, "index out of bounds"),
        other => panic!("expected panicked error, got {other:?}"),
    }

    env.advance(Duration::from_secs(61)).await;
    assert!(env.record(context.event_id()).await?.success);

    env.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn slow_handler_times_out() -> Result<()> {
    let config = EngineConfig { handler_timeout: Duration::from_secs(5), ..EngineConfig::default() };
    let env = TestEnv::with_config(config)?;
    let handler = Arc::new(
        ScriptedHandler::new([Topic::FulfillmentsCreate])
            .then(Outcome::Sleep(Duration::from_secs(60))),
    );
    env.register(handler.clone());

    let context = EventBuilder::new(Topic::FulfillmentsCreate).build();
    let result = env.dispatch(&context).await;

    assert!(matches!(result.error(), Some(HandlerError::TimedOut { timeout_ms: 5000 })));
    assert!(result.is_retryable());
    assert_eq!(env.engine.scheduler().retry_state(context.event_id()), RetryState::Scheduled);

    env.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn retry_all_failed_rearms_unhandled_events() -> Result<()> {
    let env = TestEnv::new()?;

    let first = EventBuilder::new(Topic::RefundsCreate).build();
    let second = EventBuilder::new(Topic::RefundsCreate).build();
    env.dispatch(&first).await;
    env.dispatch(&second).await;

    let handler = Arc::new(ScriptedHandler::new([Topic::RefundsCreate]));
    env.register(handler.clone());

    assert_eq!(env.engine.retry_all_failed().await?, 2);
    assert_eq!(env.engine.scheduler().pending_count(), 2);

    env.advance(Duration::from_secs(61)).await;

    assert_eq!(handler.calls(), 2);
    for context in [&first, &second] {
        let record = env.record(context.event_id()).await?;
        assert!(record.success);
        assert_eq!(record.retry_count, 1);
    }
    assert!(env.engine.monitor().failed().await?.is_empty());

    env.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn redelivered_event_keeps_single_record() -> Result<()> {
    let env = TestEnv::new()?;
    let handler = Arc::new(ScriptedHandler::new([Topic::ProductsCreate]));
    env.register(handler.clone());

    let context = EventBuilder::new(Topic::ProductsCreate).id("wh-dup").build();
    env.dispatch(&context).await;
    env.dispatch(&context).await;

    assert_eq!(handler.calls(), 2);
    assert_eq!(env.engine.monitor().all().await?.len(), 1);
    assert_eq!(env.engine.metrics().topic_metrics(Topic::ProductsCreate).await?.count, 2);

    env.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn concurrent_dispatches_are_all_counted() -> Result<()> {
    let env = TestEnv::new()?;
    let handler = Arc::new(ScriptedHandler::new([Topic::OrdersUpdated]));
    env.register(handler.clone());

    let contexts: Vec<_> = (0..25).map(|_| EventBuilder::new(Topic::OrdersUpdated).build()).collect();
    let results = futures::future::join_all(contexts.iter().map(|context| env.dispatch(context))).await;

    assert!(results.iter().all(|result| result.is_success()));
    assert_eq!(handler.calls(), 25);

    let metrics = env.engine.metrics().topic_metrics(Topic::OrdersUpdated).await?;
    assert_eq!(metrics.count, 25);
    assert_eq!(metrics.success_count, 25);
    assert_eq!(env.engine.monitor().stats().await?.succeeded, 25);

    env.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn health_follows_success_rate() -> Result<()> {
    let env = TestEnv::new()?;
    assert_eq!(env.engine.health().await?, HealthStatus::Healthy);

    let handler = Arc::new(
        ScriptedHandler::new([Topic::CustomersUpdate])
            .then(Outcome::Reject("a".into()))
            .then(Outcome::Reject("b".into()))
            .then(Outcome::Reject("c".into())),
    );
    env.register(handler);

    for _ in 0..10 {
        env.dispatch(&EventBuilder::new(Topic::CustomersUpdate).build()).await;
    }

    assert!((env.engine.global_success_rate().await? - 70.0).abs() < f64::EPSILON);
    assert_eq!(env.engine.health().await?, HealthStatus::Critical);

    assert_eq!(env.engine.reset_metrics().await?, 3);
    assert_eq!(env.engine.health().await?, HealthStatus::Healthy);

    env.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn purge_removes_records_past_retention() -> Result<()> {
    let env = TestEnv::new()?;
    env.register(Arc::new(ScriptedHandler::new([Topic::ShopUpdate])));

    let old = EventBuilder::new(Topic::ShopUpdate).received_at(env.clock.now()).build();
    env.dispatch(&old).await;

    env.clock.advance(Duration::from_secs(31 * 24 * 60 * 60));
    let fresh = EventBuilder::new(Topic::ShopUpdate).received_at(env.clock.now()).build();
    env.dispatch(&fresh).await;

    assert_eq!(env.engine.purge_expired().await?, 1);
    assert!(env.engine.monitor().get(old.event_id()).await?.is_none());
    assert!(env.engine.monitor().get(fresh.event_id()).await?.is_some());

    env.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn purge_forgets_exhausted_state() -> Result<()> {
    let env = TestEnv::new()?;

    let context = EventBuilder::new(Topic::CustomersCreate).received_at(env.clock.now()).build();
    env.dispatch(&context).await;
    assert_eq!(env.engine.retry_all_failed().await?, 1);
    env.advance(Duration::from_secs(61)).await;
    assert_eq!(env.engine.scheduler().retry_state(context.event_id()), RetryState::Exhausted);

    env.clock.advance(Duration::from_secs(31 * 24 * 60 * 60));
    assert_eq!(env.engine.purge_expired().await?, 1);

    assert!(env.engine.monitor().get(context.event_id()).await?.is_none());
    assert_eq!(env.engine.scheduler().retry_state(context.event_id()), RetryState::Idle);

    env.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn failed_sweep_leaves_exhausted_deliveries_to_operator() -> Result<()> {
    let config = EngineConfig {
        retry_policy: RetryPolicy { max_retries: 1, ..RetryPolicy::default() },
        ..EngineConfig::default()
    };
    let env = TestEnv::with_config(config)?;
    let handler = Arc::new(
        ScriptedHandler::new([Topic::OrdersCancelled])
            .then(Outcome::error("first"))
            .then(Outcome::error("second")),
    );
    env.register(handler.clone());

    let context = EventBuilder::new(Topic::OrdersCancelled).build();
    env.dispatch(&context).await;
    env.advance(Duration::from_secs(61)).await;
    assert_eq!(env.engine.scheduler().retry_state(context.event_id()), RetryState::Exhausted);

    env.advance(Duration::from_secs(3600)).await;

    assert_eq!(handler.calls(), 2);
    assert_eq!(env.engine.scheduler().retry_state(context.event_id()), RetryState::Exhausted);
    let record = env.record(context.event_id()).await?;
    assert!(record.retries_stopped);
    assert_eq!(record.retry_count, 1);

    // An operator request revives it with a stagger of 60s * (retry_count + 1).
    assert_eq!(env.engine.retry_all_failed().await?, 1);
    env.advance(Duration::from_secs(121)).await;

    assert_eq!(handler.calls(), 3);
    let record = env.record(context.event_id()).await?;
    assert!(record.success);
    assert_eq!(record.retry_count, 2);

    env.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn failed_sweep_keeps_pending_backoff() -> Result<()> {
    let config = EngineConfig {
        retry_policy: RetryPolicy {
            initial_delay: Duration::from_secs(3000),
            max_delay: Duration::from_secs(10_000),
            ..RetryPolicy::default()
        },
        ..EngineConfig::default()
    };
    let env = TestEnv::with_config(config)?;
    let handler = Arc::new(
        ScriptedHandler::new([Topic::OrdersUpdated]).otherwise(Outcome::error("ledger locked")),
    );
    env.register(handler.clone());

    let context = EventBuilder::new(Topic::OrdersUpdated).build();
    env.dispatch(&context).await;
    env.advance(Duration::from_secs(3001)).await;
    assert_eq!(handler.calls(), 2);

    // The sweep at 3600s must not pull the 6000s backoff forward.
    env.advance(Duration::from_secs(799)).await;
    assert_eq!(handler.calls(), 2);
    assert_eq!(env.engine.scheduler().retry_state(context.event_id()), RetryState::Scheduled);

    env.advance(Duration::from_secs(5201)).await;
    assert_eq!(handler.calls(), 3);
    assert_eq!(env.record(context.event_id()).await?.retry_count, 2);

    env.shutdown().await
}

#[tokio::test]
async fn ingest_normalizes_requests() -> Result<()> {
    let env = TestEnv::new()?;
    let headers = BTreeMap::from([("x-shopify-webhook-id".to_string(), "wh-9".to_string())]);

    let context =
        env.engine.ingest("orders/paid", TEST_SHOP, sample_payload(Topic::OrdersPaid), headers)?;
    assert_eq!(context.topic(), Topic::OrdersPaid);
    assert_eq!(context.shop().as_str(), TEST_SHOP);
    assert_eq!(context.received_at(), env.clock.now());

    let unknown = env.engine.ingest("orders/teleported", TEST_SHOP, sample_payload(Topic::OrdersPaid), BTreeMap::new());
    assert!(matches!(unknown, Err(IngestError::UnknownTopic(_))));

    let bad_shop = env.engine.ingest("orders/paid", "", sample_payload(Topic::OrdersPaid), BTreeMap::new());
    assert!(matches!(bad_shop, Err(IngestError::InvalidShop { .. })));

    env.shutdown().await
}
