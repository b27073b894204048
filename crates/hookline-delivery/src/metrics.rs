//! Processing metrics aggregated globally, per topic and per shop and topic.
//!
//! Every completed attempt, first or retry, updates three buckets:
//! `metrics/global`, `metrics/topic/<topic>` and `metrics/shop/<shop>/<topic>`.
//! Each bucket update is a per-key atomic read-modify-write. A gate lock,
//! held shared by writers and exclusively by [`MetricsAggregator::reset_all`],
//! makes a reset atomic with respect to concurrent recording.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use hookline_core::{store, Clock, KeyValueStore, ShopDomain, Topic};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::Result;

const METRICS_PREFIX: &str = "metrics/";
const GLOBAL_KEY: &str = "metrics/global";
const TOPIC_PREFIX: &str = "metrics/topic/";

fn topic_key(topic: Topic) -> String {
    format!("{TOPIC_PREFIX}{topic}")
}

fn shop_key(shop: &ShopDomain, topic: Topic) -> String {
    format!("{METRICS_PREFIX}shop/{shop}/{topic}")
}

/// Counters for one aggregation scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricBucket {
    /// Completed attempts.
    pub count: u64,
    /// Sum of processing times in milliseconds.
    pub total_processing_ms: u64,
    /// Successful attempts.
    pub success_count: u64,
    /// Failed attempts.
    pub failure_count: u64,
    /// When the latest attempt completed.
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl MetricBucket {
    fn observe(&mut self, processing_ms: u64, success: bool, at: DateTime<Utc>) {
        self.count = self.count.saturating_add(1);
        self.total_processing_ms = self.total_processing_ms.saturating_add(processing_ms);
        if success {
            self.success_count = self.success_count.saturating_add(1);
        } else {
            self.failure_count = self.failure_count.saturating_add(1);
        }
        self.last_processed_at = Some(at);
    }

    /// Mean processing time in milliseconds, zero when empty.
    #[allow(clippy::cast_precision_loss)]
    pub fn average_processing_ms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total_processing_ms as f64 / self.count as f64
    }

    /// Percentage of successful attempts, zero when empty.
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.count as f64 * 100.0
    }
}

/// Health classification derived from the global success rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Success rate above 95%.
    Healthy,
    /// Success rate above 80%.
    Warning,
    /// Anything lower.
    Critical,
}

impl HealthStatus {
    /// Classifies a success percentage.
    pub fn from_success_rate(rate: f64) -> Self {
        if rate > 95.0 {
            Self::Healthy
        } else if rate > 80.0 {
            Self::Warning
        } else {
            Self::Critical
        }
    }
}

/// Global section of the metrics report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSummary {
    /// Completed attempts.
    pub total_count: u64,
    /// Mean processing time in milliseconds.
    pub average_processing_time_ms: f64,
    /// Percentage of successful attempts.
    pub success_rate: f64,
    /// Failed attempts.
    pub failures: u64,
}

/// Per-topic section of the metrics report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSummary {
    /// Completed attempts.
    pub count: u64,
    /// Mean processing time in milliseconds.
    pub average_processing_time_ms: f64,
    /// Percentage of successful attempts.
    pub success_rate: f64,
    /// Failed attempts.
    pub failures: u64,
    /// When the latest attempt completed.
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl From<&MetricBucket> for TopicSummary {
    fn from(bucket: &MetricBucket) -> Self {
        Self {
            count: bucket.count,
            average_processing_time_ms: bucket.average_processing_ms(),
            success_rate: bucket.success_rate(),
            failures: bucket.failure_count,
            last_processed_at: bucket.last_processed_at,
        }
    }
}

/// Read-only report for operator-facing consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    /// Totals across all topics.
    pub global: GlobalSummary,
    /// Totals per topic tag.
    pub by_topic: BTreeMap<String, TopicSummary>,
    /// When the report was built.
    pub generated_at: DateTime<Utc>,
}

/// Aggregates processing outcomes into metric buckets.
#[derive(Debug)]
pub struct MetricsAggregator {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    slow_threshold: Duration,
    gate: RwLock<()>,
}

impl MetricsAggregator {
    /// Creates an aggregator that warns about attempts slower than `slow_threshold`.
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, slow_threshold: Duration) -> Self {
        Self { store, clock, slow_threshold, gate: RwLock::new(()) }
    }

    /// Records one completed attempt in the global, topic and shop buckets.
    pub async fn record(
        &self,
        topic: Topic,
        shop: &ShopDomain,
        processing_time: Duration,
        success: bool,
    ) -> Result<()> {
        let processing_ms = u64::try_from(processing_time.as_millis()).unwrap_or(u64::MAX);
        if processing_time > self.slow_threshold {
            warn!(
                topic = %topic,
                shop = %shop,
                processing_ms,
                threshold_ms = u64::try_from(self.slow_threshold.as_millis()).unwrap_or(u64::MAX),
                "slow webhook processing"
            );
        }

        let _gate = self.gate.read().await;
        let now = self.clock.now();

        for key in [GLOBAL_KEY.to_string(), topic_key(topic), shop_key(shop, topic)] {
            store::modify(self.store.as_ref(), &key, move |bucket: Option<MetricBucket>| {
                let mut bucket = bucket.unwrap_or_default();
                bucket.observe(processing_ms, success, now);
                Some(bucket)
            })
            .await?;
        }

        Ok(())
    }

    async fn bucket(&self, key: &str) -> Result<MetricBucket> {
        Ok(store::load(self.store.as_ref(), key).await?.unwrap_or_default())
    }

    /// Bucket for one topic, empty if never recorded.
    pub async fn topic_metrics(&self, topic: Topic) -> Result<MetricBucket> {
        self.bucket(&topic_key(topic)).await
    }

    /// Bucket for one shop and topic, empty if never recorded.
    pub async fn shop_metrics(&self, shop: &ShopDomain, topic: Topic) -> Result<MetricBucket> {
        self.bucket(&shop_key(shop, topic)).await
    }

    /// Bucket across all topics.
    pub async fn global_metrics(&self) -> Result<MetricBucket> {
        self.bucket(GLOBAL_KEY).await
    }

    /// Mean processing time for a topic in milliseconds.
    pub async fn average_processing_time(&self, topic: Topic) -> Result<f64> {
        Ok(self.topic_metrics(topic).await?.average_processing_ms())
    }

    /// Success percentage for a topic.
    pub async fn success_rate(&self, topic: Topic) -> Result<f64> {
        Ok(self.topic_metrics(topic).await?.success_rate())
    }

    /// Success percentage across all topics.
    pub async fn global_success_rate(&self) -> Result<f64> {
        Ok(self.global_metrics().await?.success_rate())
    }

    /// Builds the full report.
    pub async fn report(&self) -> Result<MetricsReport> {
        let _gate = self.gate.read().await;

        let global = self.global_metrics().await?;
        let by_topic = store::scan::<MetricBucket>(self.store.as_ref(), TOPIC_PREFIX)
            .await?
            .into_iter()
            .map(|(key, bucket)| {
                let topic = key.trim_start_matches(TOPIC_PREFIX).to_string();
                (topic, TopicSummary::from(&bucket))
            })
            .collect();

        Ok(MetricsReport {
            global: GlobalSummary {
                total_count: global.count,
                average_processing_time_ms: global.average_processing_ms(),
                success_rate: global.success_rate(),
                failures: global.failure_count,
            },
            by_topic,
            generated_at: self.clock.now(),
        })
    }

    /// Clears every bucket. Returns how many buckets were removed.
    pub async fn reset_all(&self) -> Result<usize> {
        let _gate = self.gate.write().await;

        let mut cleared = 0;
        for (key, _) in self.store.scan_prefix(METRICS_PREFIX).await? {
            if self.store.delete(&key).await? {
                cleared += 1;
            }
        }

        info!(cleared, "reset all metric buckets");
        Ok(cleared)
    }
}
