//! Delivery record bookkeeping.
//!
//! The monitor exclusively owns one [`DeliveryRecord`] per inbound event,
//! stored under `delivery/<event-id>`. Every mutation goes through the
//! store's per-key atomic update, so concurrent dispatches, retries and
//! sweeps never lose each other's writes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hookline_core::{
    store, Clock, DeliveryRecord, EventContext, EventId, HandlerResult, KeyValueStore,
    MerchantDirectory, MerchantId, ShopDomain,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{DeliveryError, Result};

const RECORD_PREFIX: &str = "delivery/";

fn record_key(event_id: &EventId) -> String {
    format!("{RECORD_PREFIX}{event_id}")
}

/// Counts over all delivery records currently retained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStats {
    /// Records retained.
    pub total: usize,
    /// Records whose latest attempt succeeded.
    pub succeeded: usize,
    /// Records whose latest attempt failed.
    pub failed: usize,
    /// Records still awaiting their first outcome.
    pub pending: usize,
    /// Records retried at least once.
    pub retried: usize,
}

/// Keyed store of delivery records and their lifecycle.
#[derive(Debug, Clone)]
pub struct EventMonitor {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    merchants: Arc<dyn MerchantDirectory>,
}

impl EventMonitor {
    /// Creates a monitor over the given store.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        merchants: Arc<dyn MerchantDirectory>,
    ) -> Self {
        Self { store, clock, merchants }
    }

    /// Creates the record for a freshly received event.
    ///
    /// The record starts with `success = false` pending its first outcome.
    /// Receiving an id that already has a record keeps the existing record
    /// so its retry count never moves backwards.
    pub async fn record_receipt(&self, context: &EventContext) -> Result<DeliveryRecord> {
        let merchant = self.merchants.merchant_for(context.shop()).await;
        let fresh = DeliveryRecord::received(context.clone(), merchant);

        let record = store::modify(self.store.as_ref(), &record_key(context.event_id()), move |current| {
            Some(current.unwrap_or(fresh))
        })
        .await?
        .ok_or_else(|| DeliveryError::record_not_found(context.event_id()))?;

        debug!(
            event_id = %record.event_id,
            topic = %record.topic,
            shop = %record.shop,
            merchant_id = ?record.merchant_id,
            "recorded webhook receipt"
        );

        Ok(record)
    }

    /// Stamps the outcome of the first processing attempt.
    pub async fn record_result(
        &self,
        event_id: &EventId,
        result: &HandlerResult,
    ) -> Result<DeliveryRecord> {
        let now = self.clock.now();
        let success = result.is_success();
        let retries_stopped = !success && !result.is_retryable();
        let error_message = result.error_message();

        self.update_existing(event_id, move |record| {
            record.processed_at = Some(now);
            record.success = success;
            record.error_message = error_message;
            record.retries_stopped = retries_stopped;
        })
        .await
    }

    /// Records the outcome of one retry attempt.
    ///
    /// Increments the retry count, stamps `last_retry_at` and overwrites the
    /// success flag and error message with the retry's outcome. Clears
    /// `retries_stopped`; the scheduler sets it again if it gives up.
    pub async fn record_retry_attempt(
        &self,
        event_id: &EventId,
        success: bool,
        error_message: Option<String>,
    ) -> Result<DeliveryRecord> {
        let now = self.clock.now();

        let record = self
            .update_existing(event_id, move |record| {
                record.retry_count = record.retry_count.saturating_add(1);
                record.last_retry_at = Some(now);
                record.processed_at.get_or_insert(now);
                record.success = success;
                record.error_message = if success { None } else { error_message };
                record.retries_stopped = false;
            })
            .await?;

        debug!(
            event_id = %event_id,
            retry_count = record.retry_count,
            success,
            "recorded retry attempt"
        );

        Ok(record)
    }

    /// Marks the latest failure as one that will not be retried automatically.
    pub async fn mark_retries_stopped(&self, event_id: &EventId) -> Result<DeliveryRecord> {
        self.update_existing(event_id, |record| record.retries_stopped = true).await
    }

    async fn update_existing<F>(&self, event_id: &EventId, apply: F) -> Result<DeliveryRecord>
    where
        F: FnOnce(&mut DeliveryRecord) + Send + 'static,
    {
        store::modify(self.store.as_ref(), &record_key(event_id), move |current: Option<DeliveryRecord>| {
            current.map(|mut record| {
                apply(&mut record);
                record
            })
        })
        .await?
        .ok_or_else(|| DeliveryError::record_not_found(event_id))
    }

    /// Current retry count for an event, zero when unknown.
    pub async fn retry_count(&self, event_id: &EventId) -> Result<u32> {
        Ok(self.get(event_id).await?.map_or(0, |record| record.retry_count))
    }

    /// Fetches a record by event id.
    pub async fn get(&self, event_id: &EventId) -> Result<Option<DeliveryRecord>> {
        Ok(store::load(self.store.as_ref(), &record_key(event_id)).await?)
    }

    /// Lists every retained record.
    pub async fn all(&self) -> Result<Vec<DeliveryRecord>> {
        let records = store::scan::<DeliveryRecord>(self.store.as_ref(), RECORD_PREFIX).await?;
        Ok(records.into_iter().map(|(_, record)| record).collect())
    }

    async fn filtered(&self, keep: impl Fn(&DeliveryRecord) -> bool) -> Result<Vec<DeliveryRecord>> {
        let mut records = self.all().await?;
        records.retain(|record| keep(record));
        records.sort_by_key(|record| record.received_at);
        Ok(records)
    }

    /// Lists records whose latest attempt failed, oldest first.
    pub async fn failed(&self) -> Result<Vec<DeliveryRecord>> {
        self.filtered(DeliveryRecord::is_failed).await
    }

    /// Lists records for one shop, oldest first.
    pub async fn by_shop(&self, shop: &ShopDomain) -> Result<Vec<DeliveryRecord>> {
        self.filtered(|record| &record.shop == shop).await
    }

    /// Lists records attributed to one merchant, oldest first.
    pub async fn by_merchant(&self, merchant: &MerchantId) -> Result<Vec<DeliveryRecord>> {
        self.filtered(|record| record.merchant_id.as_ref() == Some(merchant)).await
    }

    /// Summarizes all retained records.
    pub async fn stats(&self) -> Result<MonitorStats> {
        let records = self.all().await?;

        Ok(records.iter().fold(MonitorStats::default(), |mut stats, record| {
            stats.total += 1;
            if record.processed_at.is_none() {
                stats.pending += 1;
            } else if record.success {
                stats.succeeded += 1;
            } else {
                stats.failed += 1;
            }
            if record.retry_count > 0 {
                stats.retried += 1;
            }
            stats
        }))
    }

    /// Deletes records received before `cutoff`. Returns the ids deleted.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<EventId>> {
        let mut purged = Vec::new();
        for record in self.all().await? {
            if record.received_at < cutoff && self.store.delete(&record_key(&record.event_id)).await? {
                purged.push(record.event_id);
            }
        }

        if !purged.is_empty() {
            info!(purged = purged.len(), cutoff = %cutoff, "purged expired delivery records");
        }
        Ok(purged)
    }
}
