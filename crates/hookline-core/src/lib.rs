//! Core domain types for webhook ingestion.
//!
//! Provides the topic set, typed payloads, the immutable event context, the
//! handler and merchant directory seams, the key-value storage abstraction
//! and the clock. The delivery crate builds dispatch, monitoring, metrics
//! and retries on top of these.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod handler;
pub mod merchant;
pub mod models;
pub mod payload;
pub mod store;
pub mod time;

pub use error::{HandlerError, IngestError, Result, StoreError};
pub use handler::WebhookHandler;
pub use merchant::{MerchantDirectory, NoMerchantDirectory, StaticMerchantDirectory};
pub use models::{
    DeliveryRecord, EventContext, EventId, HandlerResult, MerchantId, ShopDomain, Topic,
    TopicPriority,
};
pub use payload::Payload;
pub use store::{KeyValueStore, MemoryStore};
pub use time::{Clock, RealClock, TestClock};
