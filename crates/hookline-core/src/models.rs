//! Core domain models and strongly-typed identifiers.
//!
//! Defines the topic set, event identity, the immutable event context handed
//! to the dispatcher, handler results, and the delivery record the monitor
//! keeps for every inbound event.

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::{
    error::{HandlerError, IngestError},
    payload::Payload,
    time::Clock,
};

macro_rules! topics {
    ($($variant:ident => $tag:literal),+ $(,)?) => {
        /// Webhook topic from the platform's fixed topic set.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Topic {
            $(
                #[doc = $tag]
                $variant,
            )+
        }

        impl Topic {
            /// Every known topic in declaration order.
            pub const ALL: &'static [Topic] = &[$(Topic::$variant),+];

            /// Returns the wire tag, e.g. `orders/create`.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $tag,)+
                }
            }
        }

        impl FromStr for Topic {
            type Err = IngestError;

            fn from_str(tag: &str) -> Result<Self, Self::Err> {
                match tag {
                    $($tag => Ok(Self::$variant),)+
                    other => Err(IngestError::UnknownTopic(other.to_string())),
                }
            }
        }
    };
}

topics! {
    AppUninstalled => "app/uninstalled",
    CartsCreate => "carts/create",
    CartsUpdate => "carts/update",
    CheckoutsCreate => "checkouts/create",
    CheckoutsUpdate => "checkouts/update",
    CollectionsCreate => "collections/create",
    CollectionsUpdate => "collections/update",
    CollectionsDelete => "collections/delete",
    CustomerTagsAdded => "customer_tags/added",
    CustomerTagsRemoved => "customer_tags/removed",
    CustomersCreate => "customers/create",
    CustomersDelete => "customers/delete",
    CustomersDisable => "customers/disable",
    CustomersEnable => "customers/enable",
    CustomersUpdate => "customers/update",
    CustomersEmailMarketingConsentUpdate => "customers/email_marketing_consent_update",
    CustomersMarketingConsentUpdate => "customers/marketing_consent_update",
    CustomersPurchasingSummary => "customers/purchasing_summary",
    CustomersDataRequest => "customers/data_request",
    CustomersRedact => "customers/redact",
    DraftOrdersCreate => "draft_orders/create",
    DraftOrdersUpdate => "draft_orders/update",
    DraftOrdersDelete => "draft_orders/delete",
    FulfillmentsCreate => "fulfillments/create",
    FulfillmentsUpdate => "fulfillments/update",
    InventoryItemsCreate => "inventory_items/create",
    InventoryItemsUpdate => "inventory_items/update",
    InventoryItemsDelete => "inventory_items/delete",
    InventoryLevelsConnect => "inventory_levels/connect",
    InventoryLevelsUpdate => "inventory_levels/update",
    InventoryLevelsDisconnect => "inventory_levels/disconnect",
    OrdersCancelled => "orders/cancelled",
    OrdersCreate => "orders/create",
    OrdersFulfilled => "orders/fulfilled",
    OrdersPaid => "orders/paid",
    OrdersPartiallyFulfilled => "orders/partially_fulfilled",
    OrdersUpdated => "orders/updated",
    ProductsCreate => "products/create",
    ProductsUpdate => "products/update",
    ProductsDelete => "products/delete",
    RefundsCreate => "refunds/create",
    ShopUpdate => "shop/update",
}

impl Topic {
    /// Returns the resource family, the part of the tag before the slash.
    pub fn resource(self) -> &'static str {
        let tag = self.as_str();
        tag.split_once('/').map_or(tag, |(resource, _)| resource)
    }

    /// Returns the processing priority for this topic.
    ///
    /// Uninstalls revoke access and are critical; anything touching money or
    /// stock is high; catalog and customer changes are normal.
    pub fn priority(self) -> TopicPriority {
        match self.resource() {
            "app" => TopicPriority::Critical,
            "orders" | "fulfillments" | "inventory_levels" | "refunds" => TopicPriority::High,
            _ => TopicPriority::Normal,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        tag.parse().map_err(de::Error::custom)
    }
}

/// Relative urgency of a topic, used to order retries due at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicPriority {
    /// Catalog, customer and storefront changes.
    Normal,
    /// Orders, fulfillments, inventory and refunds.
    High,
    /// App lifecycle events.
    Critical,
}

/// Strongly-typed event identifier.
///
/// Assigned once at the ingestion boundary. Each inbound occurrence gets its
/// own id, so a platform redelivery of the same logical event is a new id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.to_string())
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EventId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for EventId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Validated shop identifier, e.g. `acme.myshopify.com`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShopDomain(String);

impl ShopDomain {
    const MAX_LEN: usize = 255;

    /// Validates and wraps a shop domain.
    ///
    /// Accepts hostname characters only (ASCII alphanumerics, `-` and `.`)
    /// and requires an alphanumeric first character.
    pub fn parse(shop: impl Into<String>) -> Result<Self, IngestError> {
        let shop = shop.into();
        let reject = |reason| IngestError::InvalidShop { shop: shop.clone(), reason };

        let Some(first) = shop.chars().next() else {
            return Err(reject("shop domain is empty"));
        };
        if shop.len() > Self::MAX_LEN {
            return Err(reject("shop domain exceeds 255 bytes"));
        }
        if !first.is_ascii_alphanumeric() {
            return Err(reject("shop domain must start with a letter or digit"));
        }
        if !shop.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
            return Err(reject("shop domain contains invalid characters"));
        }

        Ok(Self(shop))
    }

    /// Returns the domain as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ShopDomain {
    type Error = IngestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ShopDomain> for String {
    fn from(shop: ShopDomain) -> Self {
        shop.0
    }
}

impl AsRef<str> for ShopDomain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShopDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the merchant account that owns a shop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MerchantId(pub String);

impl fmt::Display for MerchantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MerchantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Immutable description of one inbound event.
///
/// Built once at ingestion and passed by reference through dispatch and into
/// every retry. Serializable so pending retries can be checkpointed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    event_id: EventId,
    topic: Topic,
    shop: ShopDomain,
    payload: Payload,
    received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
}

impl EventContext {
    /// Assembles a context from already-validated parts.
    pub fn new(
        event_id: EventId,
        topic: Topic,
        shop: ShopDomain,
        payload: Payload,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self { event_id, topic, shop, payload, received_at, headers: BTreeMap::new() }
    }

    /// Attaches the request headers seen at the boundary.
    #[must_use]
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Normalizes a verified inbound request into an event context.
    ///
    /// Validates the topic tag, shop domain and payload shape, then assigns a
    /// fresh event id and stamps the receipt time from `clock`. Signature
    /// verification happens before this call and is not repeated.
    pub fn ingest(
        topic: &str,
        shop: &str,
        body: serde_json::Value,
        headers: BTreeMap<String, String>,
        clock: &dyn Clock,
    ) -> Result<Self, IngestError> {
        let topic: Topic = topic.parse()?;
        let shop = ShopDomain::parse(shop)?;
        let payload = Payload::parse(topic, body)?;

        Ok(Self::new(EventId::new(), topic, shop, payload, clock.now()).with_headers(headers))
    }

    /// Unique id of this inbound occurrence.
    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    /// Topic the event was delivered under.
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Shop that emitted the event.
    pub fn shop(&self) -> &ShopDomain {
        &self.shop
    }

    /// Typed payload for the topic.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// When the boundary received the event.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Request headers captured at the boundary.
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }
}

/// Outcome of one processing attempt.
///
/// Produced fresh by every attempt and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerResult {
    success: bool,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<HandlerError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

impl HandlerResult {
    /// Creates a successful result.
    pub fn success(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into(), error: None, data: None }
    }

    /// Creates a failed result without a classified error.
    pub fn failure(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into(), error: None, data: None }
    }

    /// Creates a failed result carrying the error that caused it.
    pub fn failed_with(message: impl Into<String>, error: HandlerError) -> Self {
        Self { success: false, message: message.into(), error: Some(error), data: None }
    }

    /// Creates the terminal result for a topic nobody handles.
    pub fn no_handler(topic: Topic) -> Self {
        Self::failed_with(
            format!("no handler for topic {topic}"),
            HandlerError::NoHandler { topic },
        )
    }

    /// Attaches an opaque result payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Whether the attempt succeeded.
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Human-readable outcome message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Error that caused a failure, if classified.
    pub fn error(&self) -> Option<&HandlerError> {
        self.error.as_ref()
    }

    /// Opaque result payload, if the handler produced one.
    pub fn data(&self) -> Option<&serde_json::Value> {
        self.data.as_ref()
    }

    /// Whether a failed attempt is worth retrying.
    ///
    /// Failures without a classified error count as retryable.
    pub fn is_retryable(&self) -> bool {
        !self.success && self.error.as_ref().map_or(true, HandlerError::is_retryable)
    }

    /// Text recorded on the delivery record for a failure.
    pub fn error_message(&self) -> Option<String> {
        if self.success {
            return None;
        }
        Some(self.error.as_ref().map_or_else(|| self.message.clone(), ToString::to_string))
    }
}

/// Lifecycle state of one inbound event, owned by the event monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Id of the inbound occurrence.
    pub event_id: EventId,
    /// Topic the event was delivered under.
    pub topic: Topic,
    /// Shop that emitted the event.
    pub shop: ShopDomain,
    /// Merchant owning the shop, when the directory knows it.
    pub merchant_id: Option<MerchantId>,
    /// When the boundary received the event.
    pub received_at: DateTime<Utc>,
    /// When the first attempt completed.
    pub processed_at: Option<DateTime<Utc>>,
    /// Outcome of the latest completed attempt.
    pub success: bool,
    /// Error text of the latest failed attempt.
    pub error_message: Option<String>,
    /// Number of retry attempts made; never decreases.
    pub retry_count: u32,
    /// When the latest retry attempt completed.
    pub last_retry_at: Option<DateTime<Utc>>,
    /// Set when the latest failure will not be retried automatically: no
    /// handler was registered or the retry budget ran out.
    #[serde(default)]
    pub retries_stopped: bool,
    /// Full context, kept so retries and recovery can replay the event.
    pub context: EventContext,
}

impl DeliveryRecord {
    /// Creates a record for a freshly received event, pending its first outcome.
    pub fn received(context: EventContext, merchant_id: Option<MerchantId>) -> Self {
        Self {
            event_id: context.event_id().clone(),
            topic: context.topic(),
            shop: context.shop().clone(),
            merchant_id,
            received_at: context.received_at(),
            processed_at: None,
            success: false,
            error_message: None,
            retry_count: 0,
            last_retry_at: None,
            retries_stopped: false,
            context,
        }
    }

    /// Whether an attempt has completed and the latest one failed.
    pub fn is_failed(&self) -> bool {
        self.processed_at.is_some() && !self.success
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::time::TestClock;

    #[test]
    fn every_topic_tag_parses_back() {
        for topic in Topic::ALL {
            assert_eq!(topic.as_str().parse::<Topic>(), Ok(*topic));
        }
    }

    #[test]
    fn unknown_topic_rejected() {
        assert_eq!(
            "unknown/topic".parse::<Topic>(),
            Err(IngestError::UnknownTopic("unknown/topic".to_string()))
        );
    }

    #[test]
    fn topic_priorities_follow_resource() {
        assert_eq!(Topic::AppUninstalled.priority(), TopicPriority::Critical);
        assert_eq!(Topic::OrdersCreate.priority(), TopicPriority::High);
        assert_eq!(Topic::InventoryLevelsUpdate.priority(), TopicPriority::High);
        assert_eq!(Topic::ProductsUpdate.priority(), TopicPriority::Normal);
        assert!(TopicPriority::Critical > TopicPriority::High);
        assert_eq!(Topic::CustomerTagsAdded.resource(), "customer_tags");
    }

    #[test]
    fn topic_serializes_as_wire_tag() {
        assert_eq!(serde_json::to_value(Topic::OrdersPaid).unwrap(), json!("orders/paid"));
        let topic: Topic = serde_json::from_value(json!("shop/update")).unwrap();
        assert_eq!(topic, Topic::ShopUpdate);
        assert!(serde_json::from_value::<Topic>(json!("shop/explode")).is_err());
    }

    #[test]
    fn shop_domain_validation() {
        assert!(ShopDomain::parse("shop.example.com").is_ok());
        assert!(ShopDomain::parse("acme-store.myshopify.com").is_ok());
        assert!(ShopDomain::parse("").is_err());
        assert!(ShopDomain::parse("-acme.myshopify.com").is_err());
        assert!(ShopDomain::parse("acme/../etc").is_err());
        assert!(ShopDomain::parse("a".repeat(256)).is_err());
    }

    #[test]
    fn ingest_builds_typed_context() {
        let clock = TestClock::new();
        let context = EventContext::ingest(
            "orders/create",
            "shop.example.com",
            json!({ "id": 820982911946154508_u64, "email": "jon@example.com" }),
            BTreeMap::from([("x-shopify-topic".to_string(), "orders/create".to_string())]),
            &clock,
        )
        .unwrap();

        assert_eq!(context.topic(), Topic::OrdersCreate);
        assert_eq!(context.shop().as_str(), "shop.example.com");
        assert_eq!(context.received_at(), clock.now());
        assert!(matches!(context.payload(), Payload::Order(order) if order.id == 820982911946154508));
        assert_eq!(context.headers().len(), 1);
    }

    #[test]
    fn ingest_rejects_unknown_topic_and_bad_shop() {
        let clock = TestClock::new();
        let body = json!({ "id": 1 });

        let error =
            EventContext::ingest("unknown/topic", "shop.example.com", body.clone(), BTreeMap::new(), &clock)
                .unwrap_err();
        assert!(matches!(error, IngestError::UnknownTopic(_)));

        let error = EventContext::ingest("orders/create", "", body, BTreeMap::new(), &clock)
            .unwrap_err();
        assert!(matches!(error, IngestError::InvalidShop { .. }));
    }

    #[test]
    fn ingest_assigns_distinct_ids_to_redeliveries() {
        let clock = TestClock::new();
        let body = json!({ "id": 7 });
        let first =
            EventContext::ingest("products/update", "acme.myshopify.com", body.clone(), BTreeMap::new(), &clock)
                .unwrap();
        let second =
            EventContext::ingest("products/update", "acme.myshopify.com", body, BTreeMap::new(), &clock)
                .unwrap();

        assert_ne!(first.event_id(), second.event_id());
        assert_eq!(first.payload(), second.payload());
    }

    #[test]
    fn handler_result_retryability() {
        assert!(!HandlerResult::success("ok").is_retryable());
        assert!(HandlerResult::failure("flaky").is_retryable());
        assert!(!HandlerResult::no_handler(Topic::ShopUpdate).is_retryable());
        assert_eq!(
            HandlerResult::no_handler(Topic::ShopUpdate).error_message().as_deref(),
            Some("no handler for topic shop/update")
        );
        assert_eq!(HandlerResult::failure("flaky").error_message().as_deref(), Some("flaky"));
        assert_eq!(HandlerResult::success("ok").error_message(), None);
    }

    #[test]
    fn fresh_record_is_pending_not_failed() {
        let clock = TestClock::new();
        let context = EventContext::ingest(
            "app/uninstalled",
            "acme.myshopify.com",
            json!({ "id": 548380009, "domain": "acme.com" }),
            BTreeMap::new(),
            &clock,
        )
        .unwrap();

        let mut record = DeliveryRecord::received(context, Some(MerchantId::from("m-1")));
        assert!(!record.success);
        assert!(!record.is_failed());
        assert_eq!(record.retry_count, 0);

        record.processed_at = Some(clock.now());
        assert!(record.is_failed());
    }
}
