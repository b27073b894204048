//! Event builders with realistic default payloads.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hookline_core::{EventContext, EventId, Payload, ShopDomain, Topic};
use serde_json::{json, Value};

/// Default shop used by fixtures.
pub const TEST_SHOP: &str = "shop.example.com";

/// Builder for test event contexts.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    topic: Topic,
    event_id: EventId,
    shop: String,
    payload: Option<Value>,
    headers: BTreeMap<String, String>,
    received_at: Option<DateTime<Utc>>,
}

impl EventBuilder {
    /// Creates a builder for `topic` with a random id and the default shop.
    pub fn new(topic: Topic) -> Self {
        Self {
            topic,
            event_id: EventId::new(),
            shop: TEST_SHOP.to_string(),
            payload: None,
            headers: BTreeMap::new(),
            received_at: None,
        }
    }

    /// Sets the event id.
    #[must_use]
    pub fn id(mut self, id: impl Into<EventId>) -> Self {
        self.event_id = id.into();
        self
    }

    /// Sets the shop domain.
    #[must_use]
    pub fn shop(mut self, shop: impl Into<String>) -> Self {
        self.shop = shop.into();
        self
    }

    /// Replaces the sample payload.
    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Adds a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the receipt timestamp.
    #[must_use]
    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = Some(at);
        self
    }

    /// Builds the context.
    ///
    /// # Panics
    ///
    /// Panics if the shop or payload is invalid for the topic.
    pub fn build(self) -> EventContext {
        let shop = ShopDomain::parse(self.shop).expect("fixture shop domain should be valid");
        let body = self.payload.unwrap_or_else(|| sample_payload(self.topic));
        let payload =
            Payload::parse(self.topic, body).expect("fixture payload should match its topic");

        EventContext::new(
            self.event_id,
            self.topic,
            shop,
            payload,
            self.received_at.unwrap_or_else(Utc::now),
        )
        .with_headers(self.headers)
    }
}

/// A plausible payload for each topic family.
pub fn sample_payload(topic: Topic) -> Value {
    match topic.resource() {
        "products" => json!({
            "id": 632910392,
            "title": "IPod Nano - 8GB",
            "handle": "ipod-nano",
            "vendor": "Apple",
        }),
        "orders" => json!({
            "id": 450789469,
            "name": "#1001",
            "email": "bob.norman@example.com",
            "financial_status": "paid",
            "total_price": "598.94",
        }),
        "inventory_levels" => json!({
            "inventory_item_id": 808950810,
            "location_id": 655441491,
            "available": 42,
        }),
        "app" => json!({
            "id": 548380009,
            "domain": "shop.example.com",
            "myshopify_domain": "shop.myshopify.com",
        }),
        _ => json!({ "id": 207119551, "email": "bob.norman@example.com" }),
    }
}
