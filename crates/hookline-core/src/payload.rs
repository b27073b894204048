//! Typed webhook payloads.
//!
//! Each topic family decodes into its own variant so handlers match on shape
//! instead of probing untyped JSON. Fields the platform adds later survive in
//! the flattened `extra` maps.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::IngestError, models::Topic};

/// Product resource sent with `products/*` topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPayload {
    /// Product id
    pub id: u64,
    /// Display title
    #[serde(default)]
    pub title: Option<String>,
    /// URL handle
    #[serde(default)]
    pub handle: Option<String>,
    /// Remaining fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Order resource sent with `orders/*` topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPayload {
    /// Order id
    pub id: u64,
    /// Order name such as `#1001`
    #[serde(default)]
    pub name: Option<String>,
    /// Buyer email
    #[serde(default)]
    pub email: Option<String>,
    /// Payment state
    #[serde(default)]
    pub financial_status: Option<String>,
    /// Order total as a decimal string
    #[serde(default)]
    pub total_price: Option<String>,
    /// Remaining fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Customer resource sent with customer lifecycle topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerPayload {
    /// Customer id
    pub id: u64,
    /// Customer email
    #[serde(default)]
    pub email: Option<String>,
    /// Remaining fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Stock level of one item at one location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryLevelPayload {
    /// Inventory item id
    pub inventory_item_id: u64,
    /// Location id
    pub location_id: u64,
    /// Units available, absent on disconnect
    #[serde(default)]
    pub available: Option<i64>,
    /// Remaining fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Shop resource sent with `app/uninstalled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShopPayload {
    /// Shop id
    #[serde(default)]
    pub id: Option<u64>,
    /// Primary domain
    #[serde(default)]
    pub domain: Option<String>,
    /// Platform-assigned domain
    #[serde(default)]
    pub myshopify_domain: Option<String>,
    /// Remaining fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of an event, tagged by the shape it decoded into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// `products/*`
    Product(ProductPayload),
    /// `orders/*`
    Order(OrderPayload),
    /// Customer lifecycle topics
    Customer(CustomerPayload),
    /// `inventory_levels/*`
    InventoryLevel(InventoryLevelPayload),
    /// `app/uninstalled`
    AppUninstalled(ShopPayload),
    /// Any topic without a dedicated shape
    Generic(Map<String, Value>),
}

impl Payload {
    /// Decodes a raw body into the shape expected for `topic`.
    ///
    /// The body must be a JSON object. Topics without a dedicated shape keep
    /// the object as-is.
    pub fn parse(topic: Topic, body: Value) -> Result<Self, IngestError> {
        let Value::Object(object) = body else {
            return Err(IngestError::invalid_payload(topic, "payload must be a JSON object"));
        };

        let payload = match topic {
            Topic::ProductsCreate | Topic::ProductsUpdate | Topic::ProductsDelete => {
                Self::Product(decode(topic, object)?)
            },
            Topic::OrdersCancelled
            | Topic::OrdersCreate
            | Topic::OrdersFulfilled
            | Topic::OrdersPaid
            | Topic::OrdersPartiallyFulfilled
            | Topic::OrdersUpdated => Self::Order(decode(topic, object)?),
            Topic::CustomersCreate
            | Topic::CustomersUpdate
            | Topic::CustomersDelete
            | Topic::CustomersEnable
            | Topic::CustomersDisable => Self::Customer(decode(topic, object)?),
            Topic::InventoryLevelsConnect
            | Topic::InventoryLevelsUpdate
            | Topic::InventoryLevelsDisconnect => Self::InventoryLevel(decode(topic, object)?),
            Topic::AppUninstalled => Self::AppUninstalled(decode(topic, object)?),
            _ => Self::Generic(object),
        };

        Ok(payload)
    }

    /// Id of the resource the event is about, when the shape has one.
    pub fn resource_id(&self) -> Option<u64> {
        match self {
            Self::Product(product) => Some(product.id),
            Self::Order(order) => Some(order.id),
            Self::Customer(customer) => Some(customer.id),
            Self::InventoryLevel(level) => Some(level.inventory_item_id),
            Self::AppUninstalled(shop) => shop.id,
            Self::Generic(object) => object.get("id").and_then(Value::as_u64),
        }
    }
}

fn decode<T: DeserializeOwned>(topic: Topic, object: Map<String, Value>) -> Result<T, IngestError> {
    serde_json::from_value(Value::Object(object))
        .map_err(|e| IngestError::invalid_payload(topic, e.to_string()))
}
