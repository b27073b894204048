//! Shop-to-merchant lookup.
//!
//! The event monitor attributes each delivery record to the merchant that
//! owns the shop. Where that mapping lives is outside this crate, so it is
//! injected through [`MerchantDirectory`].

use std::collections::HashMap;

use async_trait::async_trait;

use crate::models::{MerchantId, ShopDomain};

/// Resolves the merchant that owns a shop.
#[async_trait]
pub trait MerchantDirectory: Send + Sync + std::fmt::Debug {
    /// Returns the owning merchant, or `None` when the shop is unknown.
    async fn merchant_for(&self, shop: &ShopDomain) -> Option<MerchantId>;
}

/// Directory that knows no merchants. Records stay unattributed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMerchantDirectory;

#[async_trait]
impl MerchantDirectory for NoMerchantDirectory {
    async fn merchant_for(&self, _shop: &ShopDomain) -> Option<MerchantId> {
        None
    }
}

/// Fixed in-memory mapping, typically loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticMerchantDirectory {
    merchants: HashMap<ShopDomain, MerchantId>,
}

impl StaticMerchantDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `shop` to `merchant`, replacing any earlier mapping.
    pub fn insert(&mut self, shop: ShopDomain, merchant: MerchantId) {
        self.merchants.insert(shop, merchant);
    }

    /// Number of mapped shops.
    pub fn len(&self) -> usize {
        self.merchants.len()
    }

    /// Whether no shops are mapped.
    pub fn is_empty(&self) -> bool {
        self.merchants.is_empty()
    }
}

impl FromIterator<(ShopDomain, MerchantId)> for StaticMerchantDirectory {
    fn from_iter<I: IntoIterator<Item = (ShopDomain, MerchantId)>>(iter: I) -> Self {
        Self { merchants: iter.into_iter().collect() }
    }
}

#[async_trait]
impl MerchantDirectory for StaticMerchantDirectory {
    async fn merchant_for(&self, shop: &ShopDomain) -> Option<MerchantId> {
        self.merchants.get(shop).cloned()
    }
}
