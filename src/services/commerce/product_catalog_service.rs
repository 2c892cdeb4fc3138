use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::{
    errors::ServiceError,
    models::{catalog::ProductSnapshot, reservation::StockKey},
};

/// Read-only product and price lookup. Catalog management lives outside the
/// core; carts only ever read through this.
#[async_trait]
pub trait CatalogLookup: Send + Sync {
    async fn product(
        &self,
        product_id: Uuid,
        variant_id: Option<Uuid>,
    ) -> Result<Option<ProductSnapshot>, ServiceError>;
}

/// Catalog held in memory, keyed by product/variant.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    products: DashMap<StockKey, ProductSnapshot>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, product: ProductSnapshot) {
        self.products.insert(product.key(), product);
    }

    pub fn with_products(products: impl IntoIterator<Item = ProductSnapshot>) -> Self {
        let catalog = Self::new();
        for product in products {
            catalog.upsert(product);
        }
        catalog
    }
}

#[async_trait]
impl CatalogLookup for InMemoryCatalog {
    async fn product(
        &self,
        product_id: Uuid,
        variant_id: Option<Uuid>,
    ) -> Result<Option<ProductSnapshot>, ServiceError> {
        let key = StockKey::new(product_id, variant_id);
        Ok(self
            .products
            .get(&key)
            .map(|p| p.value().clone())
            .filter(|p| p.active))
    }
}
