/// Commerce services module - carts, pricing, tax, shipping and checkout
pub mod cart_service;
pub mod checkout_service;
pub mod pricing_service;
pub mod product_catalog_service;
pub mod shipping_service;
pub mod tax_service;
pub mod totals;

// Re-export services for convenience
pub use cart_service::{AddToCartInput, CartService, CreateCartInput};
pub use checkout_service::{CheckoutService, SetEmailInput};
pub use pricing_service::{DiscountLookup, InMemoryDiscounts, PricingEngine};
pub use product_catalog_service::{CatalogLookup, InMemoryCatalog};
pub use shipping_service::{ShippingRateLookup, TableShippingRates};
pub use tax_service::{StaticTaxRates, TaxEngine, TaxRateLookup};
pub use totals::{TotalsCalculator, TotalsInput};
