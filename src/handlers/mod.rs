//! HTTP handlers grouped by resource.

pub mod commerce;
pub mod common;
pub mod health;
pub mod orders;
pub mod payment_webhooks;

pub use commerce::{carts_routes, checkout_routes};
pub use health::health_routes;
pub use orders::orders_routes;
pub use payment_webhooks::payment_webhook_routes;
