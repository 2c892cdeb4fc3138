//! Payment intents: the provider capability, its gateways, and the
//! orchestrator that keeps the local mirror honest.

pub mod mock;
pub mod orchestrator;
pub mod provider;
pub mod rest;

pub use mock::{MockOperation, MockOutcome, MockPaymentProvider};
pub use orchestrator::{idempotency_key, PaymentOrchestrator, WebhookReceipt};
pub use provider::{CreateIntentRequest, PaymentProvider, ProviderError, ProviderIntent};
pub use rest::RestPaymentProvider;
