use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{
    clock::SharedClock,
    config::AppConfig,
    errors::ServiceError,
    events::EventSender,
    models::{
        catalog::ProductSnapshot, discount::DiscountRule, shipping::ShippingMethod, tax::TaxZone,
    },
    repositories::VersionedStore,
    services::{
        commerce::{
            CartService, CheckoutService, InMemoryCatalog, InMemoryDiscounts, PricingEngine,
            ShippingRateLookup, StaticTaxRates, TableShippingRates, TaxEngine, TaxRateLookup,
            TotalsCalculator,
        },
        inventory_reservation_service::InventoryLedger,
        orders::OrderService,
        payments::{MockPaymentProvider, PaymentOrchestrator, PaymentProvider, RestPaymentProvider},
    },
    webhooks::WebhookSigner,
};

/// Reference data the in-memory lookups start with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommerceSeed {
    pub products: Vec<ProductSnapshot>,
    pub discounts: Vec<DiscountRule>,
    pub tax_zones: Vec<TaxZone>,
    pub shipping_methods: Vec<ShippingMethod>,
}

impl CommerceSeed {
    /// Reads a JSON seed file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ServiceError::InternalError(format!("Cannot read seed {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            ServiceError::ValidationError(format!("Invalid seed {}: {}", path.display(), e))
        })
    }
}

/// Factory for creating service instances with shared dependencies
pub struct ServiceFactory {
    config: Arc<AppConfig>,
    event_sender: Arc<EventSender>,
    clock: SharedClock,
    seed: CommerceSeed,
    tax_rates: Option<Arc<dyn TaxRateLookup>>,
    shipping_rates: Option<Arc<dyn ShippingRateLookup>>,
    provider: Option<Arc<dyn PaymentProvider>>,
}

impl ServiceFactory {
    /// Creates a new service factory with the given dependencies
    pub fn new(config: Arc<AppConfig>, event_sender: Arc<EventSender>, clock: SharedClock) -> Self {
        Self {
            config,
            event_sender,
            clock,
            seed: CommerceSeed::default(),
            tax_rates: None,
            shipping_rates: None,
            provider: None,
        }
    }

    pub fn with_seed(mut self, seed: CommerceSeed) -> Self {
        self.seed = seed;
        self
    }

    /// Replaces the seeded tax table with another rate source.
    pub fn with_tax_rates(mut self, rates: Arc<dyn TaxRateLookup>) -> Self {
        self.tax_rates = Some(rates);
        self
    }

    /// Replaces the seeded shipping table with another rate source.
    pub fn with_shipping_rates(mut self, rates: Arc<dyn ShippingRateLookup>) -> Self {
        self.shipping_rates = Some(rates);
        self
    }

    /// Uses the given provider instead of the configured one.
    pub fn with_payment_provider(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Signer for the configured webhook secret.
    pub fn webhook_signer(&self) -> Result<WebhookSigner, ServiceError> {
        WebhookSigner::new(
            &self.config.payment_webhook_secret,
            self.config.payment_webhook_tolerance_secs,
        )
        .map_err(|e| ServiceError::InternalError(format!("Webhook signer: {}", e)))
    }

    /// Creates the payment provider named by `payment_provider`.
    pub fn payment_provider(&self) -> Result<Arc<dyn PaymentProvider>, ServiceError> {
        if let Some(provider) = &self.provider {
            return Ok(provider.clone());
        }
        let signer = self.webhook_signer()?;
        match self.config.payment_provider.to_ascii_lowercase().as_str() {
            "mock" => Ok(Arc::new(MockPaymentProvider::new(signer, self.clock.clone()))),
            "rest" => {
                let base_url = self.config.payment_gateway_url.clone().ok_or_else(|| {
                    ServiceError::ValidationError("payment_gateway_url is not set".to_string())
                })?;
                Ok(Arc::new(RestPaymentProvider::new(
                    base_url,
                    self.config.payment_api_key.clone().unwrap_or_default(),
                    self.config.payment_timeout(),
                    signer,
                    self.clock.clone(),
                )?))
            }
            other => Err(ServiceError::ValidationError(format!(
                "Unknown payment provider '{}'",
                other
            ))),
        }
    }

    /// Wires every service over shared stores and collaborators.
    pub fn build(self) -> Result<ServiceContainer, ServiceError> {
        let provider = self.payment_provider()?;
        let lookup_timeout = self.config.lookup_timeout();

        let catalog = Arc::new(InMemoryCatalog::with_products(self.seed.products));
        let discounts = Arc::new(InMemoryDiscounts::new());
        for rule in self.seed.discounts {
            discounts.upsert(rule);
        }
        let tax_rates = self
            .tax_rates
            .unwrap_or_else(|| Arc::new(StaticTaxRates::new(self.seed.tax_zones)));
        let shipping_rates = self
            .shipping_rates
            .unwrap_or_else(|| Arc::new(TableShippingRates::new(self.seed.shipping_methods)));

        let pricing = PricingEngine::new(discounts.clone(), self.clock.clone(), lookup_timeout);
        let tax = TaxEngine::new(tax_rates, self.clock.clone(), lookup_timeout);
        let totals = TotalsCalculator::new(
            pricing.clone(),
            tax,
            shipping_rates,
            self.clock.clone(),
            lookup_timeout,
        );

        let ledger = InventoryLedger::new(
            self.event_sender.clone(),
            self.clock.clone(),
            self.config.reservation_ttl(),
        );
        let payments = PaymentOrchestrator::new(
            VersionedStore::shared("payment_intent"),
            provider,
            self.event_sender.clone(),
            self.clock.clone(),
            self.config.payment_timeout(),
            self.config.payment_max_attempts,
        );
        let orders = OrderService::new(
            VersionedStore::shared("order"),
            ledger.clone(),
            payments.clone(),
            pricing,
            self.event_sender.clone(),
            self.clock.clone(),
            self.config.order_number_prefix.clone(),
        );
        let carts = CartService::new(
            VersionedStore::shared("cart"),
            catalog.clone(),
            totals.clone(),
            self.event_sender.clone(),
            self.clock.clone(),
            self.config.clone(),
        );
        let checkout = CheckoutService::new(
            VersionedStore::shared("checkout_session"),
            carts.clone(),
            totals,
            ledger.clone(),
            payments.clone(),
            orders.clone(),
            self.event_sender.clone(),
            self.clock.clone(),
            self.config.clone(),
        );

        info!(
            provider = payments.provider_name(),
            "Commerce services initialized"
        );
        Ok(ServiceContainer {
            config: self.config,
            clock: self.clock,
            catalog,
            discounts,
            ledger,
            carts,
            checkout,
            payments,
            orders,
        })
    }
}

/// Service container holding all service instances
#[derive(Clone)]
pub struct ServiceContainer {
    pub config: Arc<AppConfig>,
    pub clock: SharedClock,
    pub catalog: Arc<InMemoryCatalog>,
    pub discounts: Arc<InMemoryDiscounts>,
    pub ledger: InventoryLedger,
    pub carts: CartService,
    pub checkout: CheckoutService,
    pub payments: PaymentOrchestrator,
    pub orders: OrderService,
}

impl ServiceContainer {
    /// Starts the background sweeps: reservation expiry on the ledger, and
    /// abandoned sessions plus stale carts on the same interval.
    pub fn spawn_sweepers(&self) -> Vec<JoinHandle<()>> {
        let interval = self.config.sweep_interval();
        let ledger_sweeper = self.ledger.spawn_expiry_sweeper(interval);

        let container = self.clone();
        let session_sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = container.clock.now();
                let abandoned = container.checkout.expire_abandoned(now).await;
                let carts = container.carts.sweep_expired_carts(now).await;
                debug!(abandoned, carts, "Session sweep finished");
            }
        });

        vec![ledger_sweeper, session_sweeper]
    }
}
