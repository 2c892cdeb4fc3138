#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use commerce_core::{
    clock::{ManualClock, SharedClock},
    config::AppConfig,
    events::{Event, EventSender},
    models::{
        address::Address,
        cart::Cart,
        catalog::ProductSnapshot,
        checkout::{CheckoutSession, CheckoutStep},
        discount::{DiscountKind, DiscountRule, Eligibility},
        order::Order,
        payment::PaymentIntent,
        reservation::StockKey,
        shipping::ShippingMethod,
        tax::{TaxZone, TAX_CLASS_STANDARD},
    },
    services::{
        commerce::{AddToCartInput, CreateCartInput, SetEmailInput},
        factory::{CommerceSeed, ServiceContainer, ServiceFactory},
        payments::MockPaymentProvider,
    },
    webhooks::WebhookSigner,
    AppState,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const COUPON: &str = "SAVE10";
pub const STANDARD_SHIPPING: &str = "standard";

/// Fully wired services over a manual clock and the mock gateway.
pub struct Harness {
    pub services: ServiceContainer,
    pub clock: Arc<ManualClock>,
    pub provider: Arc<MockPaymentProvider>,
    pub event_sender: Arc<EventSender>,
    /// $50.00, standard tax class
    pub product_a: Uuid,
    /// $20.00, standard tax class
    pub product_b: Uuid,
    events: Mutex<mpsc::Receiver<Event>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(AppConfig::default(), false)
    }

    /// Gateway that only authorizes on confirm; capture is a separate call.
    pub fn manual_capture() -> Self {
        Self::build(AppConfig::default(), true)
    }

    pub fn with_config(config: AppConfig) -> Self {
        Self::build(config, false)
    }

    fn build(config: AppConfig, manual_capture: bool) -> Self {
        let config = Arc::new(config);
        let clock = Arc::new(ManualClock::default());
        let shared_clock: SharedClock = clock.clone();
        let (sender, rx) = EventSender::channel(4096);
        let event_sender = Arc::new(sender);

        let signer = WebhookSigner::new(
            &config.payment_webhook_secret,
            config.payment_webhook_tolerance_secs,
        )
        .expect("signer");
        let mut provider = MockPaymentProvider::new(signer, shared_clock.clone());
        if manual_capture {
            provider = provider.with_manual_capture();
        }
        let provider = Arc::new(provider);

        let product_a = Uuid::new_v4();
        let product_b = Uuid::new_v4();
        let services = ServiceFactory::new(config, event_sender.clone(), shared_clock)
            .with_seed(seed(product_a, product_b))
            .with_payment_provider(provider.clone())
            .build()
            .expect("services");

        Self {
            services,
            clock,
            provider,
            event_sender,
            product_a,
            product_b,
            events: Mutex::new(rx),
        }
    }

    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState::new(
            self.services.clone(),
            self.event_sender.clone(),
        ))
    }

    pub fn stock(&self, product_id: Uuid, on_hand: i64) {
        self.services
            .ledger
            .set_stock(StockKey::new(product_id, None), on_hand)
            .expect("set stock");
    }

    pub fn available(&self, product_id: Uuid) -> i64 {
        self.services
            .ledger
            .stock_level(StockKey::new(product_id, None))
            .available
    }

    pub fn on_hand(&self, product_id: Uuid) -> i64 {
        self.services
            .ledger
            .stock_level(StockKey::new(product_id, None))
            .on_hand
    }

    /// Events emitted since the last drain.
    pub fn drain_events(&self) -> Vec<Event> {
        let mut rx = self.events.lock().unwrap();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    pub async fn cart_with(&self, items: &[(Uuid, i64)], coupon: Option<&str>) -> Cart {
        let carts = &self.services.carts;
        let mut cart = carts
            .create_cart(CreateCartInput {
                session_id: Some(format!("guest-{}", Uuid::new_v4())),
                ..Default::default()
            })
            .await
            .expect("create cart");
        for (product_id, quantity) in items {
            cart = carts
                .add_item(
                    cart.id,
                    cart.version,
                    AddToCartInput {
                        product_id: *product_id,
                        variant_id: None,
                        quantity: *quantity,
                    },
                )
                .await
                .expect("add item");
        }
        if let Some(code) = coupon {
            cart = carts
                .apply_coupon(cart.id, cart.version, code.to_string())
                .await
                .expect("apply coupon");
        }
        cart
    }

    /// Starts checkout and fills in email, address and shipping method,
    /// leaving the session at `Shipping`.
    pub async fn checkout_at_shipping(&self, cart_id: Uuid) -> CheckoutSession {
        let checkout = &self.services.checkout;
        let session = checkout.start_checkout(cart_id).await.expect("start");
        let session = checkout
            .set_email(
                session.id,
                session.version,
                SetEmailInput {
                    email: "buyer@example.com".to_string(),
                },
            )
            .await
            .expect("email");
        let session = checkout
            .set_shipping_address(session.id, session.version, address())
            .await
            .expect("address");
        let session = checkout
            .select_shipping_method(session.id, session.version, STANDARD_SHIPPING.to_string())
            .await
            .expect("method");
        let session = checkout
            .advance(session.id, session.version)
            .await
            .expect("to shipping");
        assert_eq!(session.step, CheckoutStep::Shipping);
        session
    }

    /// Same as `checkout_at_shipping`, then reserves stock by moving to
    /// `Payment`.
    pub async fn checkout_at_payment(&self, cart_id: Uuid) -> CheckoutSession {
        let session = self.checkout_at_shipping(cart_id).await;
        let session = self
            .services
            .checkout
            .advance(session.id, session.version)
            .await
            .expect("to payment");
        assert_eq!(session.step, CheckoutStep::Payment);
        session
    }

    /// One unit of product A through checkout with a card payment:
    /// $50 + $5 shipping + $4 tax. Paid under the default gateway, only
    /// authorized under `manual_capture`.
    pub async fn place_order(&self) -> (Order, PaymentIntent) {
        self.stock(self.product_a, 1);
        let cart = self.cart_with(&[(self.product_a, 1)], None).await;
        let session = self.checkout_at_payment(cart.id).await;
        let checkout = &self.services.checkout;
        let (session, intent) = checkout
            .create_payment(session.id, session.version, Some("pm_card_visa".to_string()))
            .await
            .expect("payment");
        let session = checkout
            .advance(session.id, session.version)
            .await
            .expect("to review");
        let session = checkout
            .complete(session.id, session.version)
            .await
            .expect("complete");
        let order = self
            .services
            .orders
            .get_order(session.order_id.expect("order id"))
            .expect("order");
        (order, intent)
    }

    /// Provider-side id of the session's current intent.
    pub fn provider_intent_id(&self, session: &CheckoutSession) -> String {
        let intent_id = session.payment_intent_id.expect("session has an intent");
        self.services
            .payments
            .get_intent(intent_id)
            .expect("intent")
            .provider_intent_id
    }
}

pub fn address() -> Address {
    Address {
        first_name: "Ada".to_string(),
        last_name: "Lovelace".to_string(),
        company: None,
        line1: "1 Market St".to_string(),
        line2: None,
        city: "San Francisco".to_string(),
        region: Some("CA".to_string()),
        postal_code: "94105".to_string(),
        country_code: "US".to_string(),
        phone: None,
    }
}

fn seed(product_a: Uuid, product_b: Uuid) -> CommerceSeed {
    let product = |product_id, sku: &str, price: Decimal| ProductSnapshot {
        product_id,
        variant_id: None,
        sku: sku.to_string(),
        name: sku.to_string(),
        unit_price: price,
        category_ids: Vec::new(),
        tax_class: TAX_CLASS_STANDARD.to_string(),
        active: true,
    };

    let mut rates = HashMap::new();
    rates.insert(TAX_CLASS_STANDARD.to_string(), dec!(0.08));

    CommerceSeed {
        products: vec![
            product(product_a, "SKU-A", dec!(50.00)),
            product(product_b, "SKU-B", dec!(20.00)),
        ],
        discounts: vec![DiscountRule {
            id: Uuid::new_v4(),
            name: "Ten percent off".to_string(),
            code: Some(COUPON.to_string()),
            kind: DiscountKind::Percentage,
            value: dec!(10),
            eligibility: Eligibility::default(),
            usage_limit: None,
            usage_count: 0,
            combinable: false,
            created_at: Utc::now(),
        }],
        tax_zones: vec![TaxZone {
            id: Uuid::new_v4(),
            name: "California".to_string(),
            country_code: "US".to_string(),
            region: Some("CA".to_string()),
            city: None,
            postal_prefix: None,
            priority: 0,
            compound: false,
            rates,
            shipping_taxable: false,
        }],
        shipping_methods: vec![ShippingMethod {
            code: STANDARD_SHIPPING.to_string(),
            name: "Standard".to_string(),
            country_codes: vec!["US".to_string()],
            flat_rate: dec!(5.00),
            free_over: None,
            estimated_days: Some(5),
        }],
    }
}
