//! REST gateway adapter against a stubbed HTTP gateway.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use commerce_core::{
    clock::{Clock, ManualClock, SharedClock},
    errors::ServiceError,
    events::EventSender,
    models::payment::{PaymentStatus, WebhookAction},
    repositories::VersionedStore,
    services::payments::{
        CreateIntentRequest, PaymentOrchestrator, PaymentProvider, ProviderError,
        RestPaymentProvider,
    },
    webhooks::WebhookSigner,
};
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "whsec_rest_provider_test_secret";

fn signer() -> WebhookSigner {
    WebhookSigner::new(SECRET, 300).unwrap()
}

fn provider(server: &MockServer, clock: SharedClock, timeout: Duration) -> RestPaymentProvider {
    RestPaymentProvider::new(server.uri(), "sk_test_123", timeout, signer(), clock).unwrap()
}

fn intent_json(id: &str, status: &str, amount: i64) -> serde_json::Value {
    json!({
        "id": id,
        "status": status,
        "amount": amount,
        "amount_capturable": if status == "requires_capture" { amount } else { 0 },
        "amount_received": if status == "succeeded" { amount } else { 0 },
        "amount_refunded": 0,
        "client_secret": format!("{}_secret", id),
    })
}

#[tokio::test]
async fn create_intent_sends_minor_units_and_keys() {
    let server = MockServer::start().await;
    let checkout_id = Uuid::new_v4();
    Mock::given(method("POST"))
        .and(path("/v1/payment_intents"))
        .and(header("authorization", "Bearer sk_test_123"))
        .and(header("Idempotency-Key", "create-key"))
        .and(body_json(json!({
            "amount": 5900,
            "currency": "usd",
            "capture_method": "automatic",
            "metadata": { "checkout_id": checkout_id },
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(intent_json("pi_100", "requires_payment_method", 5900)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let clock: SharedClock = Arc::new(ManualClock::default());
    let gateway = provider(&server, clock, Duration::from_secs(5));
    let intent = gateway
        .create_intent(&CreateIntentRequest {
            checkout_id,
            amount: dec!(59.00),
            currency: "USD".to_string(),
            idempotency_key: "create-key".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(intent.provider_intent_id, "pi_100");
    assert_eq!(intent.status, PaymentStatus::Created);
    assert_eq!(intent.amount, dec!(59.00));
    assert_eq!(intent.client_secret.as_deref(), Some("pi_100_secret"));
}

#[tokio::test]
async fn gateway_statuses_map_onto_local_ones() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/payment_intents/pi_200/confirm"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(intent_json("pi_200", "requires_capture", 2000)),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/payment_intents/pi_200/capture"))
        .and(body_json(json!({ "amount_to_capture": 2000 })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(intent_json("pi_200", "succeeded", 2000)),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/payment_intents/pi_200/refunds"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "pi_200",
            "status": "succeeded",
            "amount": 2000,
            "amount_received": 2000,
            "amount_refunded": 500,
        })))
        .mount(&server)
        .await;

    let clock: SharedClock = Arc::new(ManualClock::default());
    let gateway = provider(&server, clock, Duration::from_secs(5));

    let confirmed = gateway.confirm("pi_200", "pm_card", "k1").await.unwrap();
    assert_eq!(confirmed.status, PaymentStatus::Processing);
    assert_eq!(confirmed.amount_authorized, dec!(20.00));

    let captured = gateway.capture("pi_200", dec!(20.00), "k2").await.unwrap();
    assert_eq!(captured.status, PaymentStatus::Captured);
    assert_eq!(captured.amount_captured, dec!(20.00));

    let refunded = gateway.refund("pi_200", dec!(5.00), "k3").await.unwrap();
    assert_eq!(refunded.status, PaymentStatus::PartiallyRefunded);
    assert_eq!(refunded.amount_refunded, dec!(5.00));
}

#[tokio::test]
async fn gateway_errors_are_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/payment_intents/pi_declined/confirm"))
        .respond_with(ResponseTemplate::new(402).set_body_json(json!({
            "error": { "code": "card_declined", "message": "Your card was declined." }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/payment_intents/pi_missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": { "message": "No such payment_intent" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/payment_intents/pi_down/cancel"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let clock: SharedClock = Arc::new(ManualClock::default());
    let gateway = provider(&server, clock, Duration::from_secs(5));

    assert_eq!(
        gateway.confirm("pi_declined", "pm_card", "k").await,
        Err(ProviderError::Declined("card_declined".to_string()))
    );
    assert_matches!(
        gateway.get_status("pi_missing").await,
        Err(ProviderError::NotFound(_))
    );
    assert_matches!(
        gateway.cancel("pi_down", "k").await,
        Err(ProviderError::Unavailable(_))
    );
}

#[tokio::test]
async fn slow_gateway_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/payment_intents/pi_slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(intent_json("pi_slow", "processing", 100))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let clock: SharedClock = Arc::new(ManualClock::default());
    let gateway = provider(&server, clock, Duration::from_millis(200));
    assert_eq!(
        gateway.get_status("pi_slow").await,
        Err(ProviderError::Timeout)
    );
}

#[tokio::test]
async fn orchestrator_retries_outages_with_the_same_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/payment_intents"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/payment_intents"))
        .and(header_exists("Idempotency-Key"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(intent_json("pi_retry", "requires_payment_method", 1500)),
        )
        .mount(&server)
        .await;

    let clock: SharedClock = Arc::new(ManualClock::default());
    let gateway: Arc<dyn PaymentProvider> =
        Arc::new(provider(&server, clock.clone(), Duration::from_secs(5)));
    let (sender, _rx) = EventSender::channel(16);
    let orchestrator = PaymentOrchestrator::new(
        VersionedStore::shared("payment_intent"),
        gateway,
        Arc::new(sender),
        clock,
        Duration::from_secs(5),
        3,
    );

    let checkout_id = Uuid::new_v4();
    let intent = orchestrator
        .create_intent(checkout_id, dec!(15.00), "USD")
        .await
        .unwrap();
    assert_eq!(intent.provider_intent_id, "pi_retry");
    assert_eq!(intent.provider, "rest");

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);
    let keys: Vec<String> = requests
        .iter()
        .map(|r| {
            r.headers
                .get("Idempotency-Key")
                .unwrap()
                .to_str()
                .unwrap()
                .to_string()
        })
        .collect();
    assert!(keys.iter().all(|k| k == &keys[0]));
    assert_eq!(keys[0], format!("create:{}:1500:1", checkout_id));
}

#[tokio::test]
async fn orchestrator_gives_up_after_max_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/payment_intents"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let clock: SharedClock = Arc::new(ManualClock::default());
    let gateway: Arc<dyn PaymentProvider> =
        Arc::new(provider(&server, clock.clone(), Duration::from_secs(5)));
    let (sender, _rx) = EventSender::channel(16);
    let orchestrator = PaymentOrchestrator::new(
        VersionedStore::shared("payment_intent"),
        gateway,
        Arc::new(sender),
        clock,
        Duration::from_secs(5),
        2,
    );

    assert_matches!(
        orchestrator
            .create_intent(Uuid::new_v4(), dec!(15.00), "USD")
            .await,
        Err(ServiceError::ProviderUnavailable(_))
    );
}

#[tokio::test]
async fn webhooks_are_verified_before_decoding() {
    let server = MockServer::start().await;
    let manual = Arc::new(ManualClock::default());
    let clock: SharedClock = manual.clone();
    let gateway = provider(&server, clock, Duration::from_secs(5));

    let body = json!({
        "id": "evt_rest_1",
        "type": "payment_intent.succeeded",
        "created": manual.now().timestamp(),
        "data": { "intent_id": "pi_300", "amount": "12.50" }
    })
    .to_string()
    .into_bytes();
    let header_value = signer().signature_header(manual.now().timestamp(), &body);

    let event = gateway.process_webhook(&body, &header_value).unwrap();
    assert_eq!(event.event_id, "evt_rest_1");
    assert_eq!(event.provider_intent_id, "pi_300");
    assert_eq!(event.action, WebhookAction::MarkAsPaid);
    assert_eq!(event.amount, Some(dec!(12.50)));

    let other = WebhookSigner::new("whsec_someone_else", 300).unwrap();
    let forged = other.signature_header(manual.now().timestamp(), &body);
    assert_matches!(
        gateway.process_webhook(&body, &forged),
        Err(ProviderError::InvalidSignature(_))
    );
}
