//! HTTP surface tests: the full router driven with `oneshot`.

mod common;

use axum::{
    body::{self, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use commerce_core::{
    app_router,
    models::{
        cart::Cart,
        checkout::{CheckoutSession, CheckoutStep},
        order::{Order, OrderPaymentStatus, OrderStatus},
    },
    webhooks::SIGNATURE_HEADER,
};
use common::{address, Harness, COUPON, STANDARD_SHIPPING};
use rust_decimal_macros::dec;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

struct TestApp {
    harness: Harness,
    router: Router,
}

impl TestApp {
    fn new() -> Self {
        let harness = Harness::new();
        let router = app_router(harness.app_state());
        Self { harness, router }
    }

    async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body bytes");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json response")
        };
        (status, json)
    }

    async fn webhook(&self, body: Vec<u8>, signature: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/webhook")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        let response = self
            .router
            .clone()
            .oneshot(builder.body(Body::from(body)).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }
}

fn parse<T: DeserializeOwned>(value: Value) -> T {
    serde_json::from_value(value).expect("typed response")
}

async fn cart_with_two_of_a(app: &TestApp) -> Cart {
    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/carts",
            Some(json!({ "session_id": "guest-api" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let cart: Cart = parse(body);

    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/v1/carts/{}/items", cart.id),
            Some(json!({
                "expected_version": cart.version,
                "product_id": app.harness.product_a,
                "quantity": 2
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    parse(body)
}

async fn session_at_payment(app: &TestApp, cart: &Cart) -> CheckoutSession {
    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({ "cart_id": cart.id })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let session: CheckoutSession = parse(body);
    let base = format!("/api/v1/checkout/{}", session.id);

    let (_, body) = app
        .request(
            Method::PUT,
            &format!("{}/email", base),
            Some(json!({ "expected_version": session.version, "email": "buyer@example.com" })),
        )
        .await;
    let session: CheckoutSession = parse(body);
    let (_, body) = app
        .request(
            Method::PUT,
            &format!("{}/shipping-address", base),
            Some(json!({ "expected_version": session.version, "address": address() })),
        )
        .await;
    let session: CheckoutSession = parse(body);
    let (_, body) = app
        .request(
            Method::PUT,
            &format!("{}/shipping-method", base),
            Some(json!({ "expected_version": session.version, "method_code": STANDARD_SHIPPING })),
        )
        .await;
    let session: CheckoutSession = parse(body);

    let (status, body) = app
        .request(
            Method::POST,
            &format!("{}/advance", base),
            Some(json!({ "expected_version": session.version })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let session: CheckoutSession = parse(body);
    let (status, body) = app
        .request(
            Method::POST,
            &format!("{}/advance", base),
            Some(json!({ "expected_version": session.version })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let session: CheckoutSession = parse(body);
    assert_eq!(session.step, CheckoutStep::Payment);
    session
}

#[tokio::test]
async fn test_health_reports_provider() {
    let app = TestApp::new();
    let (status, body) = app.request(Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "up");
    assert_eq!(body["payment_provider"], "mock");

    let (status, body) = app.request(Method::GET, "/health/live", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "up");
}

#[tokio::test]
async fn test_checkout_over_http() {
    let app = TestApp::new();
    app.harness.stock(app.harness.product_a, 5);
    let cart = cart_with_two_of_a(&app).await;

    let (status, body) = app
        .request(
            Method::PUT,
            &format!("/api/v1/carts/{}/coupon", cart.id),
            Some(json!({ "expected_version": cart.version, "code": COUPON })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let cart: Cart = parse(body);
    assert_eq!(cart.totals.discount_total, dec!(10.00));

    let session = session_at_payment(&app, &cart).await;
    assert_eq!(session.totals.grand_total, dec!(102.20));
    let base = format!("/api/v1/checkout/{}", session.id);

    let (status, body) = app
        .request(
            Method::POST,
            &format!("{}/payment", base),
            Some(json!({ "expected_version": session.version, "payment_method": "pm_card_visa" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["payment_intent"]["status"], "captured");
    let session: CheckoutSession = parse(body["session"].clone());

    let (_, body) = app
        .request(
            Method::POST,
            &format!("{}/advance", base),
            Some(json!({ "expected_version": session.version })),
        )
        .await;
    let session: CheckoutSession = parse(body);
    assert_eq!(session.step, CheckoutStep::Review);

    let (status, body) = app
        .request(
            Method::POST,
            &format!("{}/complete", base),
            Some(json!({ "expected_version": session.version })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let session: CheckoutSession = parse(body);
    assert_eq!(session.step, CheckoutStep::Complete);
    let order_id = session.order_id.unwrap();

    let (status, body) = app
        .request(Method::GET, &format!("/api/v1/orders/{}", order_id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let order: Order = parse(body);
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.payment_status, OrderPaymentStatus::Paid);
    assert_eq!(order.totals.grand_total, dec!(102.20));

    // by order number as well
    let (status, body) = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", order.order_number),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], json!(order.id));

    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{}/process", order.id),
            Some(json!({})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "processing");
    assert_eq!(app.harness.on_hand(app.harness.product_a), 3);
}

#[tokio::test]
async fn test_not_found_carries_request_id() {
    let app = TestApp::new();
    let request = Request::builder()
        .method(Method::GET)
        .uri(format!("/api/v1/carts/{}", Uuid::new_v4()))
        .header("x-request-id", "req-api-test")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.headers().get("x-request-id").unwrap(),
        "req-api-test"
    );
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["code"], "not_found");
    assert_eq!(body["request_id"], "req-api-test");
}

#[tokio::test]
async fn test_error_statuses() {
    let app = TestApp::new();
    app.harness.stock(app.harness.product_a, 5);
    let cart = cart_with_two_of_a(&app).await;

    // stale version
    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/v1/carts/{}/items", cart.id),
            Some(json!({
                "expected_version": cart.version - 1,
                "product_id": app.harness.product_a,
                "quantity": 1
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "stale_version");

    // request validation
    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/v1/carts/{}/items", cart.id),
            Some(json!({
                "expected_version": cart.version,
                "product_id": app.harness.product_a,
                "quantity": 0
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");

    // unknown coupon
    let (status, body) = app
        .request(
            Method::PUT,
            &format!("/api/v1/carts/{}/coupon", cart.id),
            Some(json!({ "expected_version": cart.version, "code": "NOPE" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_coupon");
}

#[tokio::test]
async fn test_stock_conflict_is_unprocessable() {
    let app = TestApp::new();
    app.harness.stock(app.harness.product_a, 2);
    let cart = cart_with_two_of_a(&app).await;
    // someone else takes a unit first
    app.harness.services.ledger.adjust_stock(
        commerce_core::models::reservation::StockKey::new(app.harness.product_a, None),
        -1,
    )
    .unwrap();

    let session = app.harness.checkout_at_shipping(cart.id).await;
    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/v1/checkout/{}/advance", session.id),
            Some(json!({ "expected_version": session.version })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "insufficient_stock");
    assert_eq!(body["details"][0]["requested"], 2);
    assert_eq!(body["details"][0]["available"], 1);
}

#[tokio::test]
async fn test_webhook_ingress() {
    let app = TestApp::new();
    app.harness.stock(app.harness.product_a, 5);
    let cart = cart_with_two_of_a(&app).await;
    let session = session_at_payment(&app, &cart).await;
    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/v1/checkout/{}/payment", session.id),
            Some(json!({ "expected_version": session.version })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let provider_intent_id = body["payment_intent"]["provider_intent_id"]
        .as_str()
        .unwrap()
        .to_string();

    let (body, signature) = app.harness.provider.signed_event(
        "payment_intent.succeeded",
        &provider_intent_id,
        Some(dec!(113.00)),
    );

    let (status, _) = app.webhook(body.clone(), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, response) = app.webhook(body.clone(), Some(&signature)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["outcome"], "applied");

    let (status, response) = app.webhook(body, Some(&signature)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["outcome"], "duplicate");

    let (body, signature) =
        app.harness
            .provider
            .signed_event("invoice.paid", &provider_intent_id, None);
    let (status, response) = app.webhook(body, Some(&signature)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["code"], "invalid_payload");

    let (_, body) = app
        .request(Method::GET, &format!("/api/v1/checkout/{}", session.id), None)
        .await;
    let session: CheckoutSession = parse(body);
    assert_eq!(session.step, CheckoutStep::Complete);
    assert!(session.order_id.is_some());
}
