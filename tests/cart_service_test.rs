mod common;

use assert_matches::assert_matches;
use chrono::Duration;
use commerce_core::{
    clock::Clock,
    errors::ServiceError,
    events::Event,
    models::{
        cart::{CartOwner, CartStatus},
        discount::CouponRejectionReason,
    },
    services::commerce::{cart_service::MAX_LINE_QUANTITY, AddToCartInput, CreateCartInput},
};
use common::{address, Harness, COUPON, STANDARD_SHIPPING};
use rust_decimal_macros::dec;
use uuid::Uuid;

fn item(product_id: Uuid, quantity: i64) -> AddToCartInput {
    AddToCartInput {
        product_id,
        variant_id: None,
        quantity,
    }
}

#[tokio::test]
async fn test_create_cart() {
    let h = Harness::new();
    let customer_id = Uuid::new_v4();

    let cart = h
        .services
        .carts
        .create_cart(CreateCartInput {
            customer_id: Some(customer_id),
            session_id: Some("sess_ignored".to_string()),
            currency: None,
        })
        .await
        .unwrap();

    assert_eq!(cart.owner, CartOwner::Customer { customer_id });
    assert_eq!(cart.status, CartStatus::Active);
    assert_eq!(cart.currency, "USD");
    assert_eq!(cart.version, 0);
    assert!(cart.lines.is_empty());
    assert_eq!(cart.totals.grand_total, dec!(0));
    assert!(h.drain_events().contains(&Event::CartCreated(cart.id)));
}

#[tokio::test]
async fn test_create_cart_requires_an_owner() {
    let h = Harness::new();
    assert_matches!(
        h.services.carts.create_cart(CreateCartInput::default()).await,
        Err(ServiceError::ValidationError(_))
    );
    assert_matches!(
        h.services
            .carts
            .create_cart(CreateCartInput {
                session_id: Some("  ".to_string()),
                ..Default::default()
            })
            .await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn test_add_existing_item_increments_quantity() {
    let h = Harness::new();
    let cart = h.cart_with(&[(h.product_a, 1)], None).await;

    let cart = h
        .services
        .carts
        .add_item(cart.id, cart.version, item(h.product_a, 2))
        .await
        .unwrap();

    assert_eq!(cart.lines.len(), 1);
    assert_eq!(cart.lines[0].quantity, 3);
    assert_eq!(cart.lines[0].unit_price, dec!(50.00));
    assert_eq!(cart.totals.subtotal, dec!(150.00));
}

#[tokio::test]
async fn test_add_unknown_product_fails() {
    let h = Harness::new();
    let cart = h.cart_with(&[], None).await;

    assert_matches!(
        h.services
            .carts
            .add_item(cart.id, cart.version, item(Uuid::new_v4(), 1))
            .await,
        Err(ServiceError::NotFound(_))
    );
    assert_matches!(
        h.services
            .carts
            .add_item(cart.id, cart.version, item(h.product_a, 0))
            .await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn test_stale_cart_version_is_rejected() {
    let h = Harness::new();
    let cart = h.cart_with(&[(h.product_a, 1)], None).await;
    let carts = &h.services.carts;

    carts
        .add_item(cart.id, cart.version, item(h.product_b, 1))
        .await
        .unwrap();

    assert_matches!(
        carts.add_item(cart.id, cart.version, item(h.product_b, 1)).await,
        Err(ServiceError::ConcurrentModification { expected, actual, .. })
            if expected == cart.version && actual == cart.version + 1
    );
    let current = carts.get_cart(cart.id).await.unwrap();
    assert_eq!(current.lines.len(), 2);
}

#[tokio::test]
async fn test_update_item_quantity_to_zero_removes_item() {
    let h = Harness::new();
    let cart = h
        .cart_with(&[(h.product_a, 1), (h.product_b, 1)], None)
        .await;
    let carts = &h.services.carts;
    let line_b = cart.lines[1].id;

    let cart = carts
        .update_item_quantity(cart.id, cart.version, line_b, 4)
        .await
        .unwrap();
    assert_eq!(cart.line(line_b).unwrap().quantity, 4);
    assert_eq!(cart.totals.subtotal, dec!(130.00));

    let cart = carts
        .update_item_quantity(cart.id, cart.version, line_b, 0)
        .await
        .unwrap();
    assert!(cart.line(line_b).is_none());
    assert_eq!(cart.totals.subtotal, dec!(50.00));

    assert_matches!(
        carts
            .update_item_quantity(cart.id, cart.version, cart.lines[0].id, -1)
            .await,
        Err(ServiceError::ValidationError(_))
    );
    assert_matches!(
        carts.remove_item(cart.id, cart.version, line_b).await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn test_line_quantity_is_capped() {
    let h = Harness::new();
    let cart = h.cart_with(&[(h.product_a, 1)], None).await;
    let carts = &h.services.carts;
    let line_a = cart.lines[0].id;

    assert_matches!(
        carts
            .update_item_quantity(cart.id, cart.version, line_a, 1_000_000_000_000_000_000)
            .await,
        Err(ServiceError::ValidationError(_))
    );
    assert_matches!(
        carts
            .update_item_quantity(cart.id, cart.version, line_a, MAX_LINE_QUANTITY + 1)
            .await,
        Err(ServiceError::ValidationError(_))
    );
    assert_matches!(
        carts
            .add_item(cart.id, cart.version, item(h.product_a, MAX_LINE_QUANTITY))
            .await,
        Err(ServiceError::ValidationError(_))
    );

    let current = carts.get_cart(cart.id).await.unwrap();
    assert_eq!(current.version, cart.version);
    assert_eq!(current.lines[0].quantity, 1);
    assert_eq!(current.totals.subtotal, dec!(50.00));

    let cart = carts
        .update_item_quantity(cart.id, cart.version, line_a, MAX_LINE_QUANTITY)
        .await
        .unwrap();
    assert_eq!(cart.totals.subtotal, dec!(500000.00));
}

#[tokio::test]
async fn test_merge_over_line_limit_keeps_guest_cart() {
    let h = Harness::new();
    let carts = &h.services.carts;
    let customer_id = Uuid::new_v4();

    let customer_cart = carts
        .create_cart(CreateCartInput {
            customer_id: Some(customer_id),
            ..Default::default()
        })
        .await
        .unwrap();
    let customer_cart = carts
        .add_item(customer_cart.id, customer_cart.version, item(h.product_a, 6_000))
        .await
        .unwrap();
    let guest = h.cart_with(&[(h.product_a, 6_000)], None).await;

    assert_matches!(
        carts.merge_guest_cart(guest.id, customer_id).await,
        Err(ServiceError::ValidationError(_))
    );

    let guest_now = carts.get_cart(guest.id).await.unwrap();
    assert_eq!(guest_now.status, CartStatus::Active);
    assert_eq!(guest_now.version, guest.version);
    let customer_now = carts.get_cart(customer_cart.id).await.unwrap();
    assert_eq!(customer_now.version, customer_cart.version);
    assert_eq!(customer_now.lines[0].quantity, 6_000);
}

#[tokio::test]
async fn test_coupon_is_case_insensitive_and_removable() {
    let h = Harness::new();
    let cart = h.cart_with(&[(h.product_a, 2)], None).await;
    let carts = &h.services.carts;

    let cart = carts
        .apply_coupon(cart.id, cart.version, COUPON.to_lowercase())
        .await
        .unwrap();
    assert_eq!(cart.coupon_code.as_deref(), Some(COUPON));
    assert_eq!(cart.totals.subtotal, dec!(100.00));
    assert_eq!(cart.totals.discount_total, dec!(10.00));
    let allocated: rust_decimal::Decimal =
        cart.totals.allocations.iter().map(|a| a.discount).sum();
    assert_eq!(allocated, dec!(10.00));

    let cart = carts.remove_coupon(cart.id, cart.version).await.unwrap();
    assert_eq!(cart.coupon_code, None);
    assert_eq!(cart.totals.discount_total, dec!(0));
}

#[tokio::test]
async fn test_rejected_coupon_leaves_cart_untouched() {
    let h = Harness::new();
    let cart = h.cart_with(&[(h.product_a, 1)], None).await;

    let err = h
        .services
        .carts
        .apply_coupon(cart.id, cart.version, "BOGUS".to_string())
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::InvalidCoupon(ref rejection)
            if rejection.reason == CouponRejectionReason::NotFound
    );

    let current = h.services.carts.get_cart(cart.id).await.unwrap();
    assert_eq!(current.version, cart.version);
    assert_eq!(current.coupon_code, None);
}

#[tokio::test]
async fn test_totals_include_shipping_and_tax_once_addressed() {
    let h = Harness::new();
    let cart = h.cart_with(&[(h.product_a, 2)], Some(COUPON)).await;
    let carts = &h.services.carts;

    assert_matches!(
        carts
            .set_shipping_method(cart.id, cart.version, STANDARD_SHIPPING.to_string())
            .await,
        Err(ServiceError::ValidationError(_))
    );

    let cart = carts
        .set_shipping_address(cart.id, cart.version, address())
        .await
        .unwrap();
    assert_matches!(
        carts
            .set_shipping_method(cart.id, cart.version, "teleport".to_string())
            .await,
        Err(ServiceError::ValidationError(_))
    );
    let cart = carts
        .set_shipping_method(cart.id, cart.version, STANDARD_SHIPPING.to_string())
        .await
        .unwrap();

    assert_eq!(cart.totals.subtotal, dec!(100.00));
    assert_eq!(cart.totals.discount_total, dec!(10.00));
    assert_eq!(cart.totals.shipping_total, dec!(5.00));
    assert_eq!(cart.totals.tax_total, dec!(7.20));
    assert_eq!(cart.totals.grand_total, dec!(102.20));
}

#[tokio::test]
async fn test_invalid_address_is_rejected() {
    let h = Harness::new();
    let cart = h.cart_with(&[(h.product_a, 1)], None).await;
    let mut bad = address();
    bad.country_code = String::new();

    assert_matches!(
        h.services
            .carts
            .set_billing_address(cart.id, cart.version, bad)
            .await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn test_merge_guest_cart_into_customer_cart() {
    let h = Harness::new();
    let carts = &h.services.carts;
    let customer_id = Uuid::new_v4();

    let customer_cart = carts
        .create_cart(CreateCartInput {
            customer_id: Some(customer_id),
            ..Default::default()
        })
        .await
        .unwrap();
    let customer_cart = carts
        .add_item(customer_cart.id, customer_cart.version, item(h.product_a, 2))
        .await
        .unwrap();
    carts
        .add_item(customer_cart.id, customer_cart.version, item(h.product_b, 1))
        .await
        .unwrap();

    let guest = h.cart_with(&[(h.product_a, 1)], Some(COUPON)).await;
    let merged = carts.merge_guest_cart(guest.id, customer_id).await.unwrap();

    assert_eq!(merged.id, customer_cart.id);
    assert_eq!(merged.item_count(), 4);
    let line_a = merged
        .lines
        .iter()
        .find(|l| l.product_id == h.product_a)
        .unwrap();
    assert_eq!(line_a.quantity, 3);
    assert_eq!(merged.coupon_code.as_deref(), Some(COUPON));
    assert_eq!(merged.totals.subtotal, dec!(170.00));
    assert_eq!(merged.totals.discount_total, dec!(17.00));

    let guest = carts.get_cart(guest.id).await.unwrap();
    assert_eq!(guest.status, CartStatus::Merged);
    assert_eq!(guest.merged_into, Some(merged.id));
    assert_matches!(
        carts.add_item(guest.id, guest.version, item(h.product_b, 1)).await,
        Err(ServiceError::InvalidTransition(_))
    );

    assert_matches!(
        carts.merge_guest_cart(merged.id, customer_id).await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn test_merge_creates_customer_cart_when_missing() {
    let h = Harness::new();
    let guest = h.cart_with(&[(h.product_b, 2)], None).await;
    let customer_id = Uuid::new_v4();

    let merged = h
        .services
        .carts
        .merge_guest_cart(guest.id, customer_id)
        .await
        .unwrap();
    assert_ne!(merged.id, guest.id);
    assert_eq!(merged.owner.customer_id(), Some(customer_id));
    assert_eq!(merged.item_count(), 2);
}

#[tokio::test]
async fn test_expired_carts_are_swept() {
    let h = Harness::new();
    let stale = h.cart_with(&[(h.product_a, 1)], None).await;
    h.clock
        .advance(h.services.config.cart_ttl() - Duration::minutes(1));
    let fresh = h.cart_with(&[(h.product_b, 1)], None).await;
    h.clock.advance(Duration::minutes(2));

    let swept = h.services.carts.sweep_expired_carts(h.services.clock.now()).await;
    assert_eq!(swept, 1);
    assert_matches!(
        h.services.carts.get_cart(stale.id).await,
        Err(ServiceError::NotFound(_))
    );
    assert!(h.services.carts.get_cart(fresh.id).await.is_ok());
}

#[tokio::test]
async fn test_delete_cart() {
    let h = Harness::new();
    let cart = h.cart_with(&[(h.product_a, 1)], None).await;
    h.drain_events();

    h.services.carts.delete_cart(cart.id).await.unwrap();
    assert!(h.drain_events().contains(&Event::CartDeleted(cart.id)));
    assert_matches!(
        h.services.carts.delete_cart(cart.id).await,
        Err(ServiceError::NotFound(_))
    );
}
