use crate::{
    clock::SharedClock,
    config::AppConfig,
    errors::ServiceError,
    events::{Event, EventSender},
    models::{
        address::Address,
        cart::{Cart, CartLine, CartOwner, CartStatus, CartTotals},
    },
    repositories::VersionedStore,
    services::bounded,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::{
    product_catalog_service::CatalogLookup,
    totals::{TotalsCalculator, TotalsInput},
};

/// Upper bound for a single line, however the quantity was reached.
pub const MAX_LINE_QUANTITY: i64 = 10_000;

/// Shopping cart service.
///
/// Every mutation takes the version the caller last saw and fails with a
/// conflict if the cart moved on since. Totals are recomputed on every
/// mutation (pricing, shipping, tax) and are never written any other way.
///
/// # Examples
///
/// ```ignore
/// let cart = cart_service.create_cart(CreateCartInput {
///     session_id: Some("sess_123".to_string()),
///     ..Default::default()
/// }).await?;
///
/// let cart = cart_service
///     .add_item(cart.id, cart.version, AddToCartInput {
///         product_id,
///         variant_id: None,
///         quantity: 2,
///     })
///     .await?;
/// ```
#[derive(Clone)]
pub struct CartService {
    carts: Arc<VersionedStore<Cart>>,
    catalog: Arc<dyn CatalogLookup>,
    totals: TotalsCalculator,
    event_sender: Arc<EventSender>,
    clock: SharedClock,
    config: Arc<AppConfig>,
}

impl CartService {
    pub fn new(
        carts: Arc<VersionedStore<Cart>>,
        catalog: Arc<dyn CatalogLookup>,
        totals: TotalsCalculator,
        event_sender: Arc<EventSender>,
        clock: SharedClock,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            carts,
            catalog,
            totals,
            event_sender,
            clock,
            config,
        }
    }

    /// Creates an empty cart owned by a customer or, failing that, a guest
    /// session.
    #[instrument(skip(self))]
    pub async fn create_cart(&self, input: CreateCartInput) -> Result<Cart, ServiceError> {
        let owner = match (input.customer_id, input.session_id) {
            (Some(customer_id), _) => CartOwner::Customer { customer_id },
            (None, Some(session_id)) if !session_id.trim().is_empty() => {
                CartOwner::Guest { session_id }
            }
            _ => {
                return Err(ServiceError::ValidationError(
                    "A cart needs a customer id or a session id".to_string(),
                ))
            }
        };

        let now = self.clock.now();
        let cart = Cart {
            id: Uuid::new_v4(),
            owner,
            status: CartStatus::Active,
            currency: input
                .currency
                .unwrap_or_else(|| self.config.default_currency.clone()),
            lines: Vec::new(),
            coupon_code: None,
            shipping_address: None,
            billing_address: None,
            shipping_method: None,
            totals: CartTotals::zero(now),
            merged_into: None,
            version: 0,
            created_at: now,
            updated_at: now,
            expires_at: now + self.config.cart_ttl(),
        };

        let cart = self.carts.insert(cart)?;
        self.event_sender
            .send_or_log(Event::CartCreated(cart.id))
            .await;

        info!("Created cart: {}", cart.id);
        Ok(cart)
    }

    pub async fn get_cart(&self, cart_id: Uuid) -> Result<Cart, ServiceError> {
        self.carts.require(cart_id)
    }

    /// Adds a product, merging into an existing line for the same
    /// product/variant.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        cart_id: Uuid,
        expected_version: u64,
        input: AddToCartInput,
    ) -> Result<Cart, ServiceError> {
        input.validate()?;
        let product = bounded(
            self.config.lookup_timeout(),
            "catalog lookup",
            self.catalog.product(input.product_id, input.variant_id),
        )
        .await?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("Product {} not found", input.product_id))
        })?;

        self.mutate(cart_id, expected_version, |cart| {
            let key = product.key();
            match cart.lines.iter_mut().find(|l| l.key() == key) {
                Some(line) => line.quantity = combined_quantity(line.quantity, input.quantity)?,
                None => cart.lines.push(CartLine {
                    id: Uuid::new_v4(),
                    product_id: product.product_id,
                    variant_id: product.variant_id,
                    sku: product.sku.clone(),
                    name: product.name.clone(),
                    quantity: input.quantity,
                    unit_price: product.unit_price,
                    category_ids: product.category_ids.clone(),
                    tax_class: product.tax_class.clone(),
                }),
            }
            Ok(())
        })
        .await
    }

    /// Sets a line's quantity. Zero removes the line.
    #[instrument(skip(self))]
    pub async fn update_item_quantity(
        &self,
        cart_id: Uuid,
        expected_version: u64,
        line_id: Uuid,
        quantity: i64,
    ) -> Result<Cart, ServiceError> {
        if quantity < 0 {
            return Err(ServiceError::ValidationError(
                "Quantity cannot be negative".to_string(),
            ));
        }
        if quantity > MAX_LINE_QUANTITY {
            return Err(ServiceError::ValidationError(format!(
                "Quantity cannot exceed {}",
                MAX_LINE_QUANTITY
            )));
        }
        self.mutate(cart_id, expected_version, |cart| {
            let idx = line_index(cart, line_id)?;
            if quantity == 0 {
                cart.lines.remove(idx);
            } else {
                cart.lines[idx].quantity = quantity;
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        cart_id: Uuid,
        expected_version: u64,
        line_id: Uuid,
    ) -> Result<Cart, ServiceError> {
        self.mutate(cart_id, expected_version, |cart| {
            let idx = line_index(cart, line_id)?;
            cart.lines.remove(idx);
            Ok(())
        })
        .await
    }

    /// Applies a coupon. A coupon that does not apply is reported as
    /// `InvalidCoupon` and the cart is left exactly as it was.
    #[instrument(skip(self))]
    pub async fn apply_coupon(
        &self,
        cart_id: Uuid,
        expected_version: u64,
        code: String,
    ) -> Result<Cart, ServiceError> {
        let code = code.trim().to_ascii_uppercase();
        if code.is_empty() {
            return Err(ServiceError::ValidationError(
                "Coupon code is required".to_string(),
            ));
        }

        let mut draft = self.load_mutable(cart_id, expected_version)?;
        draft.coupon_code = Some(code);
        let (totals, rejection) = self.totals.compute(totals_input(&draft)).await?;
        if let Some(rejection) = rejection {
            info!(cart_id = %cart_id, %rejection, "Coupon rejected");
            return Err(ServiceError::InvalidCoupon(rejection));
        }
        draft.totals = totals;
        self.save(draft, expected_version)
    }

    #[instrument(skip(self))]
    pub async fn remove_coupon(
        &self,
        cart_id: Uuid,
        expected_version: u64,
    ) -> Result<Cart, ServiceError> {
        self.mutate(cart_id, expected_version, |cart| {
            cart.coupon_code = None;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, address))]
    pub async fn set_shipping_address(
        &self,
        cart_id: Uuid,
        expected_version: u64,
        address: Address,
    ) -> Result<Cart, ServiceError> {
        address.validate()?;
        self.mutate(cart_id, expected_version, |cart| {
            cart.shipping_address = Some(address);
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, address))]
    pub async fn set_billing_address(
        &self,
        cart_id: Uuid,
        expected_version: u64,
        address: Address,
    ) -> Result<Cart, ServiceError> {
        address.validate()?;
        self.mutate(cart_id, expected_version, |cart| {
            cart.billing_address = Some(address);
            Ok(())
        })
        .await
    }

    /// Chooses a shipping method. The method must serve the shipping address.
    #[instrument(skip(self))]
    pub async fn set_shipping_method(
        &self,
        cart_id: Uuid,
        expected_version: u64,
        method_code: String,
    ) -> Result<Cart, ServiceError> {
        let cart = self.load_mutable(cart_id, expected_version)?;
        let address = cart.shipping_address.as_ref().ok_or_else(|| {
            ServiceError::ValidationError("Set a shipping address first".to_string())
        })?;
        let merchandise = cart.totals.subtotal - cart.totals.discount_total;
        if self
            .totals
            .quote_shipping(address, &method_code, merchandise)
            .await?
            .is_none()
        {
            return Err(ServiceError::ValidationError(format!(
                "Shipping method '{}' is not available for {}",
                method_code, address.country_code
            )));
        }

        self.mutate(cart_id, expected_version, |cart| {
            cart.shipping_method = Some(method_code);
            Ok(())
        })
        .await
    }

    /// Folds a guest cart into the customer's active cart (creating one if
    /// needed). Quantities for the same product add up; the customer's own
    /// coupon wins over the guest's. The guest cart is kept as `Merged`.
    #[instrument(skip(self))]
    pub async fn merge_guest_cart(
        &self,
        guest_cart_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Cart, ServiceError> {
        let guest = self.carts.require(guest_cart_id)?;
        if !matches!(guest.owner, CartOwner::Guest { .. }) {
            return Err(ServiceError::ValidationError(format!(
                "Cart {} is not a guest cart",
                guest_cart_id
            )));
        }
        ensure_mutable(&guest)?;

        let target = match self.active_cart_for(customer_id) {
            Some(cart) => cart,
            None => {
                self.create_cart(CreateCartInput {
                    customer_id: Some(customer_id),
                    session_id: None,
                    currency: Some(guest.currency.clone()),
                })
                .await?
            }
        };

        let mut draft = target.clone();
        for line in &guest.lines {
            match draft.lines.iter_mut().find(|l| l.key() == line.key()) {
                Some(existing) => {
                    existing.quantity = combined_quantity(existing.quantity, line.quantity)?
                }
                None => draft.lines.push(CartLine {
                    id: Uuid::new_v4(),
                    ..line.clone()
                }),
            }
        }

        // claim the guest cart before saving so a concurrent edit cannot slip in
        let merged_at = self.clock.now();
        self.carts.update(guest.id, guest.version, |c| {
            c.status = CartStatus::Merged;
            c.merged_into = Some(target.id);
            c.updated_at = merged_at;
            Ok(())
        })?;
        if draft.coupon_code.is_none() {
            draft.coupon_code = guest.coupon_code.clone();
        }
        if draft.shipping_address.is_none() {
            draft.shipping_address = guest.shipping_address.clone();
        }

        let merged = match self.reprice(&mut draft).await {
            Ok(()) => self.save(draft, target.version),
            Err(e) => Err(e),
        };
        let merged = match merged {
            Ok(cart) => cart,
            Err(e) => {
                warn!(guest_cart_id = %guest.id, "Merge failed, reactivating guest cart: {}", e);
                let _ = self.carts.update_unchecked(guest.id, |c| {
                    c.status = CartStatus::Active;
                    c.merged_into = None;
                    Ok(())
                });
                return Err(e);
            }
        };

        self.event_sender
            .send_or_log(Event::CartMerged {
                guest_cart_id: guest.id,
                customer_cart_id: merged.id,
            })
            .await;
        info!("Merged guest cart {} into {}", guest.id, merged.id);
        Ok(merged)
    }

    #[instrument(skip(self))]
    pub async fn delete_cart(&self, cart_id: Uuid) -> Result<(), ServiceError> {
        let cart = self.carts.require(cart_id)?;
        if cart.status == CartStatus::CheckingOut {
            return Err(ServiceError::InvalidTransition(format!(
                "Cart {} is in checkout",
                cart_id
            )));
        }
        self.carts.remove(cart_id);
        self.event_sender
            .send_or_log(Event::CartDeleted(cart_id))
            .await;
        Ok(())
    }

    /// Deletes carts past their expiry. Carts in checkout are left alone;
    /// their session decides what happens to them.
    #[instrument(skip(self))]
    pub async fn sweep_expired_carts(&self, now: DateTime<Utc>) -> usize {
        let expired = self
            .carts
            .find(|c| c.expires_at <= now && c.status != CartStatus::CheckingOut);
        for cart in &expired {
            self.carts.remove(cart.id);
            self.event_sender
                .send_or_log(Event::CartDeleted(cart.id))
                .await;
        }
        if !expired.is_empty() {
            info!("Swept {} expired carts", expired.len());
        }
        expired.len()
    }

    /// Locks the cart for checkout. Returns the cart as snapshotted.
    pub(crate) fn begin_checkout(&self, cart_id: Uuid) -> Result<Cart, ServiceError> {
        let now = self.clock.now();
        self.carts.update_unchecked(cart_id, |cart| {
            ensure_mutable(cart)?;
            if cart.lines.is_empty() {
                return Err(ServiceError::ValidationError("Cart is empty".to_string()));
            }
            cart.status = CartStatus::CheckingOut;
            cart.updated_at = now;
            Ok(())
        })
    }

    /// Hands the cart back to the shopper after a cancelled checkout.
    pub(crate) fn end_checkout(&self, cart_id: Uuid, converted: bool) {
        let now = self.clock.now();
        let ttl = self.config.cart_ttl();
        let result = self.carts.update_unchecked(cart_id, |cart| {
            if cart.status == CartStatus::CheckingOut {
                cart.status = if converted {
                    CartStatus::Converted
                } else {
                    CartStatus::Active
                };
                cart.updated_at = now;
                cart.expires_at = now + ttl;
            }
            Ok(())
        });
        if let Err(e) = result {
            warn!(cart_id = %cart_id, "Could not release cart from checkout: {}", e);
        }
    }

    fn active_cart_for(&self, customer_id: Uuid) -> Option<Cart> {
        self.carts
            .find(|c| c.owner.customer_id() == Some(customer_id) && c.status == CartStatus::Active)
            .into_iter()
            .max_by_key(|c| c.updated_at)
    }

    fn load_mutable(&self, cart_id: Uuid, expected_version: u64) -> Result<Cart, ServiceError> {
        let cart = self.carts.require(cart_id)?;
        if cart.version != expected_version {
            return Err(ServiceError::ConcurrentModification {
                id: cart_id,
                expected: expected_version,
                actual: cart.version,
            });
        }
        ensure_mutable(&cart)?;
        Ok(cart)
    }

    async fn mutate<F>(
        &self,
        cart_id: Uuid,
        expected_version: u64,
        change: F,
    ) -> Result<Cart, ServiceError>
    where
        F: FnOnce(&mut Cart) -> Result<(), ServiceError>,
    {
        let mut draft = self.load_mutable(cart_id, expected_version)?;
        change(&mut draft)?;
        self.reprice(&mut draft).await?;
        self.save(draft, expected_version)
    }

    /// Recomputes totals. A stored coupon that no longer applies is dropped
    /// and the reason kept on the totals.
    async fn reprice(&self, draft: &mut Cart) -> Result<(), ServiceError> {
        let (totals, rejection) = self.totals.compute(totals_input(draft)).await?;
        if let (Some(rejection), Some(code)) = (rejection, draft.coupon_code.as_ref()) {
            info!(cart_id = %draft.id, code = %code, %rejection, "Dropping coupon that no longer applies");
            draft.coupon_code = None;
            let (mut totals, _) = self.totals.compute(totals_input(draft)).await?;
            totals.coupon_rejection = Some(rejection);
            draft.totals = totals;
        } else {
            draft.totals = totals;
        }
        Ok(())
    }

    fn save(&self, mut draft: Cart, expected_version: u64) -> Result<Cart, ServiceError> {
        let now = self.clock.now();
        draft.updated_at = now;
        draft.expires_at = now + self.config.cart_ttl();
        self.carts.update(draft.id, expected_version, move |cart| {
            ensure_mutable(cart)?;
            *cart = draft;
            Ok(())
        })
    }
}

fn totals_input(cart: &Cart) -> TotalsInput<'_> {
    TotalsInput {
        lines: &cart.lines,
        coupon_code: cart.coupon_code.as_deref(),
        shipping_address: cart.shipping_address.as_ref(),
        shipping_method: cart.shipping_method.as_deref(),
        exemption: None,
    }
}

fn ensure_mutable(cart: &Cart) -> Result<(), ServiceError> {
    if cart.is_mutable() {
        Ok(())
    } else {
        Err(ServiceError::InvalidTransition(format!(
            "Cart {} is {} and cannot be changed",
            cart.id, cart.status
        )))
    }
}

/// Quantity for a line that already holds `current` units after adding `added`.
fn combined_quantity(current: i64, added: i64) -> Result<i64, ServiceError> {
    current
        .checked_add(added)
        .filter(|total| (1..=MAX_LINE_QUANTITY).contains(total))
        .ok_or_else(|| {
            ServiceError::ValidationError(format!(
                "Line quantity cannot exceed {}",
                MAX_LINE_QUANTITY
            ))
        })
}

fn line_index(cart: &Cart, line_id: Uuid) -> Result<usize, ServiceError> {
    cart.lines
        .iter()
        .position(|l| l.id == line_id)
        .ok_or_else(|| ServiceError::NotFound(format!("Cart line {} not found", line_id)))
}

/// Input for creating a cart
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CreateCartInput {
    pub session_id: Option<String>,
    pub customer_id: Option<Uuid>,
    pub currency: Option<String>,
}

/// Input for adding item to cart
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AddToCartInput {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    #[validate(range(min = 1, max = 10000))]
    pub quantity: i64,
}
