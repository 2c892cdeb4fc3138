// Value types
pub mod address;
pub mod money;

// Collaborator views
pub mod catalog;
pub mod discount;
pub mod shipping;
pub mod tax;

// Transaction records
pub mod cart;
pub mod checkout;
pub mod order;
pub mod payment;
pub mod reservation;

pub use address::Address;
pub use cart::{Cart, CartLine, CartOwner, CartStatus, CartTotals};
pub use checkout::{CheckoutSession, CheckoutStep};
pub use order::{Order, OrderPaymentStatus, OrderStatus};
pub use payment::{PaymentIntent, PaymentStatus, WebhookAction, WebhookEvent, WebhookOutcome};
pub use reservation::{ReservationStatus, StockKey, StockReservation, StockShortage};
