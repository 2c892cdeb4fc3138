//! Commerce core library
//!
//! Cart pricing, stock reservation, checkout, payment reconciliation and the
//! order lifecycle, served over an axum HTTP surface.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod clock;
pub mod config;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod models;
pub mod notifications;
pub mod repositories;
pub mod services;
pub mod tracing;
pub mod webhooks;

use axum::{middleware, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::events::EventSender;
use crate::services::factory::ServiceContainer;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub event_sender: Arc<EventSender>,
    pub services: ServiceContainer,
}

impl AppState {
    pub fn new(services: ServiceContainer, event_sender: Arc<EventSender>) -> Self {
        Self {
            config: services.config.clone(),
            event_sender,
            services,
        }
    }
}

/// Versioned API routes
pub fn api_v1_routes() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/carts", handlers::carts_routes())
        .nest("/checkout", handlers::checkout_routes())
        .nest("/orders", handlers::orders_routes())
        .nest("/payments", handlers::payment_webhook_routes())
}

/// Full application router with request ids and request spans.
pub fn app_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/health", handlers::health_routes())
        .nest("/api/v1", api_v1_routes())
        .layer(TraceLayer::new_for_http().make_span_with(crate::tracing::RequestSpanMaker))
        .layer(middleware::from_fn(crate::tracing::request_id_middleware))
        .with_state(state)
}
