use std::future::Future;
use std::time::Duration;

use crate::errors::ServiceError;

// Cart, pricing and checkout
pub mod commerce;

// Stock holds
pub mod inventory_reservation_service;

// Payment intents and provider adapters
pub mod payments;

// Order lifecycle
pub mod orders;

// Service factory for dependency injection
pub mod factory;

/// Runs a collaborator call under a deadline. A timeout is reported as the
/// collaborator being unavailable.
pub(crate) async fn bounded<T, F>(
    timeout: Duration,
    collaborator: &str,
    call: F,
) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::ProviderUnavailable(format!(
            "{} did not answer within {:?}",
            collaborator, timeout
        ))),
    }
}
