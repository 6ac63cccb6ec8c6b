//! Tenant authorization for outbound calls.
//!
//! Tenant management lives outside the engine. Before any tenant-scoped
//! outbound call the dispatcher asks an [`AuthorizationGate`] a yes/no
//! question; a denial stops the call before it reaches the network.

use async_trait::async_trait;

/// Authorization backend failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Authorization check failed: {message}")]
pub struct AuthorizationError {
    pub message: String,
}

/// Boolean gate consulted before tenant-scoped outbound calls.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthorizationGate: Send + Sync {
    /// Whether `tenant_id` may call `endpoint` on `provider`.
    async fn is_authorized(
        &self,
        tenant_id: &str,
        provider: &str,
        endpoint: &str,
    ) -> Result<bool, AuthorizationError>;
}

/// Gate that authorizes everything, for deployments without tenancy.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllGate;

#[async_trait]
impl AuthorizationGate for AllowAllGate {
    async fn is_authorized(
        &self,
        _tenant_id: &str,
        _provider: &str,
        _endpoint: &str,
    ) -> Result<bool, AuthorizationError> {
        Ok(true)
    }
}
