//! Configuration-driven forwarding of inbound events to providers.
//!
//! A [`RouteConfig`] says "events of this type, optionally only from this
//! source provider, are POSTed to this endpoint of that target provider".
//! All routes for one event type are served by a single [`ForwardingHandler`]
//! that fans the payload out to every matching target.
//!
//! Each target call uses an operation id derived from the event key and the
//! route, so when a partially delivered event is retried the targets that
//! already succeeded see the same idempotency key again.
//!
//! Target calls are single-attempt. A transient target failure fails the
//! handler attempt and the dispatcher's retry loop owns the backoff, so
//! retries never nest.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::handler::{EventHandler, HandlerContext, HandlerError, HandlerRegistry};
use super::outbound::OutboundRequest;
use crate::event_store::InboundEvent;
use crate::provider::{validate_relative_path, Provider, ProviderRegistry};
use crate::ValidationError;

/// One forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteConfig {
    /// Inbound event type this route applies to
    pub event_type: String,

    /// Only forward events received from this provider; any provider when absent
    #[serde(default)]
    pub source: Option<String>,

    /// Provider the event is forwarded to
    pub target: String,

    /// Endpoint path on the target, relative to its base URL
    pub endpoint: String,
}

impl RouteConfig {
    fn applies_to(&self, source: &str) -> bool {
        self.source.as_deref().map_or(true, |s| s == source)
    }

    fn validate(&self, providers: &ProviderRegistry) -> Result<(), ValidationError> {
        if self.event_type.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "routes.event_type".to_string(),
            });
        }
        if providers.get(&self.target).is_none() {
            return Err(ValidationError::InvalidFormat {
                field: "routes.target".to_string(),
                message: format!("unknown provider '{}'", self.target),
            });
        }
        if let Some(source) = &self.source {
            if providers.get(source).is_none() {
                return Err(ValidationError::InvalidFormat {
                    field: "routes.source".to_string(),
                    message: format!("unknown provider '{}'", source),
                });
            }
        }
        validate_relative_path(&self.endpoint).map_err(|message| {
            ValidationError::InvalidFormat {
                field: "routes.endpoint".to_string(),
                message,
            }
        })?;
        Ok(())
    }
}

/// Forwards an event's JSON payload to every route that applies to it.
#[derive(Debug, Clone)]
pub struct ForwardingHandler {
    routes: Vec<RouteConfig>,
    /// Sum of the target timeouts, one attempt per route
    outbound_budget: Duration,
}

impl ForwardingHandler {
    pub fn new(routes: Vec<RouteConfig>) -> Self {
        Self {
            routes,
            outbound_budget: Duration::ZERO,
        }
    }

    /// Extend the invocation deadline by the timeout of every route target.
    pub fn with_target_timeouts(mut self, providers: &ProviderRegistry) -> Self {
        self.outbound_budget = self
            .routes
            .iter()
            .filter_map(|route| providers.get(&route.target))
            .map(|target| target.timeout)
            .sum();
        self
    }

    pub fn routes(&self) -> &[RouteConfig] {
        &self.routes
    }
}

#[async_trait]
impl EventHandler for ForwardingHandler {
    async fn handle(&self, event: &InboundEvent, ctx: &HandlerContext) -> Result<(), HandlerError> {
        let payload: serde_json::Value = serde_json::from_slice(&event.raw_payload)
            .map_err(|e| HandlerError::validation(format!("payload is not JSON: {}", e)))?;

        let mut forwarded = 0;
        for route in self.routes.iter().filter(|r| r.applies_to(&event.key.provider)) {
            let request = OutboundRequest::new(&route.target, &route.endpoint, payload.clone())
                .with_operation_id(format!("{}:{}{}", event.key, route.target, route.endpoint))
                .single_attempt();
            ctx.outbound.send(request).await?;
            forwarded += 1;
        }

        if forwarded == 0 {
            return Err(HandlerError::validation(format!(
                "no route for event type '{}' from provider '{}'",
                event.event_type, event.key.provider
            )));
        }

        debug!(
            event = %event.key,
            targets = forwarded,
            "Event forwarded"
        );
        Ok(())
    }

    fn timeout(&self, source: &Provider) -> Duration {
        source.timeout + self.outbound_budget
    }
}

impl HandlerRegistry {
    /// Register a [`ForwardingHandler`] for every event type named in `routes`.
    ///
    /// Every source and target must be a registered provider. Routes replace
    /// any handler previously registered for the same event type.
    pub fn with_routes(
        self,
        routes: &[RouteConfig],
        providers: &ProviderRegistry,
    ) -> Result<Self, ValidationError> {
        let mut by_type: BTreeMap<&str, Vec<RouteConfig>> = BTreeMap::new();
        for route in routes {
            route.validate(providers)?;
            by_type
                .entry(route.event_type.as_str())
                .or_default()
                .push(route.clone());
        }

        Ok(by_type
            .into_iter()
            .fold(self, |registry, (event_type, routes)| {
                let handler = ForwardingHandler::new(routes).with_target_timeouts(providers);
                registry.register(event_type, Arc::new(handler))
            }))
    }
}

#[cfg(test)]
#[path = "routing_tests.rs"]
mod tests;
