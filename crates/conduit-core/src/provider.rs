//! Provider catalogue.
//!
//! A [`ProviderRegistry`] is built once from configuration and shared by
//! reference with every component that needs per-provider settings. Each
//! [`Provider`] is immutable for the lifetime of the registry; reconfiguring
//! means building a new registry and handing it to freshly built components.
//!
//! # Examples
//!
//! ```rust
//! use conduit_core::provider::{ProviderConfig, ProviderRegistry};
//!
//! let registry = ProviderRegistry::from_configs(vec![ProviderConfig::new(
//!     "user_service",
//!     "https://users.example.com",
//!     "webhook-secret",
//! )])
//! .unwrap();
//!
//! let provider = registry.get("user_service").unwrap();
//! assert_eq!(provider.max_retries, 3);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::ValidationError;

const MAX_PROVIDER_NAME_LENGTH: usize = 64;

// ============================================================================
// ProviderName
// ============================================================================

/// URL-safe provider name.
///
/// Names consist of lowercase ASCII letters, digits, `-` and `_`, because they
/// appear verbatim in the webhook path `POST /webhooks/{provider}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderName(String);

impl ProviderName {
    /// Create a provider name, validating its characters.
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let s = value.into();
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "provider.name".to_string(),
            });
        }

        if s.len() > MAX_PROVIDER_NAME_LENGTH {
            return Err(ValidationError::TooLong {
                field: "provider.name".to_string(),
                max_length: MAX_PROVIDER_NAME_LENGTH,
            });
        }

        if !s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(ValidationError::InvalidCharacters {
                field: "provider.name".to_string(),
                invalid_chars: "use lowercase alphanumeric, hyphens, or underscores".to_string(),
            });
        }

        Ok(Self(s))
    }

    /// Return the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// SecretString
// ============================================================================

/// Credential held in memory that is wiped on drop and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Get the secret for immediate use. Do not store the result.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    /// Check if the secret is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<REDACTED>")
    }
}

// ============================================================================
// AuthType
// ============================================================================

/// How outbound calls to a provider are authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// Static key sent in the `X-Api-Key` header.
    ApiKey,
    /// Bearer token sent in the `Authorization` header.
    #[serde(rename = "oauth2")]
    OAuth2,
    /// Request body signed with the provider's shared secret.
    #[default]
    Hmac,
}

impl AuthType {
    /// Whether this auth type requires `api_credential` to be configured.
    pub fn requires_credential(&self) -> bool {
        matches!(self, Self::ApiKey | Self::OAuth2)
    }
}

// ============================================================================
// ProviderConfig
// ============================================================================

/// Provider settings as they appear in configuration files.
///
/// Durations are integer milliseconds so that they map cleanly onto YAML and
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider name
    pub name: String,

    /// Base URL for outbound calls
    pub base_url: String,

    /// Shared secret used to verify inbound webhook signatures
    pub webhook_secret: SecretString,

    /// Outbound authentication scheme
    #[serde(default)]
    pub auth_type: AuthType,

    /// API key or bearer token for `api_key` / `oauth2` auth
    #[serde(default)]
    pub api_credential: Option<SecretString>,

    /// Per-call deadline in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Total attempts before an event is dead-lettered or a call gives up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff base in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Consecutive failures that trip the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the circuit stays open before a trial call, in milliseconds
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,

    /// Inactive providers reject webhooks and outbound calls
    #[serde(default = "default_is_active")]
    pub is_active: bool,

    /// Path probed by the health monitor, relative to `base_url`
    #[serde(default)]
    pub health_probe_path: Option<String>,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    60_000
}

fn default_backoff_cap_ms() -> u64 {
    300_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_duration_ms() -> u64 {
    30_000
}

fn default_is_active() -> bool {
    true
}

impl ProviderConfig {
    /// Create a config with default resilience settings.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        webhook_secret: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            webhook_secret: SecretString::new(webhook_secret),
            auth_type: AuthType::default(),
            api_credential: None,
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            failure_threshold: default_failure_threshold(),
            open_duration_ms: default_open_duration_ms(),
            is_active: default_is_active(),
            health_probe_path: None,
        }
    }

    /// Validate the config and build the immutable [`Provider`].
    pub fn build(self) -> Result<Provider, ProviderConfigError> {
        let name = ProviderName::new(self.name.clone())
            .map_err(|source| ProviderConfigError::InvalidName { source })?;

        let base_url =
            Url::parse(&self.base_url).map_err(|e| ProviderConfigError::InvalidBaseUrl {
                provider: self.name.clone(),
                message: e.to_string(),
            })?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(ProviderConfigError::InvalidBaseUrl {
                provider: self.name.clone(),
                message: format!("unsupported scheme '{}'", base_url.scheme()),
            });
        }

        let invalid = |field: &str, message: &str| ProviderConfigError::InvalidSetting {
            provider: self.name.clone(),
            field: field.to_string(),
            message: message.to_string(),
        };

        if self.webhook_secret.is_empty() {
            return Err(invalid("webhook_secret", "must not be empty"));
        }
        if self.auth_type.requires_credential()
            && self.api_credential.as_ref().map(|c| c.is_empty()).unwrap_or(true)
        {
            return Err(invalid(
                "api_credential",
                "required for api_key and oauth2 auth",
            ));
        }
        if self.timeout_ms == 0 {
            return Err(invalid("timeout_ms", "must be greater than zero"));
        }
        if self.max_retries == 0 {
            return Err(invalid("max_retries", "must allow at least one attempt"));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(invalid("backoff_cap_ms", "must not be below backoff_base_ms"));
        }
        if self.failure_threshold == 0 {
            return Err(invalid("failure_threshold", "must be greater than zero"));
        }
        if self.open_duration_ms == 0 {
            return Err(invalid("open_duration_ms", "must be greater than zero"));
        }
        if let Some(path) = &self.health_probe_path {
            if let Err(message) = join_relative(&base_url, path) {
                return Err(invalid("health_probe_path", &message));
            }
        }

        if !self.is_active {
            warn!(provider = %name, "Provider is configured as inactive");
        }

        Ok(Provider {
            name,
            base_url,
            webhook_secret: self.webhook_secret.clone(),
            auth_type: self.auth_type,
            api_credential: self.api_credential.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
            max_retries: self.max_retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.backoff_cap_ms),
            failure_threshold: self.failure_threshold,
            open_duration: Duration::from_millis(self.open_duration_ms),
            is_active: self.is_active,
            health_probe_path: self.health_probe_path.clone(),
        })
    }
}

// ============================================================================
// Provider
// ============================================================================

/// A validated external provider.
#[derive(Debug, Clone)]
pub struct Provider {
    pub name: ProviderName,
    pub base_url: Url,
    pub webhook_secret: SecretString,
    pub auth_type: AuthType,
    pub api_credential: Option<SecretString>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub failure_threshold: u32,
    pub open_duration: Duration,
    pub is_active: bool,
    pub health_probe_path: Option<String>,
}

impl Provider {
    /// Resolve an endpoint path against the provider's base URL.
    ///
    /// The result always lies under the base URL's path: `https://host/api`
    /// plus `customers` is `https://host/api/customers`. Absolute URLs,
    /// network paths and `..` segments are rejected so provider credentials
    /// never leave the configured origin.
    pub fn endpoint_url(&self, endpoint: &str) -> Result<Url, ValidationError> {
        join_relative(&self.base_url, endpoint).map_err(|message| ValidationError::InvalidFormat {
            field: "endpoint".to_string(),
            message,
        })
    }

    /// URL probed by the health monitor, if one is configured.
    pub fn health_probe_url(&self) -> Option<Url> {
        self.health_probe_path
            .as_deref()
            .and_then(|path| join_relative(&self.base_url, path).ok())
    }
}

/// Check that `path` is a plain relative path with no scheme, host or
/// parent segments.
pub(crate) fn validate_relative_path(path: &str) -> Result<(), String> {
    if path.contains("://") || path.starts_with("//") || path.contains('\\') {
        return Err(format!("'{}' must be a path relative to the base URL", path));
    }
    if Url::parse(path).is_ok() {
        return Err(format!("'{}' is an absolute URL", path));
    }
    if path.split(['/', '?', '#']).any(|segment| segment == "..") {
        return Err(format!("'{}' must not contain '..' segments", path));
    }
    Ok(())
}

/// Append `path` below the base URL's path, keeping the base origin.
fn join_relative(base: &Url, path: &str) -> Result<Url, String> {
    validate_relative_path(path)?;

    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.set_query(None);
    base.set_fragment(None);

    let joined = base
        .join(path.trim_start_matches('/'))
        .map_err(|e| e.to_string())?;
    if joined.origin() != base.origin() || !joined.path().starts_with(base.path()) {
        return Err(format!("'{}' escapes the provider base URL", path));
    }
    Ok(joined)
}

// ============================================================================
// ProviderConfigError
// ============================================================================

/// Error raised while building providers from configuration.
#[derive(Debug, thiserror::Error)]
pub enum ProviderConfigError {
    #[error("Invalid provider name: {source}")]
    InvalidName { source: ValidationError },

    #[error("Provider '{provider}' has an invalid base URL: {message}")]
    InvalidBaseUrl { provider: String, message: String },

    #[error("Provider '{provider}' has an invalid '{field}': {message}")]
    InvalidSetting {
        provider: String,
        field: String,
        message: String,
    },

    #[error("Provider '{provider}' is configured more than once")]
    Duplicate { provider: String },
}

// ============================================================================
// ProviderRegistry
// ============================================================================

/// Immutable catalogue of providers keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<Provider>>,
}

impl ProviderRegistry {
    /// Build a registry from already validated providers.
    pub fn new(providers: Vec<Provider>) -> Result<Self, ProviderConfigError> {
        let mut map = HashMap::with_capacity(providers.len());
        for provider in providers {
            let key = provider.name.as_str().to_string();
            if map.contains_key(&key) {
                return Err(ProviderConfigError::Duplicate { provider: key });
            }
            debug!(provider = %key, auth_type = ?provider.auth_type, "Registered provider");
            map.insert(key, Arc::new(provider));
        }
        Ok(Self { providers: map })
    }

    /// Validate configs and build a registry.
    pub fn from_configs(configs: Vec<ProviderConfig>) -> Result<Self, ProviderConfigError> {
        let providers = configs
            .into_iter()
            .map(ProviderConfig::build)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(providers)
    }

    /// Look up a provider by name.
    pub fn get(&self, name: &str) -> Option<&Arc<Provider>> {
        self.providers.get(name)
    }

    /// Look up a provider only if it is active.
    pub fn active(&self, name: &str) -> Option<&Arc<Provider>> {
        self.get(name).filter(|p| p.is_active)
    }

    /// Iterate over all providers in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Provider>> {
        self.providers.values()
    }

    /// Provider names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
