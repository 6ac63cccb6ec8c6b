//! Configuration types for the HTTP service

use conduit_core::{
    DispatcherConfig, HandlerRegistry, HealthConfig, ProviderConfig, ProviderRegistry, RouteConfig,
};
use serde::Deserialize;
use std::net::SocketAddr;

use crate::errors::ConfigError;

/// Environment variable naming an extra configuration file.
pub const CONFIG_FILE_ENV: &str = "CONDUIT_CONFIG_FILE";

/// Prefix for configuration supplied through environment variables.
pub const ENV_PREFIX: &str = "CONDUIT";

/// Service configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Worker pool settings
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Provider health probing
    #[serde(default)]
    pub health: HealthConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// External providers
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Forwarding rules for inbound events
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl ServiceConfig {
    /// Load configuration from the standard locations.
    ///
    /// Later sources override earlier ones:
    ///  1. `/etc/conduit/service.yaml`
    ///  2. `./config/service.yaml`
    ///  3. the file named by `CONDUIT_CONFIG_FILE`, which must exist when set
    ///  4. `CONDUIT__*` environment variables, e.g. `CONDUIT__SERVER__PORT=9090`
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var(CONFIG_FILE_ENV)
            .ok()
            .filter(|path| !path.is_empty());
        Self::load_from(explicit.as_deref())
    }

    /// Load configuration with an optional explicit file in place of the
    /// `CONDUIT_CONFIG_FILE` lookup.
    pub fn load_from(explicit_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(
                config::File::with_name("/etc/conduit/service")
                    .required(false)
                    .format(config::FileFormat::Yaml),
            )
            .add_source(
                config::File::with_name("config/service")
                    .required(false)
                    .format(config::FileFormat::Yaml),
            );

        if let Some(path) = explicit_path {
            builder = builder.add_source(
                config::File::with_name(path)
                    .required(true)
                    .format(config::FileFormat::Yaml),
            );
        }

        let config: ServiceConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.dispatcher
            .validate()
            .map_err(|e| ConfigError::Invalid {
                message: e.to_string(),
            })?;

        if !(self.health.ema_alpha > 0.0 && self.health.ema_alpha <= 1.0) {
            return Err(ConfigError::Invalid {
                message: format!(
                    "health.ema_alpha must be in (0, 1], got {}",
                    self.health.ema_alpha
                ),
            });
        }

        if self.providers.is_empty() {
            return Err(ConfigError::Missing {
                key: "providers".to_string(),
            });
        }

        Ok(())
    }

    /// Build the provider registry described by `providers`.
    pub fn build_registry(&self) -> Result<ProviderRegistry, ConfigError> {
        ProviderRegistry::from_configs(self.providers.clone()).map_err(|e| ConfigError::Invalid {
            message: e.to_string(),
        })
    }

    /// Build the handler registry from `routes`.
    ///
    /// Every route must name providers present in `providers`.
    pub fn build_handlers(
        &self,
        providers: &ProviderRegistry,
    ) -> Result<HandlerRegistry, ConfigError> {
        HandlerRegistry::new()
            .with_routes(&self.routes, providers)
            .map_err(|e| ConfigError::Invalid {
                message: e.to_string(),
            })
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_seconds: u64,

    /// Maximum request size in bytes
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_timeout_seconds: 30,
            max_body_size: 1024 * 1024, // 1MB
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ConfigError::Invalid {
                message: format!("server address '{}:{}': {}", self.host, self.port, e),
            })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.socket_addr()?;
        if self.max_body_size == 0 {
            return Err(ConfigError::Invalid {
                message: "server.max_body_size must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "conduit_service=info,conduit_api=info,conduit_core=info,tower_http=debug"
                .to_string(),
            json_format: false,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
