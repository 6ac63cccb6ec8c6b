//! # Conduit Service
//!
//! Binary entry point for the Conduit integration engine.
//!
//! This executable:
//! - Loads configuration from files and environment
//! - Initializes logging
//! - Wires providers, the event ledger, circuit breakers, health monitoring
//!   and the dispatch worker pool
//! - Serves the HTTP API from conduit-api until SIGINT or SIGTERM

use conduit_api::{
    start_server, AppState, LoggingConfig, ServiceConfig, ServiceError, ServiceMetrics,
};
use conduit_core::{
    AuditSink, CircuitBreaker, Dispatcher, EventStore, HealthMonitor, HttpProbe,
    InMemoryEventStore, OutboundSender, ReqwestTransport, SignatureVerifier, TracingAuditSink,
    WebhookReceiver, WorkerPool,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    // Logging settings come from the configuration, so load it first and
    // report any failure once logging is up.
    let loaded = ServiceConfig::load();
    init_tracing(
        &loaded
            .as_ref()
            .map(|c| c.logging.clone())
            .unwrap_or_default(),
    );

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Service configuration is invalid; aborting");
            std::process::exit(ServiceError::from(e).exit_code());
        }
    };

    info!(
        providers = config.providers.len(),
        routes = config.routes.len(),
        "Starting Conduit service"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "Conduit service failed");
        std::process::exit(e.exit_code());
    }
}

/// `RUST_LOG` wins over `logging.level` when set.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let json = logging.json_format;
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .init();
}

async fn run(config: ServiceConfig) -> Result<(), ServiceError> {
    let registry = Arc::new(config.build_registry()?);
    let handlers = config.build_handlers(&registry)?;

    let metrics = ServiceMetrics::new().map_err(|e| ServiceError::ServerFailed {
        message: format!("metrics registry: {}", e),
    })?;
    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let breaker = Arc::new(CircuitBreaker::new(&registry).with_metrics(metrics.clone()));

    let client = reqwest::Client::new();
    let health = Arc::new(HealthMonitor::new(
        registry.clone(),
        breaker.clone(),
        Arc::new(HttpProbe::new(client.clone())),
        config.health.clone(),
    ));

    let sender = Arc::new(
        OutboundSender::new(
            registry.clone(),
            breaker.clone(),
            Arc::new(ReqwestTransport::new(client)),
        )
        .with_observer(health.clone())
        .with_metrics(metrics.clone())
        .with_audit(audit.clone()),
    );

    let dispatcher = Arc::new(
        Dispatcher::new(registry.clone(), store.clone(), breaker, handlers, sender)
            .with_audit(audit.clone())
            .with_metrics(metrics.clone()),
    );

    let token = CancellationToken::new();
    let (pool, queue) = WorkerPool::start(dispatcher.clone(), &config.dispatcher, token.clone());

    match dispatcher.recover_pending(&queue).await {
        Ok(0) => {}
        Ok(recovered) => info!(recovered, "Re-queued events left from a previous run"),
        Err(e) => warn!(error = %e, "Could not recover pending events; they remain received"),
    }

    let receiver = WebhookReceiver::new(SignatureVerifier::new(registry), store, queue.clone())
        .with_metrics(metrics.clone());
    let state = AppState::new(receiver, dispatcher, queue, health.clone(), metrics)
        .with_audit(audit)
        .with_max_body_size(config.server.max_body_size);

    let health_tasks = health.run(token.clone());
    state.mark_ready();

    let shutdown = {
        let state = state.clone();
        async move {
            shutdown_signal().await;
            state.mark_not_ready();
        }
    };

    let served = start_server(&config.server, state, shutdown).await;

    let drained = pool
        .shutdown_graceful(config.dispatcher.shutdown_timeout())
        .await;
    token.cancel();
    for task in health_tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Health probe task ended abnormally");
        }
    }

    served?;
    drained.map_err(|e| ServiceError::ShutdownFailed {
        message: e.to_string(),
    })?;

    info!("Conduit service stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
