//! # Health Monitor
//!
//! Periodic per-provider health composed from probes, outbound call telemetry
//! and circuit state.
//!
//! Each provider is checked on a fixed interval. A check runs the provider's
//! probe when one is configured; otherwise the outcome of the last outbound
//! call stands in for the probe. Latency samples from both sources feed an
//! exponential moving average.
//!
//! Status rules, first match wins:
//!
//! | Status     | Condition                                              |
//! |------------|--------------------------------------------------------|
//! | `down`     | circuit open, or the last probe failed                 |
//! | `degraded` | circuit half-open, or average latency above threshold  |
//! | `healthy`  | otherwise                                              |
//!
//! The published [`HealthSnapshot`] is immutable. Every update builds a new
//! snapshot and swaps the `Arc` in a `watch` channel, so readers never see a
//! partially updated map and never wait on a writer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitStatus};
use crate::provider::{Provider, ProviderRegistry};
use crate::Timestamp;

// ============================================================================
// Types
// ============================================================================

/// Composed provider health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Down => "down",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Health of one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub status: HealthStatus,
    /// Exponential moving average of observed latency
    pub avg_response_time_ms: Option<f64>,
    pub last_checked_at: Option<Timestamp>,
    pub circuit_status: CircuitStatus,
    pub last_probe_ok: Option<bool>,
}

/// Health of every provider, keyed by provider name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub providers: BTreeMap<String, ProviderHealth>,
    pub generated_at: Timestamp,
}

impl HealthSnapshot {
    /// Whether every provider is healthy.
    pub fn all_healthy(&self) -> bool {
        self.providers
            .values()
            .all(|p| p.status == HealthStatus::Healthy)
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,

    /// Average latency above which a provider is degraded
    #[serde(default = "default_degraded_latency_ms")]
    pub degraded_latency_ms: u64,

    /// Smoothing factor for the latency average
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
}

fn default_interval_seconds() -> u64 {
    60
}

fn default_degraded_latency_ms() -> u64 {
    1000
}

fn default_ema_alpha() -> f64 {
    0.3
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            degraded_latency_ms: default_degraded_latency_ms(),
            ema_alpha: default_ema_alpha(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }
}

// ============================================================================
// Probes and Observers
// ============================================================================

/// Result of one probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeResult {
    pub success: bool,
    pub latency: Duration,
}

/// Lightweight liveness check for a provider.
#[async_trait]
pub trait ProviderProbe: Send + Sync {
    /// Probe `provider`, or `None` if it has no probe configured.
    async fn probe(&self, provider: &Provider) -> Option<ProbeResult>;
}

/// Probe issuing `GET {base_url}{health_probe_path}`.
#[derive(Debug, Clone, Default)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProviderProbe for HttpProbe {
    async fn probe(&self, provider: &Provider) -> Option<ProbeResult> {
        let url = provider.health_probe_url()?;
        let started = Instant::now();
        let success = match self
            .client
            .get(url)
            .timeout(provider.timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(provider = %provider.name, error = %e, "Health probe request failed");
                false
            }
        };
        Some(ProbeResult {
            success,
            latency: started.elapsed(),
        })
    }
}

/// Receives per-call telemetry from the outbound path.
pub trait CallObserver: Send + Sync {
    fn record_call(&self, provider: &str, latency: Duration, success: bool);
}

// ============================================================================
// HealthMonitor
// ============================================================================

/// Writer-side state for one provider.
#[derive(Debug, Default)]
struct Samples {
    ema_ms: Option<f64>,
    last_probe_ok: Option<bool>,
    last_call_ok: Option<bool>,
    last_checked_at: Option<Timestamp>,
}

impl Samples {
    fn observe_latency(&mut self, latency: Duration, alpha: f64) {
        let sample = latency.as_secs_f64() * 1000.0;
        self.ema_ms = Some(match self.ema_ms {
            Some(avg) => alpha * sample + (1.0 - alpha) * avg,
            None => sample,
        });
    }
}

/// Maintains and publishes the health snapshot.
pub struct HealthMonitor {
    registry: Arc<ProviderRegistry>,
    breaker: Arc<CircuitBreaker>,
    probe: Arc<dyn ProviderProbe>,
    config: HealthConfig,
    samples: HashMap<String, Mutex<Samples>>,
    snapshot_tx: watch::Sender<Arc<HealthSnapshot>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        breaker: Arc<CircuitBreaker>,
        probe: Arc<dyn ProviderProbe>,
        config: HealthConfig,
    ) -> Self {
        let samples = registry
            .names()
            .into_iter()
            .map(|name| (name, Mutex::new(Samples::default())))
            .collect();
        let (snapshot_tx, _) = watch::channel(Arc::new(HealthSnapshot {
            providers: BTreeMap::new(),
            generated_at: Timestamp::now(),
        }));

        let monitor = Self {
            registry,
            breaker,
            probe,
            config,
            samples,
            snapshot_tx,
        };
        monitor.refresh_all();
        monitor
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<HealthSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Watch snapshot replacements.
    pub fn subscribe(&self) -> watch::Receiver<Arc<HealthSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Probe one provider and publish its updated health.
    ///
    /// Probes bypass the circuit breaker so that recovery is still observed
    /// while the circuit is open.
    #[instrument(skip(self))]
    pub async fn check_provider(&self, name: &str) -> Option<ProviderHealth> {
        let provider = self.registry.get(name)?.clone();
        let result = self.probe.probe(&provider).await;

        {
            let mut samples = self.samples.get(name)?.lock().ok()?;
            match result {
                Some(probe) => {
                    samples.observe_latency(probe.latency, self.config.ema_alpha);
                    samples.last_probe_ok = Some(probe.success);
                }
                None => samples.last_probe_ok = samples.last_call_ok,
            }
            samples.last_checked_at = Some(Timestamp::now());
        }

        let health = self.recompose(name)?;
        debug!(status = %health.status, "Provider health checked");
        Some(health)
    }

    /// Rebuild one provider's entry from its samples and circuit state.
    ///
    /// Holds only that provider's sample lock while composing, so writers
    /// for different providers never wait on each other. The snapshot channel
    /// is locked just long enough to swap the entry in.
    pub fn recompose(&self, name: &str) -> Option<ProviderHealth> {
        let samples = self.samples.get(name)?.lock().ok()?;
        let health = self.compose_from(name, &samples);

        let mut previous = None;
        self.snapshot_tx.send_modify(|snapshot| {
            let mut providers = snapshot.providers.clone();
            previous = providers
                .insert(name.to_string(), health.clone())
                .map(|h| h.status);
            *snapshot = Arc::new(HealthSnapshot {
                providers,
                generated_at: Timestamp::now(),
            });
        });
        drop(samples);

        if let Some(previous) = previous.filter(|p| *p != health.status) {
            match health.status {
                HealthStatus::Healthy => {
                    info!(provider = %name, from = %previous, "Provider healthy again")
                }
                status => warn!(
                    provider = %name,
                    from = %previous,
                    to = %status,
                    "Provider health changed"
                ),
            }
        }
        Some(health)
    }

    /// Rebuild every provider's entry and publish one new snapshot.
    pub fn refresh_all(&self) {
        let providers = self
            .registry
            .names()
            .into_iter()
            .filter_map(|name| self.compose(&name).map(|h| (name, h)))
            .collect();
        self.snapshot_tx.send_replace(Arc::new(HealthSnapshot {
            providers,
            generated_at: Timestamp::now(),
        }));
    }

    /// Spawn one checker task per provider.
    ///
    /// Each task probes on the configured interval and also recomposes
    /// immediately whenever the provider's circuit changes state.
    pub fn run(self: Arc<Self>, cancellation_token: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(
            providers = self.samples.len(),
            interval_seconds = self.config.interval().as_secs(),
            "Starting health monitor"
        );

        self.registry
            .names()
            .into_iter()
            .map(|name| {
                let monitor = self.clone();
                let token = cancellation_token.clone();
                tokio::spawn(async move { monitor.watch_provider(name, token).await })
            })
            .collect()
    }

    async fn watch_provider(&self, name: String, cancellation_token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut circuit_rx = self.breaker.subscribe(&name);

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = interval.tick() => {
                    self.check_provider(&name).await;
                }
                changed = async {
                    match circuit_rx.as_mut() {
                        Some(rx) => rx.changed().await.is_ok(),
                        None => std::future::pending().await,
                    }
                } => {
                    if changed {
                        self.recompose(&name);
                    } else {
                        circuit_rx = None;
                    }
                }
            }
        }

        debug!(provider = %name, "Health watcher stopped");
    }

    fn compose(&self, name: &str) -> Option<ProviderHealth> {
        let samples = self.samples.get(name)?.lock().ok()?;
        Some(self.compose_from(name, &samples))
    }

    fn compose_from(&self, name: &str, samples: &Samples) -> ProviderHealth {
        let circuit_status = self.breaker.status(name).unwrap_or(CircuitStatus::Closed);
        let slow = samples
            .ema_ms
            .is_some_and(|avg| avg > self.config.degraded_latency_ms as f64);
        let probe_failed = samples.last_probe_ok == Some(false);
        let status = if circuit_status == CircuitStatus::Open || probe_failed {
            HealthStatus::Down
        } else if circuit_status == CircuitStatus::HalfOpen || slow {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        ProviderHealth {
            status,
            avg_response_time_ms: samples.ema_ms,
            last_checked_at: samples.last_checked_at,
            circuit_status,
            last_probe_ok: samples.last_probe_ok,
        }
    }
}

impl CallObserver for HealthMonitor {
    fn record_call(&self, provider: &str, latency: Duration, success: bool) {
        let Some(samples) = self.samples.get(provider) else {
            return;
        };
        if let Ok(mut samples) = samples.lock() {
            samples.observe_latency(latency, self.config.ema_alpha);
            samples.last_call_ok = Some(success);
        }
        self.recompose(provider);
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("providers", &self.samples.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;
