//! Circuit breaker implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{CircuitOpenError, CircuitPermit, CircuitSettings, CircuitSnapshot, CircuitStatus};
use crate::monitoring::{MetricsCollector, NoOpMetricsCollector};
use crate::provider::ProviderRegistry;
use crate::Timestamp;

/// Mutable state of one provider's circuit.
#[derive(Debug)]
struct InternalState {
    status: CircuitStatus,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<Timestamp>,
    last_probe_at: Option<Timestamp>,
    /// Set while the half-open trial is outstanding
    trial_started_at: Option<Instant>,
    /// Bumped on every state change
    generation: u64,
    forced_open: bool,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
    last_latency: Option<Duration>,
}

impl InternalState {
    fn new() -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            opened_at: None,
            opened_at_wall: None,
            last_probe_at: None,
            trial_started_at: None,
            generation: 0,
            forced_open: false,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
            last_latency: None,
        }
    }
}

/// One provider's circuit: its own lock plus a status broadcast.
struct ProviderCircuit {
    settings: CircuitSettings,
    state: Mutex<InternalState>,
    status_tx: watch::Sender<CircuitStatus>,
}

impl ProviderCircuit {
    fn new(settings: CircuitSettings) -> Self {
        let (status_tx, _) = watch::channel(CircuitStatus::Closed);
        Self {
            settings,
            state: Mutex::new(InternalState::new()),
            status_tx,
        }
    }

    fn lock(&self) -> Option<MutexGuard<'_, InternalState>> {
        self.state.lock().ok()
    }
}

/// Circuit breaker covering every registered provider.
///
/// The provider → circuit map is fixed at construction; each circuit has its
/// own lock, so contention on one provider never blocks another.
pub struct CircuitBreaker {
    circuits: HashMap<String, ProviderCircuit>,
    metrics: Arc<dyn MetricsCollector>,
}

impl CircuitBreaker {
    /// Create a circuit for every provider in the registry.
    pub fn new(registry: &ProviderRegistry) -> Self {
        Self::from_settings(
            registry
                .iter()
                .map(|p| (p.name.as_str().to_string(), CircuitSettings::from(p.as_ref()))),
        )
    }

    /// Create circuits from explicit settings.
    pub fn from_settings(settings: impl IntoIterator<Item = (String, CircuitSettings)>) -> Self {
        let circuits = settings
            .into_iter()
            .map(|(name, s)| (name, ProviderCircuit::new(s)))
            .collect();
        Self {
            circuits,
            metrics: Arc::new(NoOpMetricsCollector),
        }
    }

    /// Report state changes to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    // ------------------------------------------------------------------------
    // Call gating
    // ------------------------------------------------------------------------

    /// Ask permission for one call to `provider`.
    ///
    /// Unknown providers are rejected, as is any call while the circuit lock
    /// is poisoned.
    pub fn allow(&self, provider: &str) -> Result<CircuitPermit, CircuitOpenError> {
        let reject = |retry_after| CircuitOpenError {
            provider: provider.to_string(),
            retry_after,
        };

        let circuit = self.circuits.get(provider).ok_or_else(|| reject(None))?;
        let mut state = circuit.lock().ok_or_else(|| reject(None))?;
        let open_duration = circuit.settings.open_duration;

        match state.status {
            CircuitStatus::Closed => Ok(self.permit(provider, &state, false)),
            CircuitStatus::Open => {
                let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if state.forced_open || elapsed < open_duration {
                    state.total_rejections += 1;
                    let retry_after = (!state.forced_open).then(|| open_duration - elapsed);
                    return Err(reject(retry_after));
                }

                self.transition(provider, circuit, &mut state, CircuitStatus::HalfOpen);
                Ok(self.start_trial(provider, &mut state))
            }
            CircuitStatus::HalfOpen => {
                let trial_outstanding = state
                    .trial_started_at
                    .is_some_and(|started| started.elapsed() < open_duration);
                if trial_outstanding {
                    state.total_rejections += 1;
                    return Err(reject(None));
                }

                // Previous trial never reported back; supersede it
                if state.trial_started_at.is_some() {
                    warn!(provider = %provider, "Half-open trial abandoned, issuing a new one");
                    state.generation += 1;
                }
                Ok(self.start_trial(provider, &mut state))
            }
        }
    }

    /// Report the outcome of a permitted call.
    pub fn record_result(&self, permit: CircuitPermit, success: bool, latency: Duration) {
        let Some(circuit) = self.circuits.get(&permit.provider) else {
            return;
        };
        let Some(mut state) = circuit.lock() else {
            return;
        };

        state.last_latency = Some(latency);
        if success {
            state.total_successes += 1;
        } else {
            state.total_failures += 1;
        }

        if permit.generation != state.generation {
            debug!(
                provider = %permit.provider,
                permit_generation = permit.generation,
                current_generation = state.generation,
                "Ignoring result from stale circuit permit"
            );
            return;
        }

        match (state.status, success) {
            (CircuitStatus::Closed, true) => state.consecutive_failures = 0,
            (CircuitStatus::Closed, false) => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= circuit.settings.failure_threshold {
                    self.trip(&permit.provider, circuit, &mut state);
                }
            }
            (CircuitStatus::HalfOpen, true) if permit.trial => {
                self.close(&permit.provider, circuit, &mut state);
            }
            (CircuitStatus::HalfOpen, false) if permit.trial => {
                state.consecutive_failures += 1;
                self.trip(&permit.provider, circuit, &mut state);
            }
            _ => {}
        }
    }

    /// Sleep for `delay` unless the provider's circuit is or becomes open.
    ///
    /// Used between retry attempts so that a retry sequence is abandoned the
    /// moment the circuit opens instead of sleeping out the full backoff.
    pub async fn sleep_unless_open(
        &self,
        provider: &str,
        delay: Duration,
    ) -> Result<(), CircuitOpenError> {
        let open_error = || CircuitOpenError {
            provider: provider.to_string(),
            retry_after: None,
        };

        let mut status_rx = self.subscribe(provider).ok_or_else(open_error)?;
        if *status_rx.borrow_and_update() == CircuitStatus::Open {
            return Err(open_error());
        }

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        (&mut sleep).await;
                        return Ok(());
                    }
                    if *status_rx.borrow_and_update() == CircuitStatus::Open {
                        return Err(open_error());
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    /// Current status, or `None` for an unknown provider.
    pub fn status(&self, provider: &str) -> Option<CircuitStatus> {
        let circuit = self.circuits.get(provider)?;
        // Fail-safe: treat lock poisoning as open
        Some(
            circuit
                .lock()
                .map(|s| s.status)
                .unwrap_or(CircuitStatus::Open),
        )
    }

    /// Watch status changes for a provider.
    pub fn subscribe(&self, provider: &str) -> Option<watch::Receiver<CircuitStatus>> {
        self.circuits.get(provider).map(|c| c.status_tx.subscribe())
    }

    pub fn snapshot(&self, provider: &str) -> Option<CircuitSnapshot> {
        let circuit = self.circuits.get(provider)?;
        let state = circuit.lock()?;
        Some(Self::build_snapshot(provider, circuit, &state))
    }

    /// Snapshots of every circuit, sorted by provider name.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut names: Vec<&String> = self.circuits.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| self.snapshot(name))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Operator overrides
    // ------------------------------------------------------------------------

    /// Open the circuit and hold it open until [`Self::force_close`].
    pub fn force_open(&self, provider: &str) -> Option<CircuitSnapshot> {
        let circuit = self.circuits.get(provider)?;
        let mut state = circuit.lock()?;

        info!(provider = %provider, "Circuit forced open by operator");
        state.forced_open = true;
        self.trip(provider, circuit, &mut state);
        Some(Self::build_snapshot(provider, circuit, &state))
    }

    /// Close the circuit and clear failure counters.
    pub fn force_close(&self, provider: &str) -> Option<CircuitSnapshot> {
        let circuit = self.circuits.get(provider)?;
        let mut state = circuit.lock()?;

        info!(provider = %provider, "Circuit forced closed by operator");
        self.close(provider, circuit, &mut state);
        Some(Self::build_snapshot(provider, circuit, &state))
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    fn permit(&self, provider: &str, state: &InternalState, trial: bool) -> CircuitPermit {
        CircuitPermit {
            provider: provider.to_string(),
            generation: state.generation,
            trial,
        }
    }

    fn start_trial(&self, provider: &str, state: &mut InternalState) -> CircuitPermit {
        state.trial_started_at = Some(Instant::now());
        state.last_probe_at = Some(Timestamp::now());
        debug!(provider = %provider, "Issuing half-open trial permit");
        self.permit(provider, state, true)
    }

    fn trip(&self, provider: &str, circuit: &ProviderCircuit, state: &mut InternalState) {
        state.opened_at = Some(Instant::now());
        state.opened_at_wall = Some(Timestamp::now());
        state.trial_started_at = None;
        warn!(
            provider = %provider,
            consecutive_failures = state.consecutive_failures,
            open_duration_ms = circuit.settings.open_duration.as_millis() as u64,
            "Circuit opened"
        );
        self.transition(provider, circuit, state, CircuitStatus::Open);
    }

    fn close(&self, provider: &str, circuit: &ProviderCircuit, state: &mut InternalState) {
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.opened_at_wall = None;
        state.trial_started_at = None;
        state.forced_open = false;
        info!(provider = %provider, "Circuit closed");
        self.transition(provider, circuit, state, CircuitStatus::Closed);
    }

    fn transition(
        &self,
        provider: &str,
        circuit: &ProviderCircuit,
        state: &mut InternalState,
        to: CircuitStatus,
    ) {
        let from = state.status;
        state.status = to;
        state.generation += 1;
        circuit.status_tx.send_replace(to);

        if from != to {
            debug!(provider = %provider, from = %from, to = %to, "Circuit state changed");
            self.metrics.record_circuit_transition(provider, to);
        }
    }

    fn build_snapshot(
        provider: &str,
        circuit: &ProviderCircuit,
        state: &InternalState,
    ) -> CircuitSnapshot {
        CircuitSnapshot {
            provider: provider.to_string(),
            status: state.status,
            consecutive_failures: state.consecutive_failures,
            failure_threshold: circuit.settings.failure_threshold,
            open_duration_ms: circuit.settings.open_duration.as_millis() as u64,
            opened_at: state.opened_at_wall,
            last_probe_at: state.last_probe_at,
            forced_open: state.forced_open,
            total_successes: state.total_successes,
            total_failures: state.total_failures,
            total_rejections: state.total_rejections,
            last_latency_ms: state.last_latency.map(|d| d.as_millis() as u64),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("circuits", &self.circuits.len())
            .finish()
    }
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;
