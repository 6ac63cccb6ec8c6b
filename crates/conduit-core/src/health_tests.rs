//! Tests for health composition and publication.

use super::*;
use crate::provider::ProviderConfig;
use std::sync::atomic::{AtomicU32, Ordering};

const PAYMENTS: &str = "payment_service";
const USERS: &str = "user_service";

/// Probe returning whatever result was last set.
#[derive(Default)]
struct FixedProbe {
    result: Mutex<Option<ProbeResult>>,
    calls: AtomicU32,
}

impl FixedProbe {
    fn set(&self, success: bool, latency_ms: u64) {
        *self.result.lock().unwrap() = Some(ProbeResult {
            success,
            latency: Duration::from_millis(latency_ms),
        });
    }
}

#[async_trait]
impl ProviderProbe for FixedProbe {
    async fn probe(&self, _provider: &Provider) -> Option<ProbeResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.result.lock().unwrap()
    }
}

struct Fixture {
    monitor: HealthMonitor,
    breaker: Arc<CircuitBreaker>,
    probe: Arc<FixedProbe>,
}

fn fixture() -> Fixture {
    let mut payments = ProviderConfig::new(PAYMENTS, "http://payments.test", "s1");
    payments.failure_threshold = 1;
    let registry = Arc::new(
        ProviderRegistry::from_configs(vec![
            payments,
            ProviderConfig::new(USERS, "http://users.test", "s2"),
        ])
        .unwrap(),
    );
    let breaker = Arc::new(CircuitBreaker::new(&registry));
    let probe = Arc::new(FixedProbe::default());
    let monitor = HealthMonitor::new(
        registry,
        breaker.clone(),
        probe.clone(),
        HealthConfig::default(),
    );
    Fixture {
        monitor,
        breaker,
        probe,
    }
}

fn trip(breaker: &CircuitBreaker, provider: &str) {
    let permit = breaker.allow(provider).unwrap();
    breaker.record_result(permit, false, Duration::from_millis(1));
}

// ============================================================================
// Composition
// ============================================================================

mod composition_tests {
    use super::*;

    #[tokio::test]
    async fn test_unchecked_providers_start_healthy() {
        let f = fixture();

        let snapshot = f.monitor.snapshot();

        assert_eq!(snapshot.providers.len(), 2);
        assert!(snapshot.all_healthy());
        let users = &snapshot.providers[USERS];
        assert_eq!(users.circuit_status, CircuitStatus::Closed);
        assert_eq!(users.avg_response_time_ms, None);
        assert_eq!(users.last_checked_at, None);
    }

    #[tokio::test]
    async fn test_failed_probe_marks_down_until_recovery() {
        let f = fixture();

        f.probe.set(false, 20);
        let down = f.monitor.check_provider(USERS).await.unwrap();
        f.probe.set(true, 20);
        let up = f.monitor.check_provider(USERS).await.unwrap();

        assert_eq!(down.status, HealthStatus::Down);
        assert_eq!(down.last_probe_ok, Some(false));
        assert_eq!(up.status, HealthStatus::Healthy);
        assert!(up.last_checked_at.is_some());
    }

    #[tokio::test]
    async fn test_latency_average_uses_ema() {
        let f = fixture();

        f.probe.set(true, 100);
        f.monitor.check_provider(USERS).await;
        f.probe.set(true, 200);
        let health = f.monitor.check_provider(USERS).await.unwrap();

        let avg = health.avg_response_time_ms.unwrap();
        assert!((avg - 130.0).abs() < 1e-6, "avg was {}", avg);
    }

    #[tokio::test]
    async fn test_elevated_latency_is_degraded() {
        let f = fixture();

        f.probe.set(true, 2_500);
        let health = f.monitor.check_provider(USERS).await.unwrap();

        assert_eq!(health.status, HealthStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_state_drives_status() {
        let f = fixture();
        f.probe.set(true, 10);

        trip(&f.breaker, PAYMENTS);
        let open = f.monitor.check_provider(PAYMENTS).await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        let _trial = f.breaker.allow(PAYMENTS).unwrap();
        let half_open = f.monitor.recompose(PAYMENTS).unwrap();

        assert_eq!(open.status, HealthStatus::Down);
        assert_eq!(open.circuit_status, CircuitStatus::Open);
        assert_eq!(half_open.status, HealthStatus::Degraded);
        assert_eq!(half_open.circuit_status, CircuitStatus::HalfOpen);
    }

    #[tokio::test]
    async fn test_last_call_stands_in_when_no_probe_configured() {
        let f = fixture();

        f.monitor
            .record_call(USERS, Duration::from_millis(40), false);
        let health = f.monitor.check_provider(USERS).await.unwrap();

        assert_eq!(health.status, HealthStatus::Down);
        let avg = health.avg_response_time_ms.unwrap();
        assert!((avg - 40.0).abs() < 1e-6, "avg was {}", avg);
    }

    #[tokio::test]
    async fn test_unknown_provider_is_ignored() {
        let f = fixture();

        assert!(f.monitor.check_provider("nope").await.is_none());
        f.monitor.record_call("nope", Duration::from_millis(1), true);
        assert_eq!(f.monitor.snapshot().providers.len(), 2);
    }
}

// ============================================================================
// Publication
// ============================================================================

mod publication_tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshots_are_replaced_not_mutated() {
        let f = fixture();
        let before = f.monitor.snapshot();
        let mut rx = f.monitor.subscribe();

        f.probe.set(false, 10);
        f.monitor.check_provider(USERS).await;

        assert!(rx.has_changed().unwrap());
        let after = rx.borrow_and_update().clone();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(before.providers[USERS].status, HealthStatus::Healthy);
        assert_eq!(after.providers[USERS].status, HealthStatus::Down);
    }

    #[test]
    fn test_concurrent_writers_publish_each_providers_latest_state() {
        let f = fixture();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..200 {
                    f.monitor.record_call(PAYMENTS, Duration::from_millis(5_000), true);
                }
            });
            scope.spawn(|| {
                for _ in 0..200 {
                    f.monitor.record_call(USERS, Duration::from_millis(5), true);
                }
            });
        });

        let snapshot = f.monitor.snapshot();
        assert_eq!(snapshot.providers[PAYMENTS].status, HealthStatus::Degraded);
        assert_eq!(snapshot.providers[USERS].status, HealthStatus::Healthy);
        assert_eq!(
            snapshot.providers[PAYMENTS],
            f.monitor.compose(PAYMENTS).unwrap()
        );
        assert_eq!(snapshot.providers[USERS], f.monitor.compose(USERS).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_probes_on_interval_and_follows_circuit() {
        let f = fixture();
        f.probe.set(true, 10);
        let monitor = Arc::new(f.monitor);
        let token = CancellationToken::new();

        let handles = monitor.clone().run(token.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        let first_round = f.probe.calls.load(Ordering::SeqCst);

        trip(&f.breaker, PAYMENTS);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let after_trip = monitor.snapshot().providers[PAYMENTS].status;

        tokio::time::sleep(Duration::from_secs(61)).await;
        let second_round = f.probe.calls.load(Ordering::SeqCst);

        token.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(first_round, 2);
        assert_eq!(after_trip, HealthStatus::Down);
        assert_eq!(second_round, 4);
    }
}

// ============================================================================
// HTTP Probe
// ============================================================================

mod http_probe_tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(base_url: &str, probe_path: Option<&str>) -> Provider {
        let mut config = ProviderConfig::new(USERS, base_url, "s");
        config.health_probe_path = probe_path.map(str::to_string);
        config.build().unwrap()
    }

    #[tokio::test]
    async fn test_http_probe_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let probe = HttpProbe::default();

        let ok = probe
            .probe(&provider(&server.uri(), Some("healthz")))
            .await
            .unwrap();
        let broken = probe
            .probe(&provider(&server.uri(), Some("broken")))
            .await
            .unwrap();

        assert!(ok.success);
        assert!(!broken.success);
    }

    #[tokio::test]
    async fn test_http_probe_skips_providers_without_path() {
        let probe = HttpProbe::default();

        assert!(probe
            .probe(&provider("http://users.test", None))
            .await
            .is_none());
    }
}

#[test]
fn test_health_config_defaults() {
    let config: HealthConfig = serde_json::from_str("{}").unwrap();

    assert_eq!(config, HealthConfig::default());
    assert_eq!(config.interval(), Duration::from_secs(60));
    assert_eq!(config.ema_alpha, 0.3);
}
