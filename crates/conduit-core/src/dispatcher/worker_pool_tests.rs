//! Tests for the work queue and worker pool.

use super::*;
use crate::adapters::InMemoryEventStore;
use crate::circuit_breaker::CircuitBreaker;
use crate::dispatcher::{
    EventHandler, HandlerContext, HandlerError, HandlerRegistry, OutboundSender, TransportError,
    TransportRequest, TransportResponse,
};
use crate::event_store::{EventState, EventStore, InboundEvent};
use crate::provider::{ProviderConfig, ProviderRegistry};
use crate::dispatcher::OutboundTransport;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};

const USERS: &str = "user_service";

struct SleepyHandler {
    calls: AtomicU32,
    delay: Duration,
}

#[async_trait]
impl EventHandler for SleepyHandler {
    async fn handle(
        &self,
        _event: &InboundEvent,
        _ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

/// Panics on `evt_boom`, succeeds otherwise.
#[derive(Default)]
struct PanickingHandler {
    completed: AtomicU32,
}

#[async_trait]
impl EventHandler for PanickingHandler {
    async fn handle(
        &self,
        event: &InboundEvent,
        _ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        if event.key.event_id == "evt_boom" {
            panic!("handler bug");
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct NoopTransport;

#[async_trait]
impl OutboundTransport for NoopTransport {
    async fn send(&self, _request: TransportRequest) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse {
            status: 200,
            body: Bytes::new(),
        })
    }
}

fn dispatcher(handler: Arc<dyn EventHandler>) -> (Arc<Dispatcher>, Arc<InMemoryEventStore>) {
    let mut config = ProviderConfig::new(USERS, "http://users.test", "inbound-secret");
    config.timeout_ms = 60_000;
    let registry = Arc::new(ProviderRegistry::from_configs(vec![config]).unwrap());
    let store = Arc::new(InMemoryEventStore::new());
    let breaker = Arc::new(CircuitBreaker::new(&registry));
    let sender = Arc::new(OutboundSender::new(
        registry.clone(),
        breaker.clone(),
        Arc::new(NoopTransport),
    ));
    let dispatcher = Dispatcher::new(
        registry,
        store.clone(),
        breaker,
        HandlerRegistry::new().register("user.created", handler),
        sender,
    );
    (Arc::new(dispatcher), store)
}

fn pool_config(worker_count: usize, queue_capacity: usize) -> DispatcherConfig {
    DispatcherConfig {
        worker_count,
        queue_capacity,
        ..DispatcherConfig::default()
    }
}

async fn admit(store: &InMemoryEventStore, event_id: &str) -> EventKey {
    let key = EventKey::new(USERS, event_id);
    store
        .try_admit(&key, "user.created", Bytes::from_static(b"{}"))
        .await
        .unwrap();
    key
}

// ============================================================================
// WorkQueue
// ============================================================================

mod work_queue_tests {
    use super::*;

    #[tokio::test]
    async fn test_try_reserve_fails_when_full() {
        let (queue, _receiver) = WorkQueue::bounded(2);

        let first = queue.try_reserve().unwrap();
        let _second = queue.try_reserve().unwrap();

        assert_eq!(queue.try_reserve().unwrap_err(), QueueError::Full);

        // Dropping an unused slot frees it
        drop(first);
        assert!(queue.try_reserve().is_ok());
    }

    #[tokio::test]
    async fn test_submitted_slot_delivers_key() {
        let (queue, mut receiver) = WorkQueue::bounded(1);

        queue
            .try_reserve()
            .unwrap()
            .submit(EventKey::new(USERS, "evt_1"));

        assert_eq!(receiver.recv().await, Some(EventKey::new(USERS, "evt_1")));
        assert_eq!(queue.capacity(), 1);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects() {
        let (queue, receiver) = WorkQueue::bounded(1);
        drop(receiver);

        assert!(queue.is_closed());
        assert_eq!(queue.try_reserve().unwrap_err(), QueueError::Closed);
        assert_eq!(
            queue.enqueue(EventKey::new(USERS, "evt_1")).await,
            Err(QueueError::Closed)
        );
    }
}

// ============================================================================
// WorkerPool
// ============================================================================

mod worker_pool_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_workers_process_queued_events() {
        let handler = Arc::new(SleepyHandler {
            calls: AtomicU32::new(0),
            delay: Duration::from_millis(5),
        });
        let (dispatcher, store) = dispatcher(handler.clone());
        let (pool, queue) =
            WorkerPool::start(dispatcher, &pool_config(2, 16), CancellationToken::new());
        assert_eq!(pool.worker_count(), 2);

        let mut keys = Vec::new();
        for i in 0..5 {
            let key = admit(&store, &format!("evt_{}", i)).await;
            queue.enqueue(key.clone()).await.unwrap();
            keys.push(key);
        }

        for _ in 0..100 {
            if handler.calls.load(Ordering::SeqCst) == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        for key in &keys {
            let event = store.get(key).await.unwrap().unwrap();
            assert_eq!(event.state, EventState::Processed);
        }

        pool.shutdown_graceful(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_fails_event_and_worker_survives() {
        let handler = Arc::new(PanickingHandler::default());
        let (dispatcher, store) = dispatcher(handler.clone());
        let (pool, queue) =
            WorkerPool::start(dispatcher, &pool_config(1, 4), CancellationToken::new());

        let boom = admit(&store, "evt_boom").await;
        let ok = admit(&store, "evt_ok").await;
        queue.enqueue(boom.clone()).await.unwrap();
        queue.enqueue(ok.clone()).await.unwrap();

        for _ in 0..100 {
            if handler.completed.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let failed = store.get(&boom).await.unwrap().unwrap();
        assert_eq!(failed.state, EventState::Failed);
        assert!(failed.last_error.unwrap().contains("panicked"));
        assert_eq!(
            store.get(&ok).await.unwrap().unwrap().state,
            EventState::Processed
        );
        assert!(pool.has_active_workers());

        pool.shutdown_graceful(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_pool_shuts_down_cleanly() {
        let handler = Arc::new(SleepyHandler {
            calls: AtomicU32::new(0),
            delay: Duration::ZERO,
        });
        let (dispatcher, _store) = dispatcher(handler);
        let token = CancellationToken::new();
        let (pool, _queue) = WorkerPool::start(dispatcher, &pool_config(3, 4), token.clone());

        assert!(pool.has_active_workers());
        pool.shutdown_graceful(Duration::from_secs(1)).await.unwrap();

        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_times_out_on_stuck_handler() {
        let handler = Arc::new(SleepyHandler {
            calls: AtomicU32::new(0),
            delay: Duration::from_secs(30),
        });
        let (dispatcher, store) = dispatcher(handler.clone());
        let (pool, queue) =
            WorkerPool::start(dispatcher, &pool_config(1, 4), CancellationToken::new());

        let key = admit(&store, "evt_slow").await;
        queue.enqueue(key.clone()).await.unwrap();
        while handler.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let result = pool.shutdown_graceful(Duration::from_millis(100)).await;

        assert!(matches!(result, Err(DispatchError::ShutdownTimeout { .. })));
        let event = store.get(&key).await.unwrap().unwrap();
        assert_eq!(event.state, EventState::Processing);
    }
}
