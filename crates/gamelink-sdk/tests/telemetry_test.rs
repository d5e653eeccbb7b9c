// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the durable telemetry batcher.
//!
//! The backend is an in-memory transport that records every batch it
//! receives and can be switched into a failing mode; the durable store is
//! a `MemoryStore` that also counts deletions.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gamelink_sdk::{
    DurableStore, Headers, HttpResponse, HttpTransport, Identity, MemoryStore, RequestEnvelope,
    SchedulerConfig, SdkError, Session, TaskScheduler, TelemetryBatcher, TelemetryConfig,
    TelemetryEvent,
};
use serde_json::json;
use tokio::sync::Notify;
use tokio::time::Instant;

const TABLE: &str = "GameTelemetryCache/test.cache";
const USER: &str = "user-1";

#[derive(Default)]
struct TelemetryBackend {
    batches: Mutex<Vec<Vec<TelemetryEvent>>>,
    auth: Mutex<Vec<String>>,
    fail: AtomicBool,
    hold: AtomicBool,
    release: Notify,
}

impl TelemetryBackend {
    fn batches(&self) -> Vec<Vec<TelemetryEvent>> {
        self.batches.lock().unwrap().clone()
    }

    fn calls(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpTransport for TelemetryBackend {
    async fn perform(&self, request: &RequestEnvelope) -> gamelink_sdk::Result<HttpResponse> {
        assert!(request.url().ends_with("/game-telemetry/v1/protected/events"));
        let events: Vec<TelemetryEvent> =
            serde_json::from_slice(request.body().expect("batch body")).unwrap();
        self.batches.lock().unwrap().push(events);
        if let Some(auth) = request.headers().get("Authorization") {
            self.auth.lock().unwrap().push(auth.to_string());
        }
        if self.hold.load(Ordering::SeqCst) {
            self.release.notified().await;
        }

        if self.fail.load(Ordering::SeqCst) {
            Ok(HttpResponse::new(500, Headers::new(), "ingestion unavailable"))
        } else {
            Ok(HttpResponse::new(204, Headers::new(), ""))
        }
    }
}

#[derive(Default)]
struct CountingStore {
    inner: MemoryStore,
    deletes: AtomicUsize,
}

#[async_trait]
impl DurableStore for CountingStore {
    async fn get(&self, table: &str, key: &str) -> gamelink_sdk::Result<Option<String>> {
        self.inner.get(table, key).await
    }

    async fn set(&self, table: &str, key: &str, value: &str) -> gamelink_sdk::Result<()> {
        self.inner.set(table, key, value).await
    }

    async fn delete(&self, table: &str, key: &str) -> gamelink_sdk::Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(table, key).await
    }

    async fn reset(&self, table: &str) -> gamelink_sdk::Result<()> {
        self.inner.reset(table).await
    }
}

impl CountingStore {
    async fn stored_events(&self) -> Option<Vec<TelemetryEvent>> {
        self.inner
            .get(TABLE, USER)
            .await
            .unwrap()
            .map(|raw| serde_json::from_str(&raw).unwrap())
    }
}

fn event(name: &str) -> TelemetryEvent {
    TelemetryEvent::new(name, "testgame", json!({ "name": name }))
}

fn signed_in() -> Session {
    let session = Session::new();
    session.set(Identity::new(USER, "token-1"));
    session
}

fn batcher(
    backend: Arc<TelemetryBackend>,
    store: Arc<CountingStore>,
    session: Session,
    interval: Duration,
) -> TelemetryBatcher {
    let scheduler = TaskScheduler::new(backend, SchedulerConfig::default());
    TelemetryBatcher::new(
        TelemetryConfig {
            base_url: "http://telemetry.test".to_string(),
            table: TABLE.to_string(),
            interval,
            immediate_events: Vec::new(),
            request_timeout: Duration::from_secs(5),
        },
        scheduler,
        store,
        session,
    )
}

type Outcomes = Arc<Mutex<Vec<(String, gamelink_sdk::Result<()>)>>>;

async fn send_recorded(batcher: &TelemetryBatcher, outcomes: &Outcomes, name: &str) {
    let outcomes = outcomes.clone();
    let label = name.to_string();
    batcher
        .send_with_callback(event(name), move |result| {
            outcomes.lock().unwrap().push((label, result));
        })
        .await;
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_successful_flush_clears_store_and_fires_callbacks() {
    let backend = Arc::new(TelemetryBackend::default());
    let store = Arc::new(CountingStore::default());
    let batcher = batcher(backend.clone(), store.clone(), signed_in(), Duration::from_secs(60));

    let batch_outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = batch_outcomes.clone();
    batcher.on_batch(move |result| sink.lock().unwrap().push(result.clone()));

    let outcomes: Outcomes = Arc::default();
    for name in ["a", "b", "c"] {
        send_recorded(&batcher, &outcomes, name).await;
    }
    assert_eq!(batcher.queued_len(), 3);
    assert_eq!(store.stored_events().await.unwrap().len(), 3);

    batcher.flush().await.unwrap();

    assert_eq!(backend.batches(), vec![vec![event("a"), event("b"), event("c")]]);
    assert_eq!(backend.auth.lock().unwrap()[0], "Bearer token-1");
    assert!(store.stored_events().await.is_none());
    assert_eq!(batcher.queued_len(), 0);

    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|(_, r)| r.is_ok()));
    assert_eq!(*batch_outcomes.lock().unwrap(), vec![Ok(())]);
}

#[tokio::test]
async fn test_failed_flush_requeues_and_keeps_store() {
    let backend = Arc::new(TelemetryBackend::default());
    backend.fail.store(true, Ordering::SeqCst);
    let store = Arc::new(CountingStore::default());
    let batcher = batcher(backend.clone(), store.clone(), signed_in(), Duration::from_secs(60));

    let outcomes: Outcomes = Arc::default();
    for name in ["a", "b", "c"] {
        send_recorded(&batcher, &outcomes, name).await;
    }

    let err = batcher.flush().await.unwrap_err();
    assert!(matches!(err, SdkError::Server { status: 500, .. }));
    assert_eq!(batcher.queued_len(), 3);
    assert_eq!(
        store.stored_events().await.unwrap(),
        vec![event("a"), event("b"), event("c")]
    );
    {
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|(_, r)| r.is_err()));
    }

    // A newer event lands behind the requeued batch.
    send_recorded(&batcher, &outcomes, "d").await;
    backend.fail.store(false, Ordering::SeqCst);
    batcher.flush().await.unwrap();

    assert_eq!(
        backend.batches()[1],
        vec![event("a"), event("b"), event("c"), event("d")]
    );
    assert!(store.stored_events().await.is_none());

    // Requeued events do not fire their callbacks a second time.
    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 4);
    assert_eq!(outcomes[3].0, "d");
    assert!(outcomes[3].1.is_ok());
}

#[tokio::test]
async fn test_send_during_flush_lands_in_next_batch() {
    let backend = Arc::new(TelemetryBackend::default());
    let store = Arc::new(CountingStore::default());
    let batcher = batcher(backend.clone(), store.clone(), signed_in(), Duration::from_secs(60));

    batcher.send(event("a")).await;
    backend.hold.store(true, Ordering::SeqCst);
    let in_flight = {
        let batcher = batcher.clone();
        tokio::spawn(async move { batcher.flush().await })
    };
    wait_until(|| backend.calls() == 1).await;

    batcher.send(event("b")).await;
    assert_eq!(batcher.queued_len(), 1);
    assert_eq!(store.stored_events().await.unwrap(), vec![event("a"), event("b")]);

    backend.hold.store(false, Ordering::SeqCst);
    backend.release.notify_one();
    in_flight.await.unwrap().unwrap();

    assert_eq!(backend.batches(), vec![vec![event("a")]]);
    assert_eq!(batcher.queued_len(), 1);
    assert_eq!(store.stored_events().await.unwrap(), vec![event("b")]);

    batcher.flush().await.unwrap();
    assert_eq!(backend.batches()[1], vec![event("b")]);
    assert_eq!(batcher.queued_len(), 0);
    assert!(store.stored_events().await.is_none());
}

#[tokio::test]
async fn test_empty_flush_makes_no_call() {
    let backend = Arc::new(TelemetryBackend::default());
    let store = Arc::new(CountingStore::default());
    let batcher = batcher(backend.clone(), store, signed_in(), Duration::from_secs(60));

    batcher.flush().await.unwrap();
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn test_flush_without_session_leaves_queue() {
    let backend = Arc::new(TelemetryBackend::default());
    let store = Arc::new(CountingStore::default());
    let batcher = batcher(backend.clone(), store.clone(), Session::new(), Duration::from_secs(60));

    batcher.send(event("a")).await;
    assert!(matches!(batcher.flush().await, Err(SdkError::Config(_))));
    assert_eq!(batcher.queued_len(), 1);
    assert_eq!(backend.calls(), 0);
    // No identity, no durable copy.
    assert!(store.stored_events().await.is_none());
}

#[tokio::test]
async fn test_immediate_event_bypasses_queue() {
    let backend = Arc::new(TelemetryBackend::default());
    let store = Arc::new(CountingStore::default());
    let batcher = batcher(backend.clone(), store.clone(), signed_in(), Duration::from_secs(60));
    batcher.set_immediate_events(["crash"]);

    let (tx, rx) = tokio::sync::oneshot::channel();
    batcher
        .send_with_callback(event("crash"), move |result| {
            let _ = tx.send(result);
        })
        .await;

    rx.await.unwrap().unwrap();
    assert_eq!(backend.batches(), vec![vec![event("crash")]]);
    assert_eq!(batcher.queued_len(), 0);
    assert!(store.stored_events().await.is_none());
    assert!(!batcher.is_flush_loop_running());
}

#[tokio::test]
async fn test_leftovers_are_recovered_once_session_is_valid() {
    let backend = Arc::new(TelemetryBackend::default());
    let store = Arc::new(CountingStore::default());
    let leftovers = vec![event("old-1"), event("old-2")];
    store
        .set(TABLE, USER, &serde_json::to_string(&leftovers).unwrap())
        .await
        .unwrap();

    let session = Session::new();
    let _batcher = batcher(backend.clone(), store.clone(), session.clone(), Duration::from_secs(60));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(backend.calls(), 0);

    session.set(Identity::new(USER, "token-1"));
    wait_until(|| store.deletes.load(Ordering::SeqCst) > 0).await;

    assert_eq!(backend.batches(), vec![leftovers]);
    assert!(store.stored_events().await.is_none());

    // A token refresh for the same user does not resend anything.
    session.set(Identity::new(USER, "token-2"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.calls(), 1);
    assert_eq!(store.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_recovery_keeps_record_for_next_flush() {
    let backend = Arc::new(TelemetryBackend::default());
    backend.fail.store(true, Ordering::SeqCst);
    let store = Arc::new(CountingStore::default());
    let leftovers = vec![event("old-1"), event("old-2")];
    store
        .set(TABLE, USER, &serde_json::to_string(&leftovers).unwrap())
        .await
        .unwrap();

    let batcher = batcher(backend.clone(), store.clone(), signed_in(), Duration::from_secs(60));
    wait_until(|| batcher.queued_len() == 2).await;

    assert_eq!(backend.calls(), 1);
    assert_eq!(store.stored_events().await.unwrap(), leftovers);
    assert_eq!(store.deletes.load(Ordering::SeqCst), 0);

    backend.fail.store(false, Ordering::SeqCst);
    batcher.flush().await.unwrap();
    assert_eq!(backend.batches()[1], leftovers);
    assert!(store.stored_events().await.is_none());
}

#[tokio::test]
async fn test_new_events_keep_unsent_leftovers_durable() {
    let backend = Arc::new(TelemetryBackend::default());
    backend.fail.store(true, Ordering::SeqCst);
    let store = Arc::new(CountingStore::default());
    store
        .set(TABLE, USER, &serde_json::to_string(&vec![event("old")]).unwrap())
        .await
        .unwrap();

    let batcher = batcher(backend.clone(), store.clone(), signed_in(), Duration::from_secs(60));
    batcher.send(event("new")).await;

    let stored = store.stored_events().await.unwrap();
    assert!(stored.contains(&event("old")));
    assert!(stored.contains(&event("new")));
}

#[tokio::test(start_paused = true)]
async fn test_periodic_flush_runs_until_session_ends() {
    let backend = Arc::new(TelemetryBackend::default());
    let store = Arc::new(CountingStore::default());
    let session = signed_in();
    let batcher = batcher(backend.clone(), store, session.clone(), Duration::from_secs(5));

    batcher.send(event("a")).await;
    assert!(batcher.is_flush_loop_running());

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(backend.batches(), vec![vec![event("a")]]);

    session.invalidate();
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!batcher.is_flush_loop_running());

    // The next send restarts the loop.
    session.set(Identity::new(USER, "token-1"));
    batcher.send(event("b")).await;
    assert!(batcher.is_flush_loop_running());
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn test_batch_frequency_is_clamped() {
    let backend = Arc::new(TelemetryBackend::default());
    let store = Arc::new(CountingStore::default());
    let batcher = batcher(backend, store, signed_in(), Duration::from_secs(1));
    assert_eq!(batcher.batch_frequency(), Duration::from_secs(5));

    batcher.set_batch_frequency(Duration::from_secs(30));
    assert_eq!(batcher.batch_frequency(), Duration::from_secs(30));
    batcher.set_batch_frequency(Duration::from_millis(10));
    assert_eq!(batcher.batch_frequency(), Duration::from_secs(5));
}

#[tokio::test]
async fn test_clear_queued_and_delete_cache() {
    let backend = Arc::new(TelemetryBackend::default());
    let store = Arc::new(CountingStore::default());
    let batcher = batcher(backend.clone(), store.clone(), signed_in(), Duration::from_secs(60));

    let outcomes: Outcomes = Arc::default();
    send_recorded(&batcher, &outcomes, "a").await;
    send_recorded(&batcher, &outcomes, "b").await;

    batcher.clear_queued();
    assert_eq!(batcher.queued_len(), 0);
    {
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(
            outcomes
                .iter()
                .all(|(_, r)| matches!(r, Err(SdkError::Cancelled)))
        );
    }
    // Cleared events stay durable until the cache is deleted.
    assert_eq!(store.stored_events().await.unwrap().len(), 2);

    batcher.delete_cache().await.unwrap();
    assert!(store.stored_events().await.is_none());
    batcher.flush().await.unwrap();
    assert_eq!(backend.calls(), 0);
}
