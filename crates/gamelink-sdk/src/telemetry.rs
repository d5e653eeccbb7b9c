// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable telemetry batching.
//!
//! Events are appended to an in-memory queue and mirrored into the durable
//! store under the current user id. A background loop flushes the queue
//! as one request every interval:
//!
//! 1. swap the queue for an empty one (later sends land in the new queue)
//! 2. empty batch: report success without a network call
//! 3. send the batch through the scheduler
//! 4. success: drop the flushed events from the durable mirror
//! 5. failure: put the batch back at the head of the queue, mirror intact
//! 6. fire each event's callback, then the batch callback
//!
//! Events left in the durable store by a previous run are loaded and sent
//! once as soon as a valid session exists.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, instrument, warn};

use crate::config::{MIN_TELEMETRY_INTERVAL_MS, SdkConfig};
use crate::error::{Result, SdkError};
use crate::events::{TelemetryEvent, build_batch_request, decode_cache, encode_cache};
use crate::scheduler::TaskScheduler;
use crate::session::{Identity, Session};
use crate::store::DurableStore;

/// Per-event completion callback.
pub type EventCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Callback invoked after every flush with the batch outcome.
pub type BatchCallback = Arc<dyn Fn(&Result<()>) + Send + Sync + 'static>;

/// Static batcher settings.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Backend base URL.
    pub base_url: String,
    /// Durable table holding unsent events.
    pub table: String,
    /// Flush interval (clamped to at least 5s).
    pub interval: Duration,
    /// Event names sent on their own, bypassing the queue.
    pub immediate_events: Vec<String>,
    /// Timeout for each telemetry request.
    pub request_timeout: Duration,
}

impl From<&SdkConfig> for TelemetryConfig {
    fn from(config: &SdkConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            table: config.telemetry_table(),
            interval: Duration::from_millis(config.telemetry_interval_ms),
            immediate_events: config.immediate_events.clone(),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }
}

fn clamp_interval(interval: Duration) -> Duration {
    let floor = Duration::from_millis(MIN_TELEMETRY_INTERVAL_MS);
    if interval < floor {
        warn!(
            requested_ms = interval.as_millis() as u64,
            floor_ms = MIN_TELEMETRY_INTERVAL_MS,
            "telemetry interval too small, clamping"
        );
        floor
    } else {
        interval
    }
}

struct QueuedEvent {
    seq: u64,
    /// User id the event is mirrored under; `None` if no session existed.
    key: Option<String>,
    event: TelemetryEvent,
    callback: Option<EventCallback>,
}

struct State {
    queue: VecDeque<QueuedEvent>,
    interval: Duration,
    immediate: HashSet<String>,
}

/// Durable copy of unacknowledged events for one user. An entry exists
/// once the stored record for that user has been loaded this run.
type Mirror = HashMap<String, Vec<(u64, TelemetryEvent)>>;

struct Inner {
    scheduler: TaskScheduler,
    store: Arc<dyn DurableStore>,
    session: Session,
    base_url: String,
    table: String,
    request_timeout: Duration,
    state: Mutex<State>,
    mirror: tokio::sync::Mutex<Mirror>,
    flushing: tokio::sync::Mutex<()>,
    batch_callback: Mutex<Option<BatchCallback>>,
    next_seq: AtomicU64,
    loop_running: AtomicBool,
    shutdown: CancellationToken,
}

/// Telemetry batcher. Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct TelemetryBatcher {
    inner: Arc<Inner>,
    _guard: Arc<DropGuard>,
}

impl TelemetryBatcher {
    /// Create a batcher and start watching the session for leftovers to
    /// recover.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: TelemetryConfig,
        scheduler: TaskScheduler,
        store: Arc<dyn DurableStore>,
        session: Session,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let inner = Arc::new(Inner {
            scheduler,
            store,
            session,
            base_url: config.base_url,
            table: config.table,
            request_timeout: config.request_timeout,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                interval: clamp_interval(config.interval),
                immediate: config.immediate_events.into_iter().collect(),
            }),
            mirror: tokio::sync::Mutex::new(HashMap::new()),
            flushing: tokio::sync::Mutex::new(()),
            batch_callback: Mutex::new(None),
            next_seq: AtomicU64::new(1),
            loop_running: AtomicBool::new(false),
            shutdown: shutdown.clone(),
        });

        tokio::spawn(recovery_loop(inner.clone()));

        Self {
            inner,
            _guard: Arc::new(shutdown.drop_guard()),
        }
    }

    /// Send or enqueue an event without a completion callback.
    pub async fn send(&self, event: TelemetryEvent) {
        self.enqueue(event, None).await;
    }

    /// Send or enqueue an event. `on_complete` fires exactly once, with the
    /// outcome of the request that first carried the event.
    pub async fn send_with_callback<F>(&self, event: TelemetryEvent, on_complete: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.enqueue(event, Some(Box::new(on_complete))).await;
    }

    #[instrument(skip(self, event, callback), fields(event = %event.name))]
    async fn enqueue(&self, event: TelemetryEvent, callback: Option<EventCallback>) {
        let inner = &self.inner;

        if inner.is_immediate(&event.name) {
            inner.send_immediate(event, callback);
            return;
        }

        let seq = inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let key = inner.session.current().map(|identity| identity.user_id);
        match &key {
            Some(user_id) => inner.mirror_append(user_id, seq, &event).await,
            None => debug!("no session, event queued without durable copy"),
        }

        inner.lock_state().queue.push_back(QueuedEvent {
            seq,
            key,
            event,
            callback,
        });
        inner.ensure_loop();
    }

    /// Flush the queue now. Returns the batch outcome.
    ///
    /// Fails with [`SdkError::Config`] and leaves the queue untouched when
    /// there is no valid session.
    pub async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    /// Change the flush interval. Values below 5s are clamped to 5s.
    pub fn set_batch_frequency(&self, interval: Duration) {
        self.inner.lock_state().interval = clamp_interval(interval);
    }

    pub fn batch_frequency(&self) -> Duration {
        self.inner.lock_state().interval
    }

    /// Replace the set of event names that bypass batching.
    pub fn set_immediate_events<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.lock_state().immediate = names.into_iter().map(Into::into).collect();
    }

    /// Register a callback invoked after every flush.
    pub fn on_batch<F>(&self, callback: F)
    where
        F: Fn(&Result<()>) + Send + Sync + 'static,
    {
        *self
            .inner
            .batch_callback
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
    }

    /// Drop every queued event. Their callbacks fire with
    /// [`SdkError::Cancelled`]; durable copies are kept for the next run.
    pub fn clear_queued(&self) {
        let dropped: Vec<QueuedEvent> = self.inner.lock_state().queue.drain(..).collect();
        let count = dropped.len();
        for queued in dropped {
            if let Some(callback) = queued.callback {
                callback(Err(SdkError::Cancelled));
            }
        }
        info!(count, "telemetry queue cleared");
    }

    /// Remove every durable telemetry record for this environment.
    pub async fn delete_cache(&self) -> Result<()> {
        let mut mirror = self.inner.mirror.lock().await;
        self.inner.store.reset(&self.inner.table).await?;
        for events in mirror.values_mut() {
            events.clear();
        }
        info!(table = %self.inner.table, "telemetry cache deleted");
        Ok(())
    }

    /// Number of events waiting for the next flush.
    pub fn queued_len(&self) -> usize {
        self.inner.lock_state().queue.len()
    }

    /// Whether the periodic flush loop is active.
    pub fn is_flush_loop_running(&self) -> bool {
        self.inner.loop_running.load(Ordering::Acquire)
    }

    /// Stop background work. Queued events stay in the durable store.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl fmt::Debug for TelemetryBatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryBatcher")
            .field("table", &self.inner.table)
            .field("queued", &self.queued_len())
            .finish()
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_immediate(&self, name: &str) -> bool {
        self.lock_state().immediate.contains(name)
    }

    fn send_immediate(&self, event: TelemetryEvent, callback: Option<EventCallback>) {
        let finish = move |result: Result<()>| {
            if let Some(callback) = callback {
                callback(result);
            }
        };

        let Some(identity) = self.session.current() else {
            finish(Err(SdkError::Config("no valid session".to_string())));
            return;
        };
        let request = match build_batch_request(
            &self.base_url,
            &identity,
            std::slice::from_ref(&event),
            self.request_timeout,
        ) {
            Ok(request) => request,
            Err(e) => return finish(Err(e)),
        };

        debug!(event = %event.name, "sending immediate event");
        // A rejected submission hands the error straight back; the
        // callback only runs for admitted tasks.
        let slot = Arc::new(Mutex::new(Some(finish)));
        let on_done = slot.clone();
        let submitted = self.scheduler.submit(request, move |result| {
            let finish = on_done.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(finish) = finish {
                finish(result.and_then(|r| r.error_for_status()).map(|_| ()));
            }
        });
        if let Err(e) = submitted {
            let finish = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(finish) = finish {
                finish(Err(e));
            }
        }
    }

    /// Load the stored record for `user_id` into the mirror if this run has
    /// not done so yet. Returns the events that were loaded.
    async fn hydrate(&self, mirror: &mut Mirror, user_id: &str) -> Vec<(u64, TelemetryEvent)> {
        if mirror.contains_key(user_id) {
            return Vec::new();
        }

        let loaded = match self.store.get(&self.table, user_id).await {
            Ok(Some(raw)) => match decode_cache(&raw) {
                Ok(events) => events,
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "discarding unreadable telemetry cache");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "failed to read telemetry cache");
                Vec::new()
            }
        };

        let loaded: Vec<(u64, TelemetryEvent)> = loaded
            .into_iter()
            .map(|event| (self.next_seq.fetch_add(1, Ordering::Relaxed), event))
            .collect();
        mirror.insert(user_id.to_string(), loaded.clone());
        loaded
    }

    async fn mirror_append(&self, user_id: &str, seq: u64, event: &TelemetryEvent) {
        let mut mirror = self.mirror.lock().await;
        let leftovers = self.hydrate(&mut mirror, user_id).await;

        let entry = mirror.entry(user_id.to_string()).or_default();
        entry.push((seq, event.clone()));
        self.write_record(user_id, entry).await;
        drop(mirror);

        if !leftovers.is_empty() {
            debug!(count = leftovers.len(), "queueing telemetry left from a previous run");
            self.requeue_front(
                leftovers
                    .into_iter()
                    .map(|(seq, event)| QueuedEvent {
                        seq,
                        key: Some(user_id.to_string()),
                        event,
                        callback: None,
                    })
                    .collect(),
            );
        }
    }

    async fn write_record(&self, user_id: &str, events: &[(u64, TelemetryEvent)]) {
        let result = if events.is_empty() {
            self.store.delete(&self.table, user_id).await
        } else {
            let events: Vec<TelemetryEvent> = events.iter().map(|(_, e)| e.clone()).collect();
            match encode_cache(&events) {
                Ok(raw) => self.store.set(&self.table, user_id, &raw).await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = result {
            warn!(user_id = %user_id, error = %e, "failed to update telemetry cache");
        }
    }

    /// Drop acknowledged events from the durable mirror.
    async fn forget(&self, acknowledged: &[(Option<String>, u64)]) {
        let mut by_key: HashMap<&str, HashSet<u64>> = HashMap::new();
        for (key, seq) in acknowledged {
            if let Some(key) = key {
                by_key.entry(key.as_str()).or_default().insert(*seq);
            }
        }

        let mut mirror = self.mirror.lock().await;
        for (user_id, seqs) in by_key {
            let Some(entry) = mirror.get_mut(user_id) else {
                continue;
            };
            let before = entry.len();
            entry.retain(|(seq, _)| !seqs.contains(seq));
            if entry.len() != before {
                self.write_record(user_id, entry).await;
            }
        }
    }

    fn requeue_front(&self, events: Vec<QueuedEvent>) {
        let mut state = self.lock_state();
        for queued in events.into_iter().rev() {
            state.queue.push_front(queued);
        }
    }

    async fn post_batch(&self, identity: &Identity, events: &[TelemetryEvent]) -> Result<()> {
        let request =
            build_batch_request(&self.base_url, identity, events, self.request_timeout)?;
        self.scheduler.send(request).await?.error_for_status()?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn flush(self: &Arc<Self>) -> Result<()> {
        let _flushing = self.flushing.lock().await;

        let identity = self
            .session
            .current()
            .ok_or_else(|| SdkError::Config("no valid session".to_string()))?;

        let batch: Vec<QueuedEvent> = self.lock_state().queue.drain(..).collect();
        if batch.is_empty() {
            let outcome = Ok(());
            self.fire_batch_callback(&outcome);
            return outcome;
        }

        let mut callbacks = Vec::with_capacity(batch.len());
        let mut pending = Vec::with_capacity(batch.len());
        for mut queued in batch {
            callbacks.extend(queued.callback.take());
            pending.push(queued);
        }

        let events: Vec<TelemetryEvent> = pending.iter().map(|q| q.event.clone()).collect();
        let outcome = self.post_batch(&identity, &events).await;

        match &outcome {
            Ok(()) => {
                info!(batch_size = pending.len(), "telemetry batch sent");
                let acknowledged: Vec<(Option<String>, u64)> =
                    pending.into_iter().map(|q| (q.key, q.seq)).collect();
                self.forget(&acknowledged).await;
            }
            Err(e) => {
                warn!(batch_size = pending.len(), error = %e, "telemetry batch failed, requeueing");
                self.requeue_front(pending);
            }
        }

        for callback in callbacks {
            callback(outcome.clone());
        }
        self.fire_batch_callback(&outcome);
        outcome
    }

    fn fire_batch_callback(&self, outcome: &Result<()>) {
        let callback = self
            .batch_callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(outcome);
        }
    }

    /// Send whatever a previous run left for this user, once.
    #[instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    async fn recover(self: &Arc<Self>, identity: &Identity) {
        let leftovers = {
            let mut mirror = self.mirror.lock().await;
            self.hydrate(&mut mirror, &identity.user_id).await
        };
        if leftovers.is_empty() {
            return;
        }

        info!(count = leftovers.len(), "sending telemetry left from a previous run");
        let events: Vec<TelemetryEvent> = leftovers.iter().map(|(_, e)| e.clone()).collect();
        match self.post_batch(identity, &events).await {
            Ok(()) => {
                let acknowledged: Vec<(Option<String>, u64)> = leftovers
                    .iter()
                    .map(|(seq, _)| (Some(identity.user_id.clone()), *seq))
                    .collect();
                self.forget(&acknowledged).await;
            }
            Err(e) => {
                warn!(error = %e, "recovered telemetry not sent, keeping for the next flush");
                self.requeue_front(
                    leftovers
                        .into_iter()
                        .map(|(seq, event)| QueuedEvent {
                            seq,
                            key: Some(identity.user_id.clone()),
                            event,
                            callback: None,
                        })
                        .collect(),
                );
                self.ensure_loop();
            }
        }
    }

    fn ensure_loop(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() || self.loop_running.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(flush_loop(self.clone()));
    }
}

async fn flush_loop(inner: Arc<Inner>) {
    debug!("telemetry flush loop started");
    loop {
        let interval = inner.lock_state().interval;
        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        if !inner.session.is_valid() {
            debug!("session invalid, stopping telemetry flush loop");
            break;
        }
        // Failures are logged and requeued inside flush.
        let _ = inner.flush().await;
    }
    inner.loop_running.store(false, Ordering::Release);

    let has_work = !inner.lock_state().queue.is_empty();
    if has_work && inner.session.is_valid() {
        inner.ensure_loop();
    }
    debug!("telemetry flush loop stopped");
}

async fn recovery_loop(inner: Arc<Inner>) {
    let mut rx = inner.session.subscribe();
    loop {
        let identity = rx.borrow_and_update().clone().filter(Identity::is_valid);
        if let Some(identity) = identity {
            inner.recover(&identity).await;
        }

        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_floor() {
        assert_eq!(clamp_interval(Duration::from_secs(1)), Duration::from_secs(5));
        assert_eq!(clamp_interval(Duration::from_secs(5)), Duration::from_secs(5));
        assert_eq!(clamp_interval(Duration::from_secs(90)), Duration::from_secs(90));
    }

    #[test]
    fn test_config_from_sdk_config() {
        let sdk = SdkConfig::new("https://api.example.net", "ns")
            .with_environment("prod")
            .with_immediate_events(["crash"]);
        let config = TelemetryConfig::from(&sdk);
        assert_eq!(config.table, "GameTelemetryCache/prod.cache");
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.immediate_events, vec!["crash"]);
    }
}
