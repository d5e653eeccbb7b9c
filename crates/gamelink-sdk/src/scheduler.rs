// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded-concurrency request scheduler.
//!
//! Every outbound HTTP call goes through a [`TaskScheduler`]. Submissions
//! never block: they are appended to a FIFO queue drained by a single
//! dispatcher task, which starts calls in submission order while at most
//! `max_concurrent` of them are running and at least `pacing` has passed
//! since the previous start.
//!
//! Each submission gets exactly one completion callback:
//! - `Ok(response)` for any HTTP status
//! - `Err(SdkError::Timeout)` if no response arrived in time
//! - `Err(SdkError::Cancelled)` if the task was cancelled or cleared
//! - `Err(..)` for transport failures
//!
//! Callbacks are never invoked while a scheduler lock is held.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, instrument, warn};

use crate::config::SdkConfig;
use crate::envelope::{RequestEnvelope, SendResult};
use crate::error::{Result, SdkError};
use crate::transport::{HttpTransport, origin_key};

/// Completion callback, invoked exactly once per admitted task.
pub type Callback = Box<dyn FnOnce(SendResult) + Send + 'static>;

/// Lifecycle of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Queued = 0,
    Executing = 1,
    Completed = 2,
    Cancelled = 3,
    TimedOut = 4,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Queued,
            1 => TaskState::Executing,
            2 => TaskState::Completed,
            3 => TaskState::Cancelled,
            _ => TaskState::TimedOut,
        }
    }

    /// Whether the task has reached a final state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::TimedOut
        )
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum calls executing at once (at least 1).
    pub max_concurrent: usize,
    /// Minimum gap between consecutive call starts.
    pub pacing: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: crate::config::DEFAULT_MAX_CONCURRENT_REQUESTS,
            pacing: Duration::ZERO,
        }
    }
}

impl From<&SdkConfig> for SchedulerConfig {
    fn from(config: &SdkConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_requests,
            pacing: Duration::from_millis(config.request_pacing_ms),
        }
    }
}

struct TaskCell {
    id: u64,
    state: AtomicU8,
    callback: Mutex<Option<Callback>>,
    submitted_at: DateTime<Utc>,
}

impl TaskCell {
    fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move a queued or executing task to Cancelled. Only the caller that
    /// wins the transition may fire the callback.
    fn try_cancel(&self) -> bool {
        self.transition(TaskState::Queued, TaskState::Cancelled)
            || self.transition(TaskState::Executing, TaskState::Cancelled)
    }

    fn fire(&self, result: SendResult) {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(callback) = callback {
            callback(result);
        }
    }
}

/// Handle to a submitted task.
#[derive(Clone)]
pub struct TaskHandle {
    cell: Arc<TaskCell>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.cell.id
    }

    pub fn state(&self) -> TaskState {
        self.cell.state()
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.cell.submitted_at
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.cell.id)
            .field("state", &self.state())
            .finish()
    }
}

struct ScheduledTask {
    cell: Arc<TaskCell>,
    envelope: RequestEnvelope,
    timeout: Duration,
}

struct Queue {
    tasks: VecDeque<ScheduledTask>,
    accepting: bool,
}

struct Inner {
    transport: Arc<dyn HttpTransport>,
    config: SchedulerConfig,
    queue: Mutex<Queue>,
    notify: Notify,
    permits: Arc<Semaphore>,
    executing: Mutex<HashMap<u64, Arc<TaskCell>>>,
    cleared_origins: Mutex<HashSet<String>>,
    next_id: AtomicU64,
}

impl Inner {
    fn lock_queue(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_executing(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<TaskCell>>> {
        self.executing.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pop the oldest task that is still queued, dropping cancelled ones,
    /// and mark it executing.
    ///
    /// The task moves from the queue to the executing set under the queue
    /// lock, so `clear_all` always sees it in one place or the other.
    fn pop_next(&self) -> Option<ScheduledTask> {
        let mut queue = self.lock_queue();
        while let Some(task) = queue.tasks.pop_front() {
            if task.cell.transition(TaskState::Queued, TaskState::Executing) {
                self.lock_executing()
                    .insert(task.cell.id, task.cell.clone());
                return Some(task);
            }
        }
        None
    }

    fn drain_queue(&self) -> Vec<ScheduledTask> {
        self.lock_queue().tasks.drain(..).collect()
    }
}

/// Request scheduler. Cheap to clone; all clones share one queue.
///
/// The dispatcher stops once the last clone is dropped; anything still
/// queued then completes with [`SdkError::Cancelled`].
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
    _guard: Arc<DropGuard>,
}

impl TaskScheduler {
    /// Create a scheduler and spawn its dispatcher.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(transport: Arc<dyn HttpTransport>, config: SchedulerConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        let inner = Arc::new(Inner {
            transport,
            config: SchedulerConfig {
                max_concurrent,
                pacing: config.pacing,
            },
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                accepting: true,
            }),
            notify: Notify::new(),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            executing: Mutex::new(HashMap::new()),
            cleared_origins: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
        });

        let shutdown = CancellationToken::new();
        tokio::spawn(dispatch_loop(inner.clone(), shutdown.clone()));

        Self {
            inner,
            _guard: Arc::new(shutdown.drop_guard()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Submit a request using the envelope's own timeout.
    pub fn submit<F>(&self, envelope: RequestEnvelope, on_complete: F) -> Result<TaskHandle>
    where
        F: FnOnce(SendResult) + Send + 'static,
    {
        let timeout = envelope.timeout();
        self.submit_with_timeout(envelope, timeout, on_complete)
    }

    /// Submit a request with an explicit deadline.
    ///
    /// Returns [`SdkError::Stopped`] without invoking `on_complete` when the
    /// scheduler has been cleared and not restarted.
    pub fn submit_with_timeout<F>(
        &self,
        envelope: RequestEnvelope,
        timeout: Duration,
        on_complete: F,
    ) -> Result<TaskHandle>
    where
        F: FnOnce(SendResult) + Send + 'static,
    {
        // The transport's own deadline follows the scheduler's.
        let envelope = envelope.with_timeout(timeout);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cell = Arc::new(TaskCell {
            id,
            state: AtomicU8::new(TaskState::Queued as u8),
            callback: Mutex::new(Some(Box::new(on_complete))),
            submitted_at: Utc::now(),
        });

        {
            let mut queue = self.inner.lock_queue();
            if !queue.accepting {
                return Err(SdkError::Stopped);
            }
            queue.tasks.push_back(ScheduledTask {
                cell: cell.clone(),
                envelope,
                timeout,
            });
        }
        self.inner.notify.notify_one();

        debug!(task_id = id, timeout_ms = timeout.as_millis() as u64, "task queued");
        Ok(TaskHandle { cell })
    }

    /// Submit a request and wait for its outcome.
    pub async fn send(&self, envelope: RequestEnvelope) -> SendResult {
        let (tx, rx) = oneshot::channel();
        self.submit(envelope, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await
            .map_err(|_| SdkError::Internal("task dropped without completing".to_string()))?
    }

    /// Cancel a task. Returns `true` if this call cancelled it.
    ///
    /// A queued task never executes. An executing task's call is left to
    /// finish and its result is discarded. In both cases the callback
    /// fires once with [`SdkError::Cancelled`]. Cancelling a finished task
    /// is a no-op.
    pub fn cancel(&self, handle: &TaskHandle) -> bool {
        if !handle.cell.try_cancel() {
            return false;
        }
        debug!(task_id = handle.id(), "task cancelled");
        handle.cell.fire(Err(SdkError::Cancelled));
        true
    }

    /// Cancel every queued and executing task and stop admitting new ones
    /// until [`TaskScheduler::restart`] is called.
    #[instrument(skip(self))]
    pub fn clear_all(&self) {
        let (queued, executing) = {
            let mut queue = self.inner.lock_queue();
            queue.accepting = false;
            let queued = queue.tasks.drain(..).collect::<Vec<_>>();
            let executing: Vec<Arc<TaskCell>> =
                self.inner.lock_executing().values().cloned().collect();
            (queued, executing)
        };

        let mut cancelled = 0usize;
        for cell in queued.iter().map(|t| &t.cell).chain(executing.iter()) {
            if cell.try_cancel() {
                cell.fire(Err(SdkError::Cancelled));
                cancelled += 1;
            }
        }
        info!(cancelled, "scheduler cleared");
    }

    /// Resume admitting submissions after [`TaskScheduler::clear_all`].
    pub fn restart(&self) {
        self.inner.lock_queue().accepting = true;
        self.inner
            .cleared_origins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        info!("scheduler restarted");
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.lock_queue().accepting
    }

    /// Number of tasks waiting to start.
    pub fn pending_count(&self) -> usize {
        self.inner
            .lock_queue()
            .tasks
            .iter()
            .filter(|t| t.cell.state() == TaskState::Queued)
            .count()
    }

    /// Number of tasks currently executing.
    pub fn executing_count(&self) -> usize {
        self.inner.lock_executing().len()
    }

    /// Clear cookies for the origin of `url`.
    ///
    /// Repeated calls for an origin that was already cleared are no-ops
    /// until the scheduler is restarted. A failure leaves the origin
    /// eligible for another attempt.
    #[instrument(skip(self))]
    pub async fn clear_cookies(&self, url: &str) -> Result<()> {
        let origin = origin_key(url);
        if self
            .inner
            .cleared_origins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&origin)
        {
            debug!(origin = %origin, "cookies already cleared");
            return Ok(());
        }

        if let Err(e) = self.inner.transport.clear_cookies(&origin).await {
            warn!(origin = %origin, error = %e, "failed to clear cookies");
            return Err(e);
        }

        self.inner
            .cleared_origins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(origin);
        Ok(())
    }
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("config", &self.inner.config)
            .field("pending", &self.pending_count())
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

async fn dispatch_loop(inner: Arc<Inner>, shutdown: CancellationToken) {
    debug!(
        max_concurrent = inner.config.max_concurrent,
        pacing_ms = inner.config.pacing.as_millis() as u64,
        "scheduler dispatcher started"
    );
    let mut last_start: Option<Instant> = None;

    loop {
        let permit: OwnedSemaphorePermit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            permit = inner.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        if let Some(last) = last_start {
            let next = last + inner.config.pacing;
            if next > Instant::now() {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep_until(next) => {}
                }
            }
        }

        let task = loop {
            if let Some(task) = inner.pop_next() {
                break Some(task);
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break None,
                _ = inner.notify.notified() => {}
            }
        };
        let Some(task) = task else { break };

        last_start = Some(Instant::now());
        tokio::spawn(run_task(inner.clone(), task, permit));
    }

    let leftover = inner.drain_queue();
    for task in leftover {
        if task.cell.try_cancel() {
            task.cell.fire(Err(SdkError::Cancelled));
        }
    }
    debug!("scheduler dispatcher stopped");
}

async fn run_task(inner: Arc<Inner>, task: ScheduledTask, _permit: OwnedSemaphorePermit) {
    let ScheduledTask {
        cell,
        envelope,
        timeout,
    } = task;

    if let Some(delay) = envelope.delay() {
        tokio::time::sleep(delay).await;
    }

    let outcome = if cell.state() == TaskState::Executing {
        debug!(task_id = cell.id, method = %envelope.method(), url = %envelope.url(), "task started");
        match tokio::time::timeout(timeout, inner.transport.perform(&envelope)).await {
            Ok(result) => Some(result),
            Err(_) => Some(Err(SdkError::Timeout(timeout.as_millis() as u64))),
        }
    } else {
        None
    };

    inner.lock_executing().remove(&cell.id);

    let Some(outcome) = outcome else {
        debug!(task_id = cell.id, "task cancelled during delay");
        return;
    };

    let target = match &outcome {
        Err(SdkError::Timeout(_)) => TaskState::TimedOut,
        _ => TaskState::Completed,
    };
    if cell.transition(TaskState::Executing, target) {
        match &outcome {
            Ok(response) => debug!(task_id = cell.id, status = response.status(), "task completed"),
            Err(e) => debug!(task_id = cell.id, error = %e, "task failed"),
        }
        cell.fire(outcome);
    } else {
        debug!(task_id = cell.id, "discarding result of cancelled task");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Headers, HttpResponse};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl HttpTransport for Echo {
        async fn perform(&self, request: &RequestEnvelope) -> Result<HttpResponse> {
            Ok(HttpResponse::new(200, Headers::new(), request.url().to_string()))
        }
    }

    #[test]
    fn test_task_state_round_trip() {
        for state in [
            TaskState::Queued,
            TaskState::Executing,
            TaskState::Completed,
            TaskState::Cancelled,
            TaskState::TimedOut,
        ] {
            assert_eq!(TaskState::from_u8(state as u8), state);
        }
        assert!(TaskState::TimedOut.is_terminal());
        assert!(!TaskState::Executing.is_terminal());
    }

    #[tokio::test]
    async fn test_send_returns_response() {
        let scheduler = TaskScheduler::new(Arc::new(Echo), SchedulerConfig::default());
        let request = RequestEnvelope::get("http://svc/ping").build().unwrap();
        let response = scheduler.send(request).await.unwrap();
        assert_eq!(response.text(), "http://svc/ping");
    }

    /// Holds every call until the test adds permits.
    struct Gated {
        gate: Semaphore,
    }

    #[async_trait]
    impl HttpTransport for Gated {
        async fn perform(&self, request: &RequestEnvelope) -> Result<HttpResponse> {
            let _ = self.gate.acquire().await;
            Ok(HttpResponse::new(200, Headers::new(), request.url().to_string()))
        }
    }

    #[tokio::test]
    async fn test_clear_all_cancels_task_taken_off_the_queue() {
        let transport = Arc::new(Gated {
            gate: Semaphore::new(0),
        });
        let scheduler = TaskScheduler::new(
            transport.clone(),
            SchedulerConfig {
                max_concurrent: 1,
                pacing: Duration::ZERO,
            },
        );

        let first = scheduler
            .submit(RequestEnvelope::get("http://svc/first").build().unwrap(), |_| {})
            .unwrap();
        while first.state() != TaskState::Executing {
            tokio::task::yield_now().await;
        }

        let (tx, rx) = oneshot::channel();
        let second = scheduler
            .submit(RequestEnvelope::get("http://svc/second").build().unwrap(), move |result| {
                let _ = tx.send(result);
            })
            .unwrap();

        // The only permit is held by `first`, so the dispatcher is parked.
        // Take `second` the way the dispatcher would, then clear before it
        // is handed to a worker.
        let taken = scheduler.inner.pop_next().unwrap();
        assert_eq!(taken.cell.id, second.id());
        assert_eq!(second.state(), TaskState::Executing);
        assert_eq!(scheduler.executing_count(), 2);

        scheduler.clear_all();

        assert_eq!(second.state(), TaskState::Cancelled);
        assert_eq!(first.state(), TaskState::Cancelled);
        assert!(matches!(rx.await.unwrap(), Err(SdkError::Cancelled)));

        transport.gate.add_permits(1);
    }

    #[tokio::test]
    async fn test_submit_carries_deadline_to_envelope() {
        struct Deadline(Mutex<Option<Duration>>);

        #[async_trait]
        impl HttpTransport for Deadline {
            async fn perform(&self, request: &RequestEnvelope) -> Result<HttpResponse> {
                *self.0.lock().unwrap() = Some(request.timeout());
                Ok(HttpResponse::new(200, Headers::new(), ""))
            }
        }

        let transport = Arc::new(Deadline(Mutex::new(None)));
        let scheduler = TaskScheduler::new(transport.clone(), SchedulerConfig::default());
        let (tx, rx) = oneshot::channel();
        let request = RequestEnvelope::get("http://svc/slow")
            .timeout(Duration::from_secs(1))
            .build()
            .unwrap();
        scheduler
            .submit_with_timeout(request, Duration::from_secs(60), move |result| {
                let _ = tx.send(result);
            })
            .unwrap();

        assert!(rx.await.unwrap().is_ok());
        assert_eq!(*transport.0.lock().unwrap(), Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_stopped_scheduler_rejects_without_callback() {
        let scheduler = TaskScheduler::new(Arc::new(Echo), SchedulerConfig::default());
        scheduler.clear_all();
        assert!(!scheduler.is_accepting());

        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = called.clone();
        let request = RequestEnvelope::get("http://svc/ping").build().unwrap();
        let result = scheduler.submit(request, move |_| flag.store(true, Ordering::SeqCst));

        assert!(matches!(result, Err(SdkError::Stopped)));
        tokio::task::yield_now().await;
        assert!(!called.load(Ordering::SeqCst));

        scheduler.restart();
        assert!(scheduler.is_accepting());
    }
}
