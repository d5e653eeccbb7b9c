// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Watchdog connection manager.
//!
//! Keeps one long-lived control-plane socket to the watchdog open on
//! behalf of a dedicated server:
//!
//! ```text
//!              connect()            open ok
//! Disconnected ─────────► Connecting ───────► Connected ──drain──► Draining
//!      ▲                   │    ▲                 │                    │
//!      │   budget spent    │    │  socket lost    │                    │ socket lost
//!      ├───────────────────┘    └─────────────────┘                    │
//!      │                                                               │
//!      └──────────────── Disconnecting ◄── disconnect() (any state) ───┘
//! ```
//!
//! Failed opens are retried under a [`RetryPolicy`]; once ready has been
//! sent a heartbeat frame goes out every interval while Connected.
//! Notifications are published on a broadcast channel.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gamelink_protocol::{
    CloseCode, ControlSocket, Directive, OutboundFrame, SocketConnector, SocketMessage,
    decode_inbound,
};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, instrument, warn};

use crate::config::SdkConfig;
use crate::error::{Result, SdkError};
use crate::retry::RetryPolicy;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Draining => "Draining",
            ConnectionState::Disconnecting => "Disconnecting",
        };
        f.write_str(name)
    }
}

/// Notifications published by the [`Watchdog`].
#[derive(Debug, Clone, PartialEq)]
pub enum WatchdogEvent {
    /// Socket opened.
    Opened,
    /// Socket closed, by either side, with the given code.
    Closed(CloseCode),
    /// The watchdog asked this server to drain.
    Draining,
    /// An open attempt failed; another one follows after `next_delay`.
    RetryFailed {
        attempt: u32,
        next_delay: Duration,
        error: SdkError,
    },
    /// The retry budget is spent. The manager is Disconnected.
    GaveUp { attempts: u32, error: SdkError },
    /// Any other directive from the watchdog.
    MessageReceived { kind: String, payload: Value },
}

/// Watchdog connection settings.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub url: String,
    pub heartbeat_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            url: crate::config::DEFAULT_WATCHDOG_URL.to_string(),
            heartbeat_interval: Duration::from_millis(crate::config::DEFAULT_HEARTBEAT_INTERVAL_MS),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&SdkConfig> for WatchdogConfig {
    fn from(config: &SdkConfig) -> Self {
        Self {
            url: config.watchdog_url.clone(),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            retry: config.retry,
        }
    }
}

enum Command {
    Ready,
}

enum SessionEnd {
    Cancelled,
    Lost(CloseCode),
}

struct Shared {
    state: ConnectionState,
    /// Bumped by every connect/disconnect; a loop whose generation is
    /// stale must not touch the state.
    generation: u64,
    identity: Option<String>,
    ready: bool,
    retry: RetryPolicy,
    commands: Option<mpsc::UnboundedSender<Command>>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    url: String,
    heartbeat_interval: Duration,
    connector: Arc<dyn SocketConnector>,
    shared: Mutex<Shared>,
    events: broadcast::Sender<WatchdogEvent>,
    root: CancellationToken,
}

/// Watchdog connection manager. Cheap to clone.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
    _guard: Arc<DropGuard>,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig, connector: Arc<dyn SocketConnector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let root = CancellationToken::new();
        let inner = Arc::new(Inner {
            url: config.url,
            heartbeat_interval: config.heartbeat_interval,
            connector,
            shared: Mutex::new(Shared {
                state: ConnectionState::Disconnected,
                generation: 0,
                identity: None,
                ready: false,
                retry: config.retry,
                commands: None,
                cancel: None,
                task: None,
            }),
            events,
            root: root.clone(),
        });
        Self {
            inner,
            _guard: Arc::new(root.drop_guard()),
        }
    }

    /// Start connecting as `identity` (the dedicated server id).
    ///
    /// Fails with [`SdkError::Config`] for an empty identity and with
    /// [`SdkError::Conflict`] unless Disconnected. Must be called from
    /// within a Tokio runtime.
    #[instrument(skip(self))]
    pub fn connect(&self, identity: &str) -> Result<()> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(SdkError::Config("watchdog identity is empty".to_string()));
        }

        let mut shared = self.inner.lock();
        if shared.state != ConnectionState::Disconnected {
            return Err(SdkError::conflict(shared.state, "connect"));
        }

        shared.generation += 1;
        shared.state = ConnectionState::Connecting;
        shared.identity = Some(identity.to_string());
        shared.ready = false;

        let cancel = self.inner.root.child_token();
        let (tx, rx) = mpsc::unbounded_channel();
        shared.commands = Some(tx);
        shared.cancel = Some(cancel.clone());
        shared.task = Some(tokio::spawn(connection_loop(
            self.inner.clone(),
            shared.generation,
            cancel,
            rx,
            identity.to_string(),
        )));

        info!(url = %self.inner.url, identity = %identity, "watchdog connecting");
        Ok(())
    }

    /// Tell the watchdog this server can take work, and start heartbeats.
    ///
    /// Allowed while Connecting (sent as soon as the socket opens) or
    /// Connected. Ready is re-sent after every reconnect.
    pub fn send_ready(&self) -> Result<()> {
        let mut shared = self.inner.lock();
        match shared.state {
            ConnectionState::Connecting | ConnectionState::Connected => {}
            state => return Err(SdkError::conflict(state, "send ready")),
        }
        shared.ready = true;
        if let Some(commands) = &shared.commands {
            let _ = commands.send(Command::Ready);
        }
        Ok(())
    }

    /// Stop heartbeats, close the socket and return to Disconnected.
    ///
    /// Publishes `Closed(1000)` unless already Disconnected, in which case
    /// this is a no-op.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        let (generation, cancel, task) = {
            let mut shared = self.inner.lock();
            if shared.state == ConnectionState::Disconnected {
                shared.task.take();
                shared.cancel.take();
                shared.commands.take();
                return;
            }
            if shared.state == ConnectionState::Disconnecting {
                debug!("disconnect already in progress");
                return;
            }
            shared.generation += 1;
            shared.state = ConnectionState::Disconnecting;
            shared.ready = false;
            shared.commands.take();
            (shared.generation, shared.cancel.take(), shared.task.take())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "watchdog connection task ended abnormally");
            }
        }

        {
            let mut shared = self.inner.lock();
            if shared.generation == generation {
                shared.state = ConnectionState::Disconnected;
            }
        }
        info!("watchdog disconnected");
        self.inner.emit(WatchdogEvent::Closed(CloseCode::NORMAL));
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Whether a socket is open (Connected or Draining).
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Draining
        )
    }

    /// Identity of the current or last connection.
    pub fn identity(&self) -> Option<String> {
        self.inner.lock().identity.clone()
    }

    /// Receive notifications published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchdogEvent> {
        self.inner.events.subscribe()
    }

    /// Replace the reconnect policy. Applies from the next failed attempt.
    pub fn set_retry_policy(&self, policy: RetryPolicy) {
        self.inner.lock().retry = policy;
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.lock().retry
    }

    /// Dispatch a raw inbound frame as if it had arrived on the socket.
    pub fn dispatch_frame(&self, text: &str) {
        let generation = self.inner.lock().generation;
        self.inner.handle_inbound(generation, text);
    }
}

impl fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watchdog")
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: WatchdogEvent) {
        debug!(event = ?event, "watchdog notification");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Move from one of `from` to `to` if `generation` is still current.
    fn transition(&self, generation: u64, from: &[ConnectionState], to: ConnectionState) -> bool {
        let mut shared = self.lock();
        if shared.generation != generation || !from.contains(&shared.state) {
            return false;
        }
        debug!(from = %shared.state, to = %to, "watchdog state change");
        shared.state = to;
        true
    }

    fn is_current(&self, generation: u64, state: ConnectionState) -> bool {
        let shared = self.lock();
        shared.generation == generation && shared.state == state
    }

    fn ready_requested(&self, generation: u64) -> bool {
        let shared = self.lock();
        shared.generation == generation && shared.ready
    }

    fn handle_inbound(&self, generation: u64, text: &str) {
        match decode_inbound(text) {
            Ok(Directive::Drain) => {
                if self.transition(
                    generation,
                    &[ConnectionState::Connected],
                    ConnectionState::Draining,
                ) {
                    info!("watchdog requested drain");
                    self.emit(WatchdogEvent::Draining);
                } else {
                    debug!("ignoring drain directive outside Connected");
                }
            }
            Ok(Directive::Command { name, payload }) => {
                if self.lock().state == ConnectionState::Disconnected {
                    debug!(kind = %name, "ignoring directive while disconnected");
                    return;
                }
                self.emit(WatchdogEvent::MessageReceived {
                    kind: name,
                    payload,
                });
            }
            Err(e) => warn!(error = %e, "dropping malformed watchdog frame"),
        }
    }
}

async fn connection_loop(
    inner: Arc<Inner>,
    generation: u64,
    cancel: CancellationToken,
    mut commands: mpsc::UnboundedReceiver<Command>,
    identity: String,
) {
    let mut started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            opened = inner.connector.open(&inner.url, &identity) => opened,
        };

        match opened {
            Ok(mut socket) => {
                if !inner.transition(
                    generation,
                    &[ConnectionState::Connecting],
                    ConnectionState::Connected,
                ) {
                    let _ = socket.close(CloseCode::NORMAL).await;
                    break;
                }
                info!(url = %inner.url, "watchdog connected");
                inner.emit(WatchdogEvent::Opened);

                match run_session(&inner, generation, &cancel, &mut commands, socket.as_mut(), &identity)
                    .await
                {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Lost(code) => {
                        if inner.transition(
                            generation,
                            &[ConnectionState::Connected],
                            ConnectionState::Connecting,
                        ) {
                            warn!(code = code.code(), "watchdog connection lost, reconnecting");
                            inner.emit(WatchdogEvent::Closed(code));
                            started = Instant::now();
                            attempt = 0;
                            continue;
                        }
                        if inner.transition(
                            generation,
                            &[ConnectionState::Draining],
                            ConnectionState::Disconnected,
                        ) {
                            info!(code = code.code(), "watchdog closed after drain");
                            inner.emit(WatchdogEvent::Closed(code));
                        }
                        break;
                    }
                }
            }
            Err(e) => {
                let error = SdkError::from(e);
                let policy = inner.lock().retry;
                match policy.delay_for(attempt, started.elapsed()) {
                    Some(delay) => {
                        attempt += 1;
                        warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "watchdog connect failed, retrying"
                        );
                        inner.emit(WatchdogEvent::RetryFailed {
                            attempt,
                            next_delay: delay,
                            error,
                        });
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        let attempts = attempt + 1;
                        if inner.transition(
                            generation,
                            &[ConnectionState::Connecting],
                            ConnectionState::Disconnected,
                        ) {
                            warn!(attempts, error = %error, "watchdog retry budget spent, giving up");
                            inner.emit(WatchdogEvent::GaveUp { attempts, error });
                        }
                        break;
                    }
                }
            }
        }
    }
    debug!("watchdog connection loop stopped");
}

async fn run_session(
    inner: &Inner,
    generation: u64,
    cancel: &CancellationToken,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    socket: &mut dyn ControlSocket,
    identity: &str,
) -> SessionEnd {
    let period = inner.heartbeat_interval.max(Duration::from_millis(1));
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut ready_sent = false;
    if inner.ready_requested(generation) {
        ready_sent = send_ready_frame(socket, identity).await;
        heartbeat.reset();
    }

    loop {
        let heartbeat_due =
            ready_sent && inner.is_current(generation, ConnectionState::Connected);

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                if let Err(e) = socket.close(CloseCode::NORMAL).await {
                    debug!(error = %e, "watchdog socket close failed");
                }
                return SessionEnd::Cancelled;
            }

            command = commands.recv() => match command {
                Some(Command::Ready) => {
                    if !ready_sent {
                        ready_sent = send_ready_frame(socket, identity).await;
                        heartbeat.reset();
                    }
                }
                None => {
                    let _ = socket.close(CloseCode::NORMAL).await;
                    return SessionEnd::Cancelled;
                }
            },

            _ = heartbeat.tick(), if heartbeat_due => {
                match socket.send_text(OutboundFrame::heartbeat().encode()).await {
                    Ok(()) => debug!("heartbeat sent"),
                    Err(e) => warn!(error = %e, "heartbeat send failed, retrying next tick"),
                }
            }

            message = socket.recv() => match message {
                Some(Ok(SocketMessage::Text(text))) => inner.handle_inbound(generation, &text),
                Some(Ok(SocketMessage::Close(code))) => return SessionEnd::Lost(code),
                Some(Err(e)) => {
                    warn!(error = %e, "watchdog socket error");
                    return SessionEnd::Lost(CloseCode::ABNORMAL);
                }
                None => return SessionEnd::Lost(CloseCode::ABNORMAL),
            },
        }
    }
}

async fn send_ready_frame(socket: &mut dyn ControlSocket, identity: &str) -> bool {
    match socket.send_text(OutboundFrame::ready(identity).encode()).await {
        Ok(()) => {
            info!(identity = %identity, "ready sent");
            true
        }
        Err(e) => {
            warn!(error = %e, "ready send failed");
            false
        }
    }
}
