// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gamelink SDK - client-side plumbing for game-services backends.
//!
//! This crate provides the asynchronous layer every backend API wrapper
//! funnels through. REST wrappers themselves live elsewhere; they build
//! [`RequestEnvelope`]s and consume the parsed responses.
//!
//! # Features
//!
//! - **Task Scheduler**: bounded-concurrency, paced FIFO execution of HTTP
//!   calls with per-task timeout, cancellation and exactly-once callbacks
//! - **Watchdog**: long-lived control-plane socket for dedicated servers
//!   with reconnect backoff, heartbeats and drain handling
//! - **Telemetry**: batched event delivery mirrored to durable storage so
//!   nothing is lost across failures or restarts
//!
//! # Quick Start
//!
//! ```ignore
//! use gamelink_sdk::{GameLinkSdk, Identity, SdkConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> gamelink_sdk::Result<()> {
//!     let sdk = GameLinkSdk::new(SdkConfig::new("https://api.example.net", "mygame"))?;
//!     sdk.sign_in(Identity::new("user-1", "access-token"));
//!
//!     // Queued, mirrored to disk, flushed once a minute
//!     sdk.telemetry().send(sdk.event("match_end", json!({"score": 12}))).await;
//!
//!     sdk.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Dedicated servers
//!
//! ```ignore
//! let watchdog = sdk.watchdog();
//! let mut events = watchdog.subscribe();
//!
//! watchdog.connect("ds-7f3a")?;
//! watchdog.send_ready()?;
//!
//! while let Ok(event) = events.recv().await {
//!     if event == WatchdogEvent::Draining {
//!         // stop taking matches, then:
//!         watchdog.disconnect().await;
//!         break;
//!     }
//! }
//! ```
//!
//! # Configuration
//!
//! ## Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `GAMELINK_BASE_URL` | Yes | - | Backend base URL |
//! | `GAMELINK_NAMESPACE` | Yes | - | Game namespace |
//! | `GAMELINK_ENVIRONMENT` | No | `default` | Scopes durable caches |
//! | `GAMELINK_REQUEST_TIMEOUT_MS` | No | `30000` | Request timeout |
//! | `GAMELINK_MAX_CONCURRENT_REQUESTS` | No | `4` | Concurrent requests |
//! | `GAMELINK_REQUEST_PACING_MS` | No | `0` | Gap between request starts |
//! | `GAMELINK_WATCHDOG_URL` | No | `ws://localhost:5555/watchdog` | Watchdog endpoint |
//! | `GAMELINK_WATCHDOG_HEARTBEAT_INTERVAL_MS` | No | `15000` | Heartbeat interval |
//! | `GAMELINK_WATCHDOG_CONNECT_TIMEOUT_MS` | No | `10000` | Socket open timeout |
//! | `GAMELINK_RETRY_TOTAL_TIMEOUT_MS` | No | `60000` | Reconnect budget |
//! | `GAMELINK_RETRY_INITIAL_BACKOFF_MS` | No | `1000` | First reconnect delay |
//! | `GAMELINK_RETRY_MAX_BACKOFF_MS` | No | `30000` | Reconnect delay cap |
//! | `GAMELINK_TELEMETRY_INTERVAL_MS` | No | `60000` | Flush interval (min 5000) |
//! | `GAMELINK_TELEMETRY_IMMEDIATE_EVENTS` | No | - | Comma-separated event names |
//! | `GAMELINK_CACHE_DIR` | No | `.gamelink-cache` | Durable store directory |

mod client;
mod config;
mod envelope;
mod error;
mod events;
mod registry;
mod retry;
mod scheduler;
mod session;
mod store;
mod telemetry;
mod transport;
mod watchdog;

// Main types
pub use client::GameLinkSdk;
pub use config::{
    DEFAULT_CACHE_DIR, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_TELEMETRY_INTERVAL_MS,
    DEFAULT_WATCHDOG_URL, MIN_TELEMETRY_INTERVAL_MS, SdkConfig,
};
pub use error::{Result, SdkError};

// Requests
pub use envelope::{Headers, HttpResponse, Method, RequestBuilder, RequestEnvelope, SendResult};
pub use scheduler::{Callback, SchedulerConfig, TaskHandle, TaskScheduler, TaskState};
pub use transport::HttpTransport;
#[cfg(feature = "http")]
pub use transport::{OriginCookieJar, ReqwestTransport};

// Watchdog
pub use retry::{RetryPolicy, Schedule, next_delay};
pub use watchdog::{ConnectionState, Watchdog, WatchdogConfig, WatchdogEvent};

// Telemetry
pub use events::{TELEMETRY_PATH, TelemetryEvent};
pub use session::{Identity, Session};
pub use store::{DurableStore, FileStore, MemoryStore};
pub use telemetry::{BatchCallback, EventCallback, TelemetryBatcher, TelemetryConfig};

// Global SDK registry
pub use registry::{register_sdk, sdk, try_sdk};

// Re-export the wire types callers need
pub use gamelink_protocol::{CloseCode, SocketConnector, WsConnector, WsConnectorConfig};
