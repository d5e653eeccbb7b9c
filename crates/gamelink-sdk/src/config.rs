// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SDK configuration.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Result, SdkError};
use crate::retry::RetryPolicy;

/// Default watchdog endpoint for a locally running dedicated server.
pub const DEFAULT_WATCHDOG_URL: &str = "ws://localhost:5555/watchdog";

/// Default request timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Default number of requests executing at once.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 4;

/// Default watchdog heartbeat interval in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;

/// Default watchdog connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default telemetry flush interval in milliseconds.
pub const DEFAULT_TELEMETRY_INTERVAL_MS: u64 = 60_000;

/// Smallest telemetry flush interval the batcher accepts.
pub const MIN_TELEMETRY_INTERVAL_MS: u64 = 5_000;

/// Default directory for the file-backed durable store.
pub const DEFAULT_CACHE_DIR: &str = ".gamelink-cache";

/// SDK configuration.
#[derive(Debug, Clone)]
pub struct SdkConfig {
    /// Backend base URL (required), e.g. `https://demo.example.net`
    pub base_url: String,
    /// Game namespace (required)
    pub namespace: String,
    /// Environment name, used to scope durable caches (default: "default")
    pub environment: String,
    /// Per-request timeout in milliseconds (default: 30_000)
    pub request_timeout_ms: u64,
    /// Maximum requests executing concurrently (default: 4)
    pub max_concurrent_requests: usize,
    /// Minimum gap between request starts in milliseconds (default: 0)
    pub request_pacing_ms: u64,
    /// Watchdog WebSocket URL (default: "ws://localhost:5555/watchdog")
    pub watchdog_url: String,
    /// Watchdog heartbeat interval in milliseconds (default: 15_000)
    pub heartbeat_interval_ms: u64,
    /// Watchdog connect timeout in milliseconds (default: 10_000)
    pub connect_timeout_ms: u64,
    /// Watchdog reconnect policy
    pub retry: RetryPolicy,
    /// Telemetry flush interval in milliseconds (default: 60_000, floor 5_000)
    pub telemetry_interval_ms: u64,
    /// Telemetry event names that bypass batching
    pub immediate_events: Vec<String>,
    /// Directory for the file-backed durable store
    pub cache_dir: PathBuf,
}

impl SdkConfig {
    /// Load configuration from environment variables.
    ///
    /// # Required Environment Variables
    /// - `GAMELINK_BASE_URL` - Backend base URL
    /// - `GAMELINK_NAMESPACE` - Game namespace
    ///
    /// # Optional Environment Variables
    /// - `GAMELINK_ENVIRONMENT` - Environment name (default: "default")
    /// - `GAMELINK_REQUEST_TIMEOUT_MS` - Request timeout (default: 30000)
    /// - `GAMELINK_MAX_CONCURRENT_REQUESTS` - Concurrent requests (default: 4)
    /// - `GAMELINK_REQUEST_PACING_MS` - Gap between request starts (default: 0)
    /// - `GAMELINK_WATCHDOG_URL` - Watchdog URL (default: "ws://localhost:5555/watchdog")
    /// - `GAMELINK_WATCHDOG_HEARTBEAT_INTERVAL_MS` - Heartbeat interval (default: 15000)
    /// - `GAMELINK_WATCHDOG_CONNECT_TIMEOUT_MS` - Connect timeout (default: 10000)
    /// - `GAMELINK_RETRY_TOTAL_TIMEOUT_MS` - Reconnect budget (default: 60000)
    /// - `GAMELINK_RETRY_INITIAL_BACKOFF_MS` - First reconnect delay (default: 1000)
    /// - `GAMELINK_RETRY_MAX_BACKOFF_MS` - Reconnect delay cap (default: 30000)
    /// - `GAMELINK_TELEMETRY_INTERVAL_MS` - Telemetry flush interval (default: 60000)
    /// - `GAMELINK_TELEMETRY_IMMEDIATE_EVENTS` - Comma-separated event names
    /// - `GAMELINK_CACHE_DIR` - Durable cache directory (default: ".gamelink-cache")
    pub fn from_env() -> Result<Self> {
        let base_url = env::var("GAMELINK_BASE_URL")
            .map_err(|_| SdkError::Config("GAMELINK_BASE_URL is required".to_string()))?;

        let namespace = env::var("GAMELINK_NAMESPACE")
            .map_err(|_| SdkError::Config("GAMELINK_NAMESPACE is required".to_string()))?;

        let mut config = Self::new(base_url, namespace);

        if let Ok(environment) = env::var("GAMELINK_ENVIRONMENT") {
            config.environment = environment;
        }
        if let Ok(url) = env::var("GAMELINK_WATCHDOG_URL") {
            config.watchdog_url = url;
        }
        if let Ok(dir) = env::var("GAMELINK_CACHE_DIR") {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Ok(names) = env::var("GAMELINK_TELEMETRY_IMMEDIATE_EVENTS") {
            config.immediate_events = parse_list(&names);
        }

        config.request_timeout_ms =
            env_number("GAMELINK_REQUEST_TIMEOUT_MS", config.request_timeout_ms)?;
        config.max_concurrent_requests = env_number(
            "GAMELINK_MAX_CONCURRENT_REQUESTS",
            config.max_concurrent_requests,
        )?;
        config.request_pacing_ms =
            env_number("GAMELINK_REQUEST_PACING_MS", config.request_pacing_ms)?;
        config.heartbeat_interval_ms = env_number(
            "GAMELINK_WATCHDOG_HEARTBEAT_INTERVAL_MS",
            config.heartbeat_interval_ms,
        )?;
        config.connect_timeout_ms =
            env_number("GAMELINK_WATCHDOG_CONNECT_TIMEOUT_MS", config.connect_timeout_ms)?;
        config.retry = RetryPolicy::new(
            env_number("GAMELINK_RETRY_TOTAL_TIMEOUT_MS", config.retry.total_timeout_ms)?,
            env_number(
                "GAMELINK_RETRY_INITIAL_BACKOFF_MS",
                config.retry.initial_backoff_ms,
            )?,
            env_number("GAMELINK_RETRY_MAX_BACKOFF_MS", config.retry.max_backoff_ms)?,
        );
        config.telemetry_interval_ms =
            env_number("GAMELINK_TELEMETRY_INTERVAL_MS", config.telemetry_interval_ms)?;

        Ok(config)
    }

    /// Create a new configuration with the given base URL and namespace.
    pub fn new(base_url: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            namespace: namespace.into(),
            environment: "default".to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            request_pacing_ms: 0,
            watchdog_url: DEFAULT_WATCHDOG_URL.to_string(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            retry: RetryPolicy::default(),
            telemetry_interval_ms: DEFAULT_TELEMETRY_INTERVAL_MS,
            immediate_events: Vec::new(),
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
        }
    }

    /// Create a configuration for local development.
    ///
    /// Points the backend at `http://localhost:8080` and uses the default
    /// local watchdog endpoint.
    pub fn localhost(namespace: impl Into<String>) -> Self {
        Self::new("http://localhost:8080", namespace)
    }

    /// Set the environment name.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    /// Set the request concurrency limit and pacing gap.
    pub fn with_request_limits(mut self, max_concurrent: usize, pacing_ms: u64) -> Self {
        self.max_concurrent_requests = max_concurrent;
        self.request_pacing_ms = pacing_ms;
        self
    }

    /// Set the watchdog URL.
    pub fn with_watchdog_url(mut self, url: impl Into<String>) -> Self {
        self.watchdog_url = url.into();
        self
    }

    /// Set the watchdog heartbeat interval.
    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    /// Set the watchdog reconnect policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the telemetry flush interval. Values below 5s are clamped when
    /// the batcher starts.
    pub fn with_telemetry_interval_ms(mut self, interval_ms: u64) -> Self {
        self.telemetry_interval_ms = interval_ms;
        self
    }

    /// Set the telemetry events that bypass batching.
    pub fn with_immediate_events<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.immediate_events = names.into_iter().map(Into::into).collect();
        self
    }

    /// Set the durable cache directory.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Durable table that holds unsent telemetry for this environment.
    pub fn telemetry_table(&self) -> String {
        format!("GameTelemetryCache/{}.cache", self.environment)
    }
}

fn env_number<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|e| SdkError::Config(format!("invalid {}: {}", name, e))),
        Err(_) => Ok(default),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
