// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Main SDK client bundling the scheduler, telemetry and watchdog.

use std::sync::Arc;
use std::time::Duration;

use gamelink_protocol::SocketConnector;
use serde_json::Value;
use tracing::{info, instrument};

use crate::config::SdkConfig;
use crate::envelope::{Method, RequestBuilder};
use crate::error::Result;
use crate::events::TelemetryEvent;
use crate::scheduler::{SchedulerConfig, TaskScheduler};
use crate::session::{Identity, Session};
use crate::store::DurableStore;
use crate::telemetry::{TelemetryBatcher, TelemetryConfig};
use crate::transport::HttpTransport;
use crate::watchdog::{ConnectionState, Watchdog, WatchdogConfig};

/// High-level SDK client.
///
/// Every REST call made through the SDK funnels into one shared
/// [`TaskScheduler`]; telemetry is batched on top of it and the watchdog
/// connection runs alongside.
///
/// # Example
///
/// ```ignore
/// use gamelink_sdk::{GameLinkSdk, Identity, SdkConfig};
///
/// let sdk = GameLinkSdk::new(SdkConfig::new("https://api.example.net", "mygame"))?;
/// sdk.sign_in(Identity::new(user_id, access_token));
///
/// sdk.telemetry().send(sdk.event("level_start", json!({"level": 3}))).await;
///
/// let response = sdk
///     .scheduler()
///     .send(sdk.request(Method::Get, "/social/v1/profile").build()?)
///     .await?;
/// ```
pub struct GameLinkSdk {
    config: SdkConfig,
    session: Session,
    scheduler: TaskScheduler,
    telemetry: TelemetryBatcher,
    watchdog: Watchdog,
}

impl GameLinkSdk {
    // ========== Construction ==========

    /// Create an SDK with the default collaborators: reqwest transport,
    /// WebSocket connector and a file store under `config.cache_dir`.
    ///
    /// Must be called from within a Tokio runtime.
    #[cfg(feature = "http")]
    pub fn new(config: SdkConfig) -> Result<Self> {
        use crate::store::FileStore;
        use crate::transport::ReqwestTransport;
        use gamelink_protocol::{WsConnector, WsConnectorConfig};

        let transport = ReqwestTransport::new()?;
        let connector = WsConnector::new(WsConnectorConfig {
            connect_timeout_ms: config.connect_timeout_ms,
        });
        let store = FileStore::new(config.cache_dir.clone());

        Ok(Self::with_parts(
            config,
            Arc::new(transport),
            Arc::new(connector),
            Arc::new(store),
        ))
    }

    /// Create an SDK from environment variables.
    ///
    /// See [`SdkConfig::from_env`] for required and optional environment variables.
    #[cfg(feature = "http")]
    pub fn from_env() -> Result<Self> {
        let config = SdkConfig::from_env()?;
        Self::new(config)
    }

    /// Create an SDK with injected collaborators.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_parts(
        config: SdkConfig,
        transport: Arc<dyn HttpTransport>,
        connector: Arc<dyn SocketConnector>,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        let session = Session::new();
        let scheduler = TaskScheduler::new(transport, SchedulerConfig::from(&config));
        let telemetry = TelemetryBatcher::new(
            TelemetryConfig::from(&config),
            scheduler.clone(),
            store,
            session.clone(),
        );
        let watchdog = Watchdog::new(WatchdogConfig::from(&config), connector);

        info!(
            base_url = %config.base_url,
            namespace = %config.namespace,
            environment = %config.environment,
            "SDK created"
        );

        Self {
            config,
            session,
            scheduler,
            telemetry,
            watchdog,
        }
    }

    // ========== Accessors ==========

    pub fn config(&self) -> &SdkConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn telemetry(&self) -> &TelemetryBatcher {
        &self.telemetry
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    // ========== Session ==========

    /// Install a freshly acquired identity and make sure the scheduler is
    /// admitting requests.
    #[instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub fn sign_in(&self, identity: Identity) {
        if !self.scheduler.is_accepting() {
            self.scheduler.restart();
        }
        self.session.set(identity);
        info!("signed in");
    }

    /// Drop the identity and cancel every outstanding request. Unsent
    /// telemetry stays in the durable store for the next sign-in.
    #[instrument(skip(self))]
    pub fn sign_out(&self) {
        self.scheduler.clear_all();
        self.session.invalidate();
        info!("signed out");
    }

    // ========== Helpers ==========

    /// Start a request to `path` on the backend, authorized with the
    /// current session if there is one.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let mut builder = RequestBuilder::new(method, url)
            .timeout(Duration::from_millis(self.config.request_timeout_ms));
        if let Some(identity) = self.session.current() {
            builder = builder.bearer_auth(identity.access_token);
        }
        builder
    }

    /// Build a telemetry event in this SDK's namespace.
    pub fn event(&self, name: impl Into<String>, payload: Value) -> TelemetryEvent {
        TelemetryEvent::new(name, self.config.namespace.clone(), payload)
    }

    // ========== Shutdown ==========

    /// Disconnect the watchdog, stop telemetry and cancel outstanding
    /// requests.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        if self.watchdog.state() != ConnectionState::Disconnected {
            self.watchdog.disconnect().await;
        }
        self.telemetry.shutdown();
        self.scheduler.clear_all();
        info!("SDK shut down");
    }
}

impl std::fmt::Debug for GameLinkSdk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameLinkSdk")
            .field("base_url", &self.config.base_url)
            .field("namespace", &self.config.namespace)
            .field("watchdog", &self.watchdog)
            .finish()
    }
}
