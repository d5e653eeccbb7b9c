// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gamelink Agent - dedicated-server watchdog companion
//!
//! The agent:
//! - Connects to the watchdog as `GAMELINK_DS_ID`
//! - Sends ready and keeps the connection alive with heartbeats
//! - Exits cleanly on a drain directive, a give-up, or Ctrl-C

use std::env;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use gamelink_sdk::{GameLinkSdk, SdkConfig, WatchdogEvent};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gamelink_sdk=info".parse()?),
        )
        .init();

    info!("Starting Gamelink Agent");

    let config = SdkConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        base_url = %config.base_url,
        watchdog_url = %config.watchdog_url,
        heartbeat_ms = config.heartbeat_interval_ms,
        "Configuration loaded"
    );

    let sdk = GameLinkSdk::new(config).context("failed to create SDK")?;

    let Some(ds_id) = env::var("GAMELINK_DS_ID").ok().filter(|id| !id.trim().is_empty()) else {
        warn!("GAMELINK_DS_ID is not set, nothing to supervise");
        sdk.shutdown().await;
        return Ok(());
    };

    let watchdog = sdk.watchdog();
    let mut events = watchdog.subscribe();
    watchdog.connect(&ds_id)?;
    watchdog.send_ready()?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            event = events.recv() => match event {
                Ok(WatchdogEvent::Opened) => info!("Watchdog connection open"),
                Ok(WatchdogEvent::Closed(code)) => info!(code = code.code(), "Watchdog connection closed"),
                Ok(WatchdogEvent::RetryFailed { attempt, next_delay, error }) => warn!(
                    attempt,
                    delay_ms = next_delay.as_millis() as u64,
                    error = %error,
                    "Watchdog connect attempt failed"
                ),
                Ok(WatchdogEvent::MessageReceived { kind, payload }) => {
                    info!(kind = %kind, payload = %payload, "Watchdog command received")
                }
                Ok(WatchdogEvent::Draining) => {
                    info!("Drain requested, shutting down");
                    break;
                }
                Ok(WatchdogEvent::GaveUp { attempts, error }) => {
                    error!(attempts, error = %error, "Watchdog unreachable, giving up");
                    break;
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed watchdog notifications"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    sdk.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}
