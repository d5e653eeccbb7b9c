// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Global SDK registry.
//!
//! Lets engine glue code reach the SDK without threading it through every
//! call site. Registration happens once at startup.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::GameLinkSdk;
use crate::error::{Result, SdkError};

/// Global storage for the SDK instance.
static SDK_INSTANCE: OnceCell<Arc<GameLinkSdk>> = OnceCell::new();

/// Register an SDK instance globally.
///
/// Fails with [`SdkError::Config`] if an SDK is already registered.
///
/// # Example
///
/// ```ignore
/// use gamelink_sdk::{GameLinkSdk, register_sdk};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let sdk = GameLinkSdk::from_env()?;
///     register_sdk(sdk)?;
///     Ok(())
/// }
/// ```
pub fn register_sdk(sdk: GameLinkSdk) -> Result<()> {
    SDK_INSTANCE
        .set(Arc::new(sdk))
        .map_err(|_| SdkError::Config("SDK already registered".to_string()))?;
    debug!("SDK registered globally");
    Ok(())
}

/// Get the registered SDK, or an error if none has been registered.
pub fn sdk() -> Result<&'static Arc<GameLinkSdk>> {
    SDK_INSTANCE
        .get()
        .ok_or_else(|| SdkError::Config("no SDK registered".to_string()))
}

/// Try to get a reference to the registered SDK.
///
/// Returns `None` if no SDK has been registered.
pub fn try_sdk() -> Option<&'static Arc<GameLinkSdk>> {
    SDK_INSTANCE.get()
}
