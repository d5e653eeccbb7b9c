// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Current authenticated identity.
//!
//! Token acquisition happens elsewhere; the SDK only needs to know who the
//! caller is right now and to be told when that changes.

use tokio::sync::watch;

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable user id, used to key durable caches.
    pub user_id: String,
    /// Bearer token for backend calls.
    pub access_token: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: access_token.into(),
        }
    }

    /// An identity is usable only if both parts are present.
    pub fn is_valid(&self) -> bool {
        !self.user_id.is_empty() && !self.access_token.is_empty()
    }
}

/// Shared session. Clones observe the same identity.
#[derive(Debug, Clone)]
pub struct Session {
    tx: watch::Sender<Option<Identity>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Create a session with no identity.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Set or refresh the identity. Subscribers are notified.
    pub fn set(&self, identity: Identity) {
        self.tx.send_replace(Some(identity));
    }

    /// Drop the identity (logout). Subscribers are notified.
    pub fn invalidate(&self) {
        self.tx.send_replace(None);
    }

    /// The current identity, if it is valid.
    pub fn current(&self) -> Option<Identity> {
        self.tx.borrow().clone().filter(Identity::is_valid)
    }

    pub fn is_valid(&self) -> bool {
        self.tx.borrow().as_ref().is_some_and(Identity::is_valid)
    }

    /// Receive a notification on every identity change.
    pub fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.tx.subscribe()
    }
}
