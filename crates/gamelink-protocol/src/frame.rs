// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for watchdog control-plane frames.
//!
//! Every frame is a single JSON text message whose top-level object carries
//! exactly one meaningful key:
//! - `{"ready":{"dsid":"..."}}` - sent once the server can accept work
//! - `{"heartbeat":{}}` - periodic keep-alive, content is irrelevant
//! - `{"drain":...}` - inbound graceful-shutdown directive
//!
//! Any other keyed object received from the watchdog is a custom command.

use serde_json::{Map, Value, json};
use thiserror::Error;

/// Key of the inbound graceful-shutdown directive.
pub const DRAIN_KEY: &str = "drain";

/// Key of the outbound ready frame.
pub const READY_KEY: &str = "ready";

/// Key of the outbound heartbeat frame.
pub const HEARTBEAT_KEY: &str = "heartbeat";

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame carries no directive")]
    Empty,
}

/// Frames produced by the game server side of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// The sender is ready to receive work.
    Ready {
        /// Dedicated server identity.
        dsid: String,
    },
    /// Keep-alive.
    Heartbeat,
}

impl OutboundFrame {
    /// Create a ready frame for the given server identity
    pub fn ready(dsid: impl Into<String>) -> Self {
        OutboundFrame::Ready { dsid: dsid.into() }
    }

    /// Create a heartbeat frame
    pub fn heartbeat() -> Self {
        OutboundFrame::Heartbeat
    }

    /// Encode the frame as JSON text for wire transmission
    pub fn encode(&self) -> String {
        let value = match self {
            OutboundFrame::Ready { dsid } => json!({ READY_KEY: { "dsid": dsid } }),
            OutboundFrame::Heartbeat => json!({ HEARTBEAT_KEY: {} }),
        };
        value.to_string()
    }
}

/// Directives received from the watchdog.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Stop accepting new work; the connection will be closed afterwards.
    Drain,
    /// Any other keyed command, passed through untouched.
    Command {
        /// Top-level key of the frame.
        name: String,
        /// Value stored under the key.
        payload: Value,
    },
}

impl Directive {
    /// Short name of the directive, used in notifications and logs.
    pub fn kind(&self) -> &str {
        match self {
            Directive::Drain => DRAIN_KEY,
            Directive::Command { name, .. } => name,
        }
    }
}

/// Decode an inbound text frame.
///
/// A frame containing a `drain` key is a drain directive regardless of any
/// other keys. Otherwise the first key names a custom command.
pub fn decode_inbound(text: &str) -> Result<Directive, FrameError> {
    let value: Value = serde_json::from_str(text)?;
    let object: Map<String, Value> = match value {
        Value::Object(object) => object,
        _ => return Err(FrameError::NotAnObject),
    };

    if object.contains_key(DRAIN_KEY) {
        return Ok(Directive::Drain);
    }

    object
        .into_iter()
        .next()
        .map(|(name, payload)| Directive::Command { name, payload })
        .ok_or(FrameError::Empty)
}
