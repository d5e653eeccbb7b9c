// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gamelink Protocol - watchdog control-plane communication layer
//!
//! This crate provides the wire protocol between a dedicated game server and
//! the backend watchdog that supervises its lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    gamelink-protocol                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Frames: ready / heartbeat out, drain / commands in         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: JSON text (serde_json)                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: WebSocket (tokio-tungstenite)                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use gamelink_protocol::{OutboundFrame, SocketConnector, WsConnector, decode_inbound};
//!
//! let connector = WsConnector::default();
//! let mut socket = connector.open("ws://localhost:5555/watchdog", "ds-1").await?;
//!
//! socket.send_text(OutboundFrame::ready("ds-1").encode()).await?;
//!
//! while let Some(Ok(SocketMessage::Text(text))) = socket.recv().await {
//!     if let Ok(Directive::Drain) = decode_inbound(&text) {
//!         break;
//!     }
//! }
//! ```

pub mod frame;
pub mod socket;

// Re-export main types
pub use frame::{Directive, FrameError, OutboundFrame, decode_inbound};
pub use socket::{
    ClientError, CloseCode, ControlSocket, IDENTITY_HEADER, SocketConnector, SocketMessage,
    WsConnector, WsConnectorConfig,
};
