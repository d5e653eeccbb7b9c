// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WebSocket client helpers for the watchdog control plane.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument};

/// Handshake header carrying the dedicated server identity.
pub const IDENTITY_HEADER: &str = "X-Ds-Id";

/// Errors that can occur in the socket client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("invalid handshake header: {0}")]
    InvalidHeader(String),

    #[error("connection timed out after {0}ms")]
    Timeout(u64),

    #[error("connection closed")]
    Closed,
}

/// WebSocket close status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// Orderly close requested by either side.
    pub const NORMAL: CloseCode = CloseCode(1000);
    /// Peer is going away (server shutdown, page navigation).
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    /// Close frame carried no status code.
    pub const NO_STATUS: CloseCode = CloseCode(1005);
    /// Connection dropped without a close frame.
    pub const ABNORMAL: CloseCode = CloseCode(1006);

    /// Raw status code.
    pub fn code(self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages surfaced by a control socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMessage {
    Text(String),
    Close(CloseCode),
}

/// A bidirectional text-message socket.
///
/// Binary, ping and pong traffic is handled by the implementation and never
/// surfaced to callers.
#[async_trait]
pub trait ControlSocket: Send {
    /// Send one text frame.
    async fn send_text(&mut self, text: String) -> Result<(), ClientError>;

    /// Receive the next message. `None` means the stream ended.
    async fn recv(&mut self) -> Option<Result<SocketMessage, ClientError>>;

    /// Close the socket with the given status code.
    async fn close(&mut self, code: CloseCode) -> Result<(), ClientError>;
}

/// Opens control sockets. Implementations may keep their own reconnect
/// logic; callers must not assume a socket never reconnects by itself.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Open a socket to `url`, identifying as `identity`.
    async fn open(&self, url: &str, identity: &str) -> Result<Box<dyn ControlSocket>, ClientError>;
}

/// Configuration for the WebSocket connector
#[derive(Debug, Clone)]
pub struct WsConnectorConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for WsConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
        }
    }
}

/// tokio-tungstenite backed connector
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    config: WsConnectorConfig,
}

impl WsConnector {
    /// Create a new connector with the given configuration
    pub fn new(config: WsConnectorConfig) -> Self {
        Self { config }
    }

    /// Get the connector configuration
    pub fn config(&self) -> &WsConnectorConfig {
        &self.config
    }
}

#[async_trait]
impl SocketConnector for WsConnector {
    #[instrument(skip(self))]
    async fn open(&self, url: &str, identity: &str) -> Result<Box<dyn ControlSocket>, ClientError> {
        let mut request = url.into_client_request()?;
        let header = HeaderValue::from_str(identity)
            .map_err(|e| ClientError::InvalidHeader(e.to_string()))?;
        request.headers_mut().insert(IDENTITY_HEADER, header);

        info!(url = %url, "opening watchdog socket");

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let (stream, response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| ClientError::Timeout(self.config.connect_timeout_ms))??;

        debug!(status = %response.status(), "websocket handshake complete");
        Ok(Box::new(WsSocket { stream }))
    }
}

/// An open tokio-tungstenite stream
struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl ControlSocket for WsSocket {
    async fn send_text(&mut self, text: String) -> Result<(), ClientError> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<SocketMessage, ClientError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(SocketMessage::Text(text))),
                Ok(Message::Close(frame)) => {
                    let code = frame
                        .map(|f| CloseCode(u16::from(f.code)))
                        .unwrap_or(CloseCode::NO_STATUS);
                    return Some(Ok(SocketMessage::Close(code)));
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self, code: CloseCode) -> Result<(), ClientError> {
        let frame = CloseFrame {
            code: code.0.into(),
            reason: "client closing".into(),
        };
        match self.stream.close(Some(frame)).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
