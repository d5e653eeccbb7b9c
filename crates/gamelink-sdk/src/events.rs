// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Telemetry event types and request building utilities.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::RequestEnvelope;
use crate::error::Result;
use crate::session::Identity;

/// Path of the protected telemetry ingestion endpoint.
pub const TELEMETRY_PATH: &str = "/game-telemetry/v1/protected/events";

/// One telemetry event.
///
/// Serialized with the field names the ingestion service expects; the same
/// shape is used for the durable cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    #[serde(rename = "EventName")]
    pub name: String,
    #[serde(rename = "EventNamespace")]
    pub namespace: String,
    #[serde(rename = "Payload")]
    pub payload: Value,
}

impl TelemetryEvent {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            payload,
        }
    }
}

/// Full telemetry endpoint URL for a backend base URL.
pub(crate) fn telemetry_url(base_url: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), TELEMETRY_PATH)
}

/// Build the POST carrying `events` as a JSON array.
pub(crate) fn build_batch_request(
    base_url: &str,
    identity: &Identity,
    events: &[TelemetryEvent],
    timeout: std::time::Duration,
) -> Result<RequestEnvelope> {
    RequestEnvelope::post(telemetry_url(base_url))
        .bearer_auth(&identity.access_token)
        .json(events)
        .timeout(timeout)
        .build()
}

/// Encode events for the durable cache.
pub(crate) fn encode_cache(events: &[TelemetryEvent]) -> Result<String> {
    Ok(serde_json::to_string(events)?)
}

/// Decode a durable cache record.
pub(crate) fn decode_cache(raw: &str) -> Result<Vec<TelemetryEvent>> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_event_wire_field_names() {
        let event = TelemetryEvent::new("level_start", "mygame", json!({"level": 3}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"EventName": "level_start", "EventNamespace": "mygame", "Payload": {"level": 3}})
        );
    }

    #[test]
    fn test_build_batch_request() {
        let identity = Identity::new("user-1", "tok");
        let events = vec![
            TelemetryEvent::new("a", "ns", json!({})),
            TelemetryEvent::new("b", "ns", json!(null)),
        ];
        let request =
            build_batch_request("https://api.example.net/", &identity, &events, Duration::from_secs(3))
                .unwrap();

        assert_eq!(
            request.url(),
            "https://api.example.net/game-telemetry/v1/protected/events"
        );
        assert_eq!(request.headers().get("Authorization"), Some("Bearer tok"));
        let body: Vec<TelemetryEvent> = serde_json::from_slice(request.body().unwrap()).unwrap();
        assert_eq!(body, events);
    }

    #[test]
    fn test_cache_encoding() {
        let events = vec![TelemetryEvent::new("a", "ns", json!(1))];
        let raw = encode_cache(&events).unwrap();
        assert_eq!(decode_cache(&raw).unwrap(), events);
        assert!(decode_cache("not json").is_err());
    }
}
