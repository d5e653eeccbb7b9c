// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request envelope and response types.
//!
//! A [`RequestEnvelope`] is an immutable description of one outbound call.
//! Callers build it once with [`RequestBuilder`] and hand it to the
//! scheduler, which never mutates it.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Result, SdkError};

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered header list with case-insensitive names.
///
/// Insertion order is preserved; duplicate names are allowed through
/// [`Headers::append`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header, keeping existing values with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every value of `name` with a single value, keeping the
    /// position of the first occurrence.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(first) => {
                self.entries[first].1 = value;
                let mut index = 0;
                self.entries.retain(|(n, _)| {
                    let keep = index <= first || !n.eq_ignore_ascii_case(&name);
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Immutable description of one outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    method: Method,
    url: String,
    headers: Headers,
    body: Option<Bytes>,
    timeout: Duration,
    delay: Option<Duration>,
}

impl RequestEnvelope {
    /// Start building a request.
    pub fn builder(method: Method, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(method, url)
    }

    pub fn get(url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(Method::Post, url)
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Deadline for a response, measured from the moment the call starts.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Artificial delay applied before the call starts.
    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    pub(crate) fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Builder for [`RequestEnvelope`].
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    method: Method,
    url: String,
    headers: Headers,
    body: Option<Bytes>,
    timeout: Duration,
    delay: Option<Duration>,
    error: Option<SdkError>,
}

impl RequestBuilder {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Headers::new(),
            body: None,
            timeout: Duration::from_millis(crate::config::DEFAULT_REQUEST_TIMEOUT_MS),
            delay: None,
            error: None,
        }
    }

    /// Set a header, replacing any previous value with the same name.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the `Authorization: Bearer <token>` header.
    pub fn bearer_auth(self, token: impl fmt::Display) -> Self {
        self.header("Authorization", format!("Bearer {}", token))
    }

    /// Set a raw body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body and set the content type.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                self.body = Some(Bytes::from(bytes));
                self.header("Content-Type", "application/json")
            }
            Err(e) => {
                self.error = Some(e.into());
                self
            }
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Wait this long before starting the call.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Finish building. Fails if the URL is empty or a JSON body could not
    /// be serialized.
    pub fn build(self) -> Result<RequestEnvelope> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.url.trim().is_empty() {
            return Err(SdkError::Config("request url is empty".to_string()));
        }
        Ok(RequestEnvelope {
            method: self.method,
            url: self.url,
            headers: self.headers,
            body: self.body,
            timeout: self.timeout,
            delay: self.delay,
        })
    }
}

/// Response to a completed call. Non-2xx statuses are still responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    status: u16,
    headers: Headers,
    body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, headers: Headers, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Body as UTF-8 text, lossily decoded.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Turn a non-success response into [`SdkError::Server`].
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(SdkError::Server {
                status: self.status,
                message: self.text(),
            })
        }
    }
}

/// Outcome of one scheduled call: a response or an error, never both.
pub type SendResult = std::result::Result<HttpResponse, SdkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_case_insensitive() {
        let mut headers = Headers::new();
        headers.append("X-Trace", "a");
        headers.append("Accept", "text/plain");
        headers.append("x-trace", "b");

        assert_eq!(headers.get("x-TRACE"), Some("a"));
        assert_eq!(headers.get_all("X-Trace").collect::<Vec<_>>(), vec!["a", "b"]);

        headers.insert("X-TRACE", "c");
        assert_eq!(headers.get_all("x-trace").collect::<Vec<_>>(), vec!["c"]);
        let names: Vec<_> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["X-Trace", "Accept"]);
    }

    #[test]
    fn test_builder_json_body() {
        let request = RequestEnvelope::post("https://api.example.net/events")
            .bearer_auth("tok")
            .json(&serde_json::json!({"a": 1}))
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        assert_eq!(request.method(), Method::Post);
        assert_eq!(request.headers().get("authorization"), Some("Bearer tok"));
        assert_eq!(request.headers().get("content-type"), Some("application/json"));
        assert_eq!(request.body().unwrap().as_ref(), br#"{"a":1}"#);
        assert_eq!(request.timeout(), Duration::from_secs(5));
        assert_eq!(request.delay(), None);
    }

    #[test]
    fn test_builder_rejects_empty_url() {
        let result = RequestEnvelope::get("  ").build();
        assert!(matches!(result, Err(SdkError::Config(_))));
    }

    #[test]
    fn test_response_helpers() {
        let response = HttpResponse::new(404, Headers::new(), "missing");
        assert!(!response.is_success());
        assert_eq!(response.text(), "missing");
        assert_eq!(
            response.error_for_status(),
            Err(SdkError::Server {
                status: 404,
                message: "missing".to_string()
            })
        );

        let response = HttpResponse::new(200, Headers::new(), r#"{"ok":true}"#);
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["ok"], true);
    }
}
