// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP transport implementations.
//!
//! The scheduler performs calls through the [`HttpTransport`] trait:
//! - `ReqwestTransport`: reqwest client with an origin-scoped cookie jar (default)
//! - custom implementations, e.g. test doubles or engine-provided stacks

use async_trait::async_trait;

use crate::envelope::{HttpResponse, RequestEnvelope};
use crate::error::Result;

/// Capability to perform one HTTP call.
///
/// Implementations report transport failures as errors and every status
/// code, including 4xx/5xx, as a response. Deadlines are enforced by the
/// scheduler; implementations may also honour [`RequestEnvelope::timeout`].
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Perform the call described by `request`.
    async fn perform(&self, request: &RequestEnvelope) -> Result<HttpResponse>;

    /// Forget cookies stored for `origin`. Transports without cookie
    /// storage have nothing to clear.
    async fn clear_cookies(&self, _origin: &str) -> Result<()> {
        Ok(())
    }
}

/// Normalize a URL down to `scheme://host[:port]`, lowercased.
pub(crate) fn origin_key(url: &str) -> String {
    let trimmed = url.trim();
    let (scheme, rest) = match trimmed.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, trimmed),
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let authority = authority.rsplit('@').next().unwrap_or_default();
    match scheme {
        Some(scheme) => format!("{}://{}", scheme, authority).to_ascii_lowercase(),
        None => authority.to_ascii_lowercase(),
    }
}

#[cfg(feature = "http")]
pub use reqwest_impl::{OriginCookieJar, ReqwestTransport};

#[cfg(feature = "http")]
mod reqwest_impl {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use reqwest::Url;
    use reqwest::cookie::CookieStore;
    use reqwest::header::HeaderValue;
    use tracing::{debug, instrument};

    use super::{HttpTransport, origin_key};
    use crate::envelope::{Headers, HttpResponse, Method, RequestEnvelope};
    use crate::error::{Result, SdkError};

    /// Cookie store keyed by origin so cookies can be cleared per origin.
    ///
    /// Only `name=value` pairs are tracked; attributes such as `Path` or
    /// `Expires` are ignored.
    #[derive(Debug, Default)]
    pub struct OriginCookieJar {
        cookies: Mutex<HashMap<String, BTreeMap<String, String>>>,
    }

    impl OriginCookieJar {
        pub fn new() -> Self {
            Self::default()
        }

        /// Drop every cookie stored for `origin`. Returns whether any existed.
        pub fn clear_origin(&self, origin: &str) -> bool {
            let key = origin_key(origin);
            let mut cookies = self.cookies.lock().unwrap_or_else(|e| e.into_inner());
            cookies.remove(&key).is_some_and(|c| !c.is_empty())
        }

        /// Number of cookies stored for `origin`.
        pub fn count(&self, origin: &str) -> usize {
            let key = origin_key(origin);
            let cookies = self.cookies.lock().unwrap_or_else(|e| e.into_inner());
            cookies.get(&key).map(BTreeMap::len).unwrap_or(0)
        }
    }

    impl CookieStore for OriginCookieJar {
        fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
            let key = origin_key(url.as_str());
            let mut cookies = self.cookies.lock().unwrap_or_else(|e| e.into_inner());
            let entry = cookies.entry(key).or_default();
            for header in cookie_headers {
                let Ok(raw) = header.to_str() else { continue };
                let pair = raw.split(';').next().unwrap_or_default();
                if let Some((name, value)) = pair.split_once('=') {
                    let name = name.trim();
                    if name.is_empty() {
                        continue;
                    }
                    entry.insert(name.to_string(), value.trim().to_string());
                }
            }
        }

        fn cookies(&self, url: &Url) -> Option<HeaderValue> {
            let key = origin_key(url.as_str());
            let cookies = self.cookies.lock().unwrap_or_else(|e| e.into_inner());
            let entry = cookies.get(&key).filter(|c| !c.is_empty())?;
            let joined = entry
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join("; ");
            HeaderValue::from_str(&joined).ok()
        }
    }

    /// reqwest-backed transport.
    #[derive(Debug, Clone)]
    pub struct ReqwestTransport {
        client: reqwest::Client,
        jar: Arc<OriginCookieJar>,
    }

    impl ReqwestTransport {
        /// Create a transport with its own cookie jar.
        pub fn new() -> Result<Self> {
            let jar = Arc::new(OriginCookieJar::new());
            let client = reqwest::Client::builder()
                .cookie_provider(jar.clone())
                .build()
                .map_err(|e| SdkError::Config(format!("failed to build http client: {}", e)))?;
            Ok(Self { client, jar })
        }

        /// The cookie jar shared with the underlying client.
        pub fn cookie_jar(&self) -> &Arc<OriginCookieJar> {
            &self.jar
        }
    }

    fn to_reqwest_method(method: Method) -> reqwest::Method {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
            Method::Head => reqwest::Method::HEAD,
        }
    }

    #[async_trait]
    impl HttpTransport for ReqwestTransport {
        #[instrument(skip(self, request), fields(method = %request.method(), url = %request.url()))]
        async fn perform(&self, request: &RequestEnvelope) -> Result<HttpResponse> {
            let mut builder = self
                .client
                .request(to_reqwest_method(request.method()), request.url())
                .timeout(request.timeout());

            for (name, value) in request.headers().iter() {
                builder = builder.header(name, value);
            }
            if let Some(body) = request.body() {
                builder = builder.body(body.clone());
            }

            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    SdkError::Timeout(request.timeout().as_millis() as u64)
                } else if e.is_builder() {
                    SdkError::Config(e.to_string())
                } else {
                    SdkError::Network(e.to_string())
                }
            })?;

            let status = response.status().as_u16();
            let mut headers = Headers::new();
            for (name, value) in response.headers() {
                if let Ok(value) = value.to_str() {
                    headers.append(name.as_str(), value);
                }
            }
            let body = response
                .bytes()
                .await
                .map_err(|e| SdkError::Network(e.to_string()))?;

            debug!(status, body_len = body.len(), "http call complete");
            Ok(HttpResponse::new(status, headers, body))
        }

        async fn clear_cookies(&self, origin: &str) -> Result<()> {
            let cleared = self.jar.clear_origin(origin);
            debug!(origin = %origin, cleared, "cookies cleared");
            Ok(())
        }
    }
}
