// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};

use crate::error::{ConfigError, TransportError};

/// Default User-Agent sent with every request
pub const DEFAULT_USER_AGENT: &str = concat!("podsync/", env!("CARGO_PKG_VERSION"));

/// Maximum number of redirects followed before giving up
const MAX_REDIRECTS: usize = 10;

/// A streaming response body
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// A fully buffered response, used for feed documents
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub body: Bytes,
}

/// HTTP response with status, content length, and body stream
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Content-Length header value, if present
    pub content_length: Option<u64>,
    /// Response body as a stream of bytes
    pub body: ByteStream,
}

/// Returns true for 2xx status codes
pub fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// HTTP client abstraction for testability
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Fetch the entire response body as bytes
    async fn get_bytes(&self, url: &str) -> Result<BufferedResponse, TransportError>;

    /// Get a streaming response for large downloads
    async fn get_stream(&self, url: &str) -> Result<HttpResponse, TransportError>;
}

/// Settings for the production HTTP client
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub headers: BTreeMap<String, String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            headers: BTreeMap::new(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
        }
    }
}

/// Default HTTP client implementation using reqwest
#[derive(Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Create a new ReqwestClient with default settings
    pub fn new() -> Result<Self, ConfigError> {
        Self::with_settings(&HttpSettings::default())
    }

    /// Create a client sending the given headers and using the given timeouts
    pub fn with_settings(settings: &HttpSettings) -> Result<Self, ConfigError> {
        let headers = build_headers(&settings.headers)?;

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .connect_timeout(settings.connect_timeout)
            .read_timeout(settings.read_timeout)
            .build()?;

        Ok(Self { client })
    }

    /// Create a new ReqwestClient with a custom reqwest::Client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Build the default header map; a configured User-Agent replaces ours
pub(crate) fn build_headers(
    configured: &BTreeMap<String, String>,
) -> Result<HeaderMap, ConfigError> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));

    for (name, value) in configured {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| ConfigError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        let header_value = HeaderValue::from_str(value).map_err(|e| ConfigError::InvalidHeader {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        headers.insert(header_name, header_value);
    }

    Ok(headers)
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get_bytes(&self, url: &str) -> Result<BufferedResponse, TransportError> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;

        Ok(BufferedResponse { status, body })
    }

    async fn get_stream(&self, url: &str) -> Result<HttpResponse, TransportError> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let content_length = response.content_length();

        let body: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map(|result| result.map_err(TransportError::from)),
        );

        Ok(HttpResponse {
            status,
            content_length,
            body,
        })
    }
}
