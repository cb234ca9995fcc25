// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared fixtures for unit tests: a routable mock HTTP client and feed builders.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use url::Url;

use crate::error::TransportError;
use crate::feed::{Enclosure, Episode};
use crate::http::{BufferedResponse, ByteStream, HttpClient, HttpResponse};

/// Canned response for one URL
#[derive(Debug, Clone)]
pub enum MockResponse {
    Ok {
        status: u16,
        body: Vec<u8>,
        content_length: Option<u64>,
    },
    /// Connection fails before any response arrives
    NetworkError,
    /// Headers arrive, then the connection drops after the first chunk
    BrokenStream {
        first_chunk: Vec<u8>,
        content_length: Option<u64>,
    },
    /// Body arrives in two halves with a pause in between
    Slow { body: Vec<u8>, pause: Duration },
}

impl MockResponse {
    pub fn status(status: u16) -> Self {
        Self::Ok {
            status,
            body: Vec::new(),
            content_length: Some(0),
        }
    }

    pub fn body(body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        Self::Ok {
            status: 200,
            content_length: Some(body.len() as u64),
            body,
        }
    }
}

fn connection_reset() -> TransportError {
    TransportError::Io(io::Error::new(
        io::ErrorKind::ConnectionReset,
        "connection reset by peer",
    ))
}

/// HTTP client answering from a route table; unknown URLs get a 404
#[derive(Clone, Default)]
pub struct MockHttpClient {
    routes: Arc<Mutex<HashMap<String, MockResponse>>>,
    requests: Arc<AtomicUsize>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, url: &str, response: MockResponse) -> Self {
        self.set(url, response);
        self
    }

    pub fn with_body(self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.with(url, MockResponse::body(body))
    }

    /// Replace the response for a URL between runs
    pub fn set(&self, url: &str, response: MockResponse) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), response);
    }

    /// Number of requests served so far
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn lookup(&self, url: &str) -> MockResponse {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.routes
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(|| MockResponse::status(404))
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn get_bytes(&self, url: &str) -> Result<BufferedResponse, TransportError> {
        match self.lookup(url) {
            MockResponse::Ok { status, body, .. } => Ok(BufferedResponse {
                status,
                body: Bytes::from(body),
            }),
            MockResponse::Slow { body, .. } => Ok(BufferedResponse {
                status: 200,
                body: Bytes::from(body),
            }),
            MockResponse::NetworkError | MockResponse::BrokenStream { .. } => {
                Err(connection_reset())
            }
        }
    }

    async fn get_stream(&self, url: &str) -> Result<HttpResponse, TransportError> {
        match self.lookup(url) {
            MockResponse::Ok {
                status,
                body,
                content_length,
            } => {
                let body: ByteStream =
                    Box::pin(futures::stream::once(async move { Ok(Bytes::from(body)) }));
                Ok(HttpResponse {
                    status,
                    content_length,
                    body,
                })
            }
            MockResponse::NetworkError => Err(connection_reset()),
            MockResponse::BrokenStream {
                first_chunk,
                content_length,
            } => {
                let chunks = vec![Ok(Bytes::from(first_chunk)), Err(connection_reset())];
                let body: ByteStream = Box::pin(futures::stream::iter(chunks));
                Ok(HttpResponse {
                    status: 200,
                    content_length,
                    body,
                })
            }
            MockResponse::Slow { body, pause } => {
                let content_length = Some(body.len() as u64);
                let mut head = Bytes::from(body);
                let tail = head.split_off(head.len() / 2);
                let body: ByteStream = Box::pin(
                    futures::stream::once(async move { Ok::<_, TransportError>(head) }).chain(futures::stream::once(
                        async move {
                            tokio::time::sleep(pause).await;
                            Ok(tail)
                        },
                    )),
                );
                Ok(HttpResponse {
                    status: 200,
                    content_length,
                    body,
                })
            }
        }
    }
}

/// Build an episode with an mp3 enclosure
pub fn episode(title: &str, guid: Option<&str>, url: &str) -> Episode {
    Episode::new(
        title,
        guid.map(String::from),
        Enclosure {
            url: Url::parse(url).unwrap(),
            length: None,
            mime_type: Some("audio/mpeg".to_string()),
        },
    )
}

/// Build an RSS 2.0 document from `(title, guid, enclosure_url)` triples
pub fn rss_feed(title: &str, items: &[(&str, &str, &str)]) -> String {
    let items: String = items
        .iter()
        .map(|(item_title, guid, url)| {
            format!(
                "    <item>\n      <title>{item_title}</title>\n      <guid>{guid}</guid>\n      \
                 <enclosure url=\"{url}\" type=\"audio/mpeg\"/>\n    </item>\n"
            )
        })
        .collect();

    format!(
        "<?xml version=\"1.0\"?>\n<rss version=\"2.0\">\n  <channel>\n    <title>{title}</title>\n{items}  </channel>\n</rss>"
    )
}

/// Like [`rss_feed`], with each item published `days_ago` days before now
pub fn dated_rss_feed(title: &str, items: &[(&str, &str, &str, i64)]) -> String {
    let items: String = items
        .iter()
        .map(|(item_title, guid, url, days_ago)| {
            let published = (Utc::now() - chrono::Duration::days(*days_ago)).to_rfc2822();
            format!(
                "    <item>\n      <title>{item_title}</title>\n      <guid>{guid}</guid>\n      \
                 <pubDate>{published}</pubDate>\n      \
                 <enclosure url=\"{url}\" type=\"audio/mpeg\"/>\n    </item>\n"
            )
        })
        .collect();

    format!(
        "<?xml version=\"1.0\"?>\n<rss version=\"2.0\">\n  <channel>\n    <title>{title}</title>\n{items}  </channel>\n</rss>"
    )
}
