// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;

use bytes::Bytes;
use url::Url;

use crate::error::FeedError;
use crate::http::{HttpClient, is_success};

/// Fetch raw feed bytes from a URL (without parsing)
///
/// Redirects are followed by the client; any final status outside 2xx is a
/// fetch failure.
pub async fn fetch_feed_bytes<C: HttpClient + ?Sized>(
    client: &C,
    url: &str,
) -> Result<Bytes, FeedError> {
    let response = client
        .get_bytes(url)
        .await
        .map_err(|e| FeedError::FetchFailed {
            url: url.to_string(),
            source: e,
        })?;

    if !is_success(response.status) {
        return Err(FeedError::HttpStatus {
            url: url.to_string(),
            status: response.status,
        });
    }

    Ok(response.body)
}

/// Read raw feed bytes from a local file (without parsing)
pub async fn read_feed_file(path: &Path) -> Result<Bytes, FeedError> {
    tokio::fs::read(path)
        .await
        .map(Bytes::from)
        .map_err(|e| FeedError::FileReadFailed {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Construct a file:// URL for a local file path
pub fn file_path_to_url(path: &Path) -> Result<Url, FeedError> {
    let absolute = std::path::absolute(path).map_err(|e| FeedError::FileReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    Url::from_file_path(&absolute).map_err(|_| FeedError::FileReadFailed {
        path: path.to_path_buf(),
        source: std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path cannot be expressed as a file URL",
        ),
    })
}

/// Determine if a string is a URL or a file path
pub fn is_url(source: &str) -> bool {
    let source = source.trim_start();
    source.starts_with("http://") || source.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockHttpClient, MockResponse};

    #[test]
    fn is_url_detects_http() {
        assert!(is_url("http://example.com/feed.xml"));
        assert!(is_url("https://example.com/feed.xml"));
    }

    #[test]
    fn is_url_rejects_file_paths() {
        assert!(!is_url("/path/to/feed.xml"));
        assert!(!is_url("./feed.xml"));
        assert!(!is_url("feed.xml"));
    }

    #[test]
    fn file_path_to_url_makes_relative_paths_absolute() {
        let url = file_path_to_url(Path::new("feed.xml")).unwrap();
        assert_eq!(url.scheme(), "file");
        assert!(url.path().ends_with("/feed.xml"));
    }

    #[tokio::test]
    async fn fetch_returns_body_on_success() {
        let client = MockHttpClient::new().with_body("https://example.com/feed.xml", "<rss/>");

        let bytes = fetch_feed_bytes(&client, "https://example.com/feed.xml")
            .await
            .unwrap();

        assert_eq!(&bytes[..], b"<rss/>");
    }

    #[tokio::test]
    async fn fetch_treats_non_2xx_as_failure() {
        let client = MockHttpClient::new().with(
            "https://example.com/feed.xml",
            MockResponse::status(503),
        );

        let result = fetch_feed_bytes(&client, "https://example.com/feed.xml").await;

        assert!(matches!(
            result,
            Err(FeedError::HttpStatus { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn fetch_reports_transport_errors() {
        let client = MockHttpClient::new().with(
            "https://example.com/feed.xml",
            MockResponse::NetworkError,
        );

        let result = fetch_feed_bytes(&client, "https://example.com/feed.xml").await;

        assert!(matches!(result, Err(FeedError::FetchFailed { .. })));
    }

    #[tokio::test]
    async fn read_feed_file_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_feed_file(&dir.path().join("missing.xml")).await;
        assert!(matches!(result, Err(FeedError::FileReadFailed { .. })));
    }
}
