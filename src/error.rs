// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use thiserror::Error;

/// Low-level failure while talking to a remote server
#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors that can occur when fetching or parsing feeds
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Failed to fetch feed from {url}: {source}")]
    FetchFailed {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("HTTP error {status} for feed {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Failed to read feed file {path}: {source}")]
    FileReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse RSS feed: {0}")]
    Rss(#[from] rss::Error),

    #[error("Failed to parse Atom feed: {0}")]
    Atom(#[from] atom_syndication::Error),

    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Episode '{title}' has no enclosure (media file)")]
    MissingEnclosure { title: String },

    #[error("Episode '{title}' has an invalid enclosure URL '{url}'")]
    InvalidEnclosure { title: String, url: String },

    #[error("Feed lists {skipped} item(s) but none has a usable enclosure")]
    NoEpisodes { skipped: usize },
}

/// A downloaded file that failed its completeness check
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("server sent an empty body")]
    EmptyBody,

    #[error("expected {expected} bytes but received {received}")]
    LengthMismatch { expected: u64, received: u64 },
}

/// Errors that can occur during episode downloads
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("HTTP request failed for {url}: {source}")]
    HttpFailed {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Failed to create directory {path}: {source}")]
    CreateDirectoryFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read directory {path}: {source}")]
    ReadDirectoryFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create file {path}: {source}")]
    FileCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to file {path}: {source}")]
    FileWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stream error while downloading {url}: {source}")]
    StreamFailed {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("Incomplete download of {url}: {source}")]
    Integrity {
        url: String,
        #[source]
        source: IntegrityError,
    },

    #[error("Failed to move {from} to {to}: {source}")]
    RenameFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by a history store
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Failed to read history file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write history file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("History file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("History file {path} has unsupported version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },

    #[error("Failed to serialize history: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("History store unavailable: {0}")]
    Unavailable(String),
}

/// Errors in a filename template
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Unterminated placeholder in template '{template}'")]
    Unterminated { template: String },

    #[error("Unknown placeholder '%{name}%'")]
    UnknownPlaceholder { name: String },

    #[error("Invalid date format '{format}'")]
    InvalidDateFormat { format: String },
}

/// Errors that can occur when loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("No podcasts configured")]
    NoFeeds,

    #[error("Podcast '{name}' has an empty rss_link")]
    EmptyLink { name: String },

    #[error("Podcast '{name}' has an invalid rss_link: {source}")]
    InvalidLink {
        name: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Invalid file name template: {0}")]
    Template(#[from] TemplateError),

    #[error("Invalid HTTP header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("'{key}' must be at least 1")]
    ZeroValue { key: &'static str },

    #[error("No download directory configured for podcast '{name}'")]
    MissingDirectory { name: String },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Unrecognized first sync policy '{value}'")]
    InvalidFirstSync { value: String },

    #[error("'download_since_last_run' requires 'last_run_mark_file_path'")]
    MissingLastRunMarker,

    #[error("Failed to update last run marker {path}: {source}")]
    LastRunMarker {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read OPML file {path}: {source}")]
    OpmlReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid OPML document: {0}")]
    Opml(#[from] opml::Error),

}

/// Errors attached to a failed sync outcome
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("History error: {0}")]
    History(#[from] HistoryError),

    #[error("Feed task failed: {0}")]
    TaskFailed(String),
}
