// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! JSON configuration file: subscribed podcasts and run-wide settings.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::episode::{DEFAULT_TEMPLATE, FilenameTemplate};
use crate::error::ConfigError;
use crate::feed::{Feed, FeedFormat, is_url};
use crate::http::{HttpSettings, build_headers};
use crate::policy::FirstSync;
use crate::sync::SyncOptions;

const APP_DIR: &str = "podsync";

/// One subscribed podcast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodcastConfig {
    /// Display name; defaults to the link
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Feed URL or local feed file
    pub rss_link: String,
    /// Download directory for this podcast
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// New episodes per run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name_template: Option<String>,
    /// Skip sniffing and parse as this dialect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_type: Option<FeedFormat>,
    /// Overrides the run-wide first sync policy
    #[serde(
        default,
        alias = "if_directory_empty",
        skip_serializing_if = "Option::is_none"
    )]
    pub first_sync: Option<String>,
}

impl PodcastConfig {
    pub fn new(rss_link: impl Into<String>) -> Self {
        Self {
            name: None,
            rss_link: rss_link.into(),
            path: None,
            limit: None,
            disable: false,
            file_name_template: None,
            feed_type: None,
            first_sync: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.rss_link.trim())
    }
}

/// Top-level configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub podcasts: Vec<PodcastConfig>,
    /// Root for podcasts without their own `path`
    pub download_dir: Option<PathBuf>,
    /// Total downloads per run across all podcasts
    pub downloads_limit: Option<usize>,
    /// Seconds to wait between downloads
    pub download_delay: u64,
    pub http_headers: BTreeMap<String, String>,
    /// Extension to MIME type; the MIME types form the enclosure allow-list
    pub podcast_extensions: BTreeMap<String, String>,
    pub file_name_template: String,
    pub history_file: Option<PathBuf>,
    pub max_concurrent_feeds: usize,
    pub max_attempts: u32,
    /// Read timeout for HTTP requests, in seconds
    pub timeout_secs: u64,
    /// What to take from a feed with no history yet
    #[serde(alias = "if_directory_empty")]
    pub first_sync: String,
    /// File remembering when the previous run started
    pub last_run_mark_file_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            podcasts: Vec::new(),
            download_dir: None,
            downloads_limit: None,
            download_delay: 0,
            http_headers: BTreeMap::new(),
            podcast_extensions: BTreeMap::new(),
            file_name_template: DEFAULT_TEMPLATE.to_string(),
            history_file: None,
            max_concurrent_feeds: 3,
            max_attempts: 1,
            timeout_secs: 60,
            first_sync: FirstSync::default().to_string(),
            last_run_mark_file_path: None,
        }
    }
}

impl Config {
    /// Read and parse a configuration file (without validating it)
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_json::from_str(&content).map_err(|e| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Configuration for a single ad-hoc feed
    pub fn for_feed(source: &str, directory: PathBuf) -> Self {
        Self {
            podcasts: vec![PodcastConfig {
                path: Some(directory),
                ..PodcastConfig::new(source)
            }],
            ..Default::default()
        }
    }

    /// `<config dir>/podsync/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.json"))
    }

    /// Configured history file, else `<data dir>/podsync/history.json`
    pub fn history_path(&self) -> Option<PathBuf> {
        match &self.history_file {
            Some(path) => Some(expand_home(path)),
            None => dirs::data_dir().map(|dir| dir.join(APP_DIR).join("history.json")),
        }
    }

    /// Expanded path of the last run marker, if one is configured
    pub fn last_run_marker(&self) -> Option<PathBuf> {
        self.last_run_mark_file_path.as_deref().map(expand_home)
    }

    /// Append podcasts whose link is not configured yet; returns how many were added
    pub fn merge_podcasts(&mut self, podcasts: Vec<PodcastConfig>) -> usize {
        let mut added = 0;
        for podcast in podcasts {
            let link = podcast.rss_link.trim();
            if self.podcasts.iter().any(|p| p.rss_link.trim() == link) {
                tracing::debug!(link, "podcast already configured");
                continue;
            }
            self.podcasts.push(podcast);
            added += 1;
        }
        added
    }

    /// Check everything that would otherwise fail halfway through a run
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.podcasts.is_empty() {
            return Err(ConfigError::NoFeeds);
        }
        if self.max_concurrent_feeds == 0 {
            return Err(ConfigError::ZeroValue {
                key: "max_concurrent_feeds",
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroValue { key: "max_attempts" });
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::ZeroValue { key: "timeout_secs" });
        }

        build_headers(&self.http_headers)?;
        let feeds = self.feeds()?;
        let options = self.sync_options()?;

        let needs_last_run = feeds
            .iter()
            .filter(|feed| !feed.disabled)
            .any(|feed| feed.first_sync.unwrap_or(options.first_sync).needs_last_run());
        if needs_last_run && self.last_run_mark_file_path.is_none() {
            return Err(ConfigError::MissingLastRunMarker);
        }

        Ok(())
    }

    /// Resolve the configured podcasts into feeds, in configuration order
    pub fn feeds(&self) -> Result<Vec<Feed>, ConfigError> {
        self.podcasts.iter().map(|p| self.feed(p)).collect()
    }

    fn feed(&self, podcast: &PodcastConfig) -> Result<Feed, ConfigError> {
        let name = podcast.display_name().to_string();
        let link = podcast.rss_link.trim();

        if link.is_empty() {
            return Err(ConfigError::EmptyLink { name });
        }
        if is_url(link) {
            Url::parse(link).map_err(|e| ConfigError::InvalidLink {
                name: name.clone(),
                source: e,
            })?;
        }

        let directory = match (&podcast.path, &self.download_dir) {
            (Some(path), _) => Some(expand_home(path)),
            (None, Some(_)) => None,
            (None, None) => return Err(ConfigError::MissingDirectory { name }),
        };

        let file_name_template = podcast
            .file_name_template
            .as_deref()
            .map(FilenameTemplate::parse)
            .transpose()?;
        let first_sync = podcast
            .first_sync
            .as_deref()
            .map(str::parse::<FirstSync>)
            .transpose()?;

        Ok(Feed {
            name,
            source: link.to_string(),
            limit: podcast.limit,
            directory,
            file_name_template,
            format: podcast.feed_type,
            first_sync,
            disabled: podcast.disable,
        })
    }

    pub fn sync_options(&self) -> Result<SyncOptions, ConfigError> {
        let media_types: BTreeSet<String> = self
            .podcast_extensions
            .values()
            .map(|mime| mime.trim().to_lowercase())
            .filter(|mime| !mime.is_empty())
            .collect();

        Ok(SyncOptions {
            download_dir: self
                .download_dir
                .as_deref()
                .map(expand_home)
                .unwrap_or_else(|| PathBuf::from(".")),
            file_name_template: FilenameTemplate::parse(&self.file_name_template)?,
            downloads_limit: self.downloads_limit,
            max_concurrent_feeds: self.max_concurrent_feeds,
            download_delay: Duration::from_secs(self.download_delay),
            max_attempts: self.max_attempts,
            media_types: media_types.into_iter().collect(),
            first_sync: self.first_sync.parse()?,
            last_run: None,
            dry_run: false,
            report_skipped: false,
        })
    }

    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            headers: self.http_headers.clone(),
            read_timeout: Duration::from_secs(self.timeout_secs),
            ..Default::default()
        }
    }
}

/// Replace a leading `~` with the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
