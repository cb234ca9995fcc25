// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use url::Url;

use crate::episode::FilenameTemplate;
use crate::error::FeedError;
use crate::policy::FirstSync;

use super::fetch::{file_path_to_url, is_url};
use super::identity::normalize_url;
use super::FeedFormat;

/// Directory name used when a feed name sanitizes to nothing
const FALLBACK_DIRECTORY: &str = "podcast";

/// A subscribed feed, as resolved from configuration
#[derive(Debug, Clone)]
pub struct Feed {
    /// Display name
    pub name: String,
    /// Feed URL, or path to a local feed file
    pub source: String,
    /// Download at most this many new episodes per run
    pub limit: Option<usize>,
    /// Download directory, overriding the shared root
    pub directory: Option<PathBuf>,
    pub file_name_template: Option<FilenameTemplate>,
    /// Dialect declared in configuration; sniffed when absent
    pub format: Option<FeedFormat>,
    /// Overrides the run-wide first sync policy
    pub first_sync: Option<FirstSync>,
    pub disabled: bool,
}

/// Where a feed document lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedLocation {
    Remote(Url),
    Local(PathBuf),
}

impl Feed {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            limit: None,
            directory: None,
            file_name_template: None,
            format: None,
            first_sync: None,
            disabled: false,
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn with_first_sync(mut self, first_sync: FirstSync) -> Self {
        self.first_sync = Some(first_sync);
        self
    }

    /// Resolve the source string into a remote URL or a local path
    pub fn location(&self) -> Result<FeedLocation, FeedError> {
        let source = self.source.trim();
        if is_url(source) {
            Ok(FeedLocation::Remote(Url::parse(source)?))
        } else {
            Ok(FeedLocation::Local(PathBuf::from(source)))
        }
    }

    /// Stable identifier used to partition download history.
    ///
    /// Derived from the source, not the display name, so renaming a feed in
    /// configuration keeps its history.
    pub fn id(&self) -> String {
        let url = match self.location() {
            Ok(FeedLocation::Remote(url)) => Some(url),
            Ok(FeedLocation::Local(path)) => file_path_to_url(&path).ok(),
            Err(_) => None,
        };

        url.map(|u| normalize_url(&u))
            .unwrap_or_else(|| self.source.trim().to_string())
    }

    /// Directory episodes of this feed are stored in
    pub fn directory_in(&self, root: &Path) -> PathBuf {
        if let Some(directory) = &self.directory {
            return directory.clone();
        }

        let name = sanitize_filename::sanitize(self.name.trim());
        let name = name.trim();
        if name.is_empty() {
            root.join(FALLBACK_DIRECTORY)
        } else {
            root.join(name)
        }
    }
}
