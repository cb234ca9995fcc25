// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, FixedOffset};
use url::Url;

use crate::episode::media_extension;

use super::FeedFormat;
use super::identity::episode_id;

/// Title used for items that do not carry one
const UNTITLED: &str = "Untitled Episode";

/// Represents a parsed podcast feed
#[derive(Debug, Clone)]
pub struct Podcast {
    pub title: String,
    pub description: Option<String>,
    pub link: Option<Url>,
    pub author: Option<String>,
    pub image_url: Option<Url>,
    pub feed_url: Url,
    pub format: FeedFormat,
    /// Episodes in the order the feed declares them
    pub episodes: Vec<Episode>,
    /// Items dropped because they had no usable enclosure
    pub skipped_items: usize,
}

/// Represents a single podcast episode
#[derive(Debug, Clone, PartialEq)]
pub struct Episode {
    /// Stable identity: the feed GUID, or the normalized enclosure URL
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub pub_date: Option<DateTime<FixedOffset>>,
    pub guid: Option<String>,
    pub enclosure: Enclosure,
    /// File extension hint, without the dot
    pub extension: String,
    pub duration: Option<String>,
    pub episode_number: Option<u32>,
    pub season_number: Option<u32>,
}

/// Represents the media file attached to an episode
#[derive(Debug, Clone, PartialEq)]
pub struct Enclosure {
    pub url: Url,
    pub length: Option<u64>,
    pub mime_type: Option<String>,
}

impl Episode {
    /// Create an episode, deriving its identifier and extension hint
    pub fn new(title: &str, guid: Option<String>, enclosure: Enclosure) -> Self {
        Self {
            id: episode_id(guid.as_deref(), &enclosure.url),
            title: clean_title(Some(title)),
            description: None,
            pub_date: None,
            extension: media_extension(&enclosure),
            guid,
            enclosure,
            duration: None,
            episode_number: None,
            season_number: None,
        }
    }

    pub fn with_pub_date(mut self, pub_date: Option<DateTime<FixedOffset>>) -> Self {
        self.pub_date = pub_date;
        self
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description.filter(|d| !d.trim().is_empty());
        self
    }
}

/// Decode HTML entities and trim a title, falling back to a placeholder
pub(crate) fn clean_title(raw: Option<&str>) -> String {
    raw.map(|t| html_escape::decode_html_entities(t).trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| UNTITLED.to_string())
}
