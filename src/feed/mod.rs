// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Feed retrieval and parsing.
//!
//! Feeds come in more than one dialect. Every dialect implements
//! [`FeedParser`] and produces the same [`Podcast`]/[`Episode`] model, so the
//! rest of the engine never needs to know which one it was.

mod atom;
mod fetch;
mod identity;
mod model;
mod rss;
mod subscription;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::FeedError;

pub use self::atom::AtomParser;
pub use self::rss::RssParser;
pub use fetch::{fetch_feed_bytes, file_path_to_url, is_url, read_feed_file};
pub use identity::{episode_id, normalize_url};
pub use model::{Enclosure, Episode, Podcast};
pub use subscription::{Feed, FeedLocation};

/// Number of leading bytes inspected when guessing a feed's dialect
const SNIFF_WINDOW: usize = 4096;

/// The feed dialects understood by podsync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    Rss,
    Atom,
}

impl FeedFormat {
    /// Guess the dialect from the document's root element
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        let head = String::from_utf8_lossy(&bytes[..bytes.len().min(SNIFF_WINDOW)]);
        let mut rest = head.trim_start_matches('\u{feff}');

        loop {
            let start = rest.find('<')?;
            rest = &rest[start + 1..];

            if let Some(comment) = rest.strip_prefix("!--") {
                let end = comment.find("-->")?;
                rest = &comment[end + 3..];
                continue;
            }
            // XML declaration, processing instructions, DOCTYPE
            if rest.starts_with('?') || rest.starts_with('!') {
                continue;
            }

            let name: String = rest
                .chars()
                .take_while(|c| !c.is_whitespace() && *c != '>' && *c != '/')
                .collect();
            let local = name.rsplit(':').next().unwrap_or(name.as_str());

            return match local {
                "rss" | "RDF" => Some(Self::Rss),
                "feed" => Some(Self::Atom),
                _ => None,
            };
        }
    }

    /// The parser implementation for this dialect
    pub fn parser(self) -> &'static dyn FeedParser {
        match self {
            Self::Rss => &RssParser,
            Self::Atom => &AtomParser,
        }
    }
}

/// A feed dialect capable of producing the episode model
pub trait FeedParser: Send + Sync {
    /// The dialect this parser handles
    fn format(&self) -> FeedFormat;

    /// Parse a raw document into a podcast with episodes in feed order
    fn parse(&self, bytes: &[u8], feed_url: Url) -> Result<Podcast, FeedError>;
}

/// Parse a feed document, using `declared` when set and sniffing otherwise.
///
/// Documents whose root element is not recognised are handed to the RSS
/// parser, which produces the most useful error message for garbage input.
pub fn parse_feed(
    bytes: &[u8],
    feed_url: Url,
    declared: Option<FeedFormat>,
) -> Result<Podcast, FeedError> {
    let format = declared
        .or_else(|| FeedFormat::sniff(bytes))
        .unwrap_or(FeedFormat::Rss);

    tracing::debug!(%feed_url, ?format, "parsing feed document");
    format.parser().parse(bytes, feed_url)
}

/// Collect per-item parse results, skipping broken items.
///
/// Returns the recovered episodes and the number of skipped items. Fails only
/// when the feed had items and none of them could be recovered.
pub(crate) fn collect_episodes(
    feed_url: &Url,
    items: impl IntoIterator<Item = Result<Episode, FeedError>>,
) -> Result<(Vec<Episode>, usize), FeedError> {
    let mut episodes = Vec::new();
    let mut skipped = 0;

    for item in items {
        match item {
            Ok(episode) => episodes.push(episode),
            Err(e) => {
                tracing::warn!(%feed_url, error = %e, "skipping feed item");
                skipped += 1;
            }
        }
    }

    if episodes.is_empty() && skipped > 0 {
        return Err(FeedError::NoEpisodes { skipped });
    }

    Ok((episodes, skipped))
}
