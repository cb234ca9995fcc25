// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Import subscriptions from an OPML export.

use std::collections::HashSet;
use std::path::Path;

use opml::{OPML, Outline};

use crate::config::PodcastConfig;
use crate::error::ConfigError;

/// Podcasts listed in an OPML document, in document order
///
/// Every outline with an `xmlUrl` counts, including outlines nested in
/// category folders. Outlines typed as something other than `rss` are
/// ignored. The name comes from `title`, else `text`. Repeated links are
/// listed once.
pub fn podcasts_from_opml(xml: &str) -> Result<Vec<PodcastConfig>, ConfigError> {
    let document = OPML::from_str(xml)?;

    let mut podcasts = Vec::new();
    let mut seen = HashSet::new();
    collect(&document.body.outlines, &mut seen, &mut podcasts);

    tracing::debug!(count = podcasts.len(), "podcasts found in OPML");
    Ok(podcasts)
}

/// Read an OPML file and list its podcasts
pub fn read_opml(path: &Path) -> Result<Vec<PodcastConfig>, ConfigError> {
    let xml = std::fs::read_to_string(path).map_err(|e| ConfigError::OpmlReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    podcasts_from_opml(&xml)
}

fn collect(outlines: &[Outline], seen: &mut HashSet<String>, podcasts: &mut Vec<PodcastConfig>) {
    for outline in outlines {
        let is_feed = outline
            .r#type
            .as_deref()
            .is_none_or(|kind| kind.eq_ignore_ascii_case("rss"));
        let link = outline
            .xml_url
            .as_deref()
            .map(str::trim)
            .filter(|link| !link.is_empty());

        if let Some(link) = link.filter(|_| is_feed)
            && seen.insert(link.to_string())
        {
            let name = outline.title.as_deref().unwrap_or(&outline.text).trim();
            podcasts.push(PodcastConfig {
                name: (!name.is_empty()).then(|| name.to_string()),
                ..PodcastConfig::new(link)
            });
        }

        collect(&outline.outlines, seen, podcasts);
    }
}
