// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use atom_syndication::{Entry, Feed as AtomFeed};
use url::Url;

use crate::error::FeedError;

use super::model::clean_title;
use super::{Enclosure, Episode, FeedFormat, FeedParser, Podcast, collect_episodes};

const ENCLOSURE_REL: &str = "enclosure";

/// Parser for Atom feeds carrying `rel="enclosure"` links
#[derive(Debug, Default, Clone, Copy)]
pub struct AtomParser;

impl FeedParser for AtomParser {
    fn format(&self) -> FeedFormat {
        FeedFormat::Atom
    }

    fn parse(&self, bytes: &[u8], feed_url: Url) -> Result<Podcast, FeedError> {
        let feed = AtomFeed::read_from(bytes)?;

        let (episodes, skipped_items) =
            collect_episodes(&feed_url, feed.entries().iter().map(parse_entry))?;

        let link = feed
            .links()
            .iter()
            .find(|l| l.rel() == "alternate")
            .or_else(|| feed.links().first())
            .and_then(|l| Url::parse(l.href()).ok());

        let author = Some(
            feed.authors()
                .iter()
                .map(|person| person.name().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        )
        .filter(|a| !a.is_empty());

        Ok(Podcast {
            title: clean_title(Some(&feed.title().value)),
            description: feed.subtitle().map(|s| s.value.clone()).filter(|s| !s.is_empty()),
            link,
            author,
            image_url: feed
                .logo()
                .or_else(|| feed.icon())
                .and_then(|url| Url::parse(url).ok()),
            feed_url,
            format: FeedFormat::Atom,
            episodes,
            skipped_items,
        })
    }
}

fn parse_entry(entry: &Entry) -> Result<Episode, FeedError> {
    let title = clean_title(Some(&entry.title().value));

    let link = entry
        .links()
        .iter()
        .find(|l| l.rel() == ENCLOSURE_REL)
        .ok_or_else(|| FeedError::MissingEnclosure {
            title: title.clone(),
        })?;

    let url = Url::parse(link.href().trim()).map_err(|_| FeedError::InvalidEnclosure {
        title: title.clone(),
        url: link.href().to_string(),
    })?;

    // Atom ids are mandatory, but some generators emit empty ones
    let guid = Some(entry.id().to_string()).filter(|id| !id.trim().is_empty());
    let pub_date = entry.published().copied().or(Some(*entry.updated()));

    Ok(Episode::new(
        &title,
        guid,
        Enclosure {
            url,
            length: link.length().and_then(|l| l.trim().parse().ok()).filter(|l| *l > 0),
            mime_type: link.mime_type().map(String::from).filter(|m| !m.is_empty()),
        },
    )
    .with_pub_date(pub_date)
    .with_description(entry.summary().map(|s| s.value.clone())))
}
