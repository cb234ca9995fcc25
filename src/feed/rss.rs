// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, FixedOffset};
use url::Url;

use crate::error::FeedError;

use super::model::clean_title;
use super::{Enclosure, Episode, FeedFormat, FeedParser, Podcast, collect_episodes};

/// Parser for RSS 2.0 feeds, including the iTunes podcast extension
#[derive(Debug, Default, Clone, Copy)]
pub struct RssParser;

impl FeedParser for RssParser {
    fn format(&self) -> FeedFormat {
        FeedFormat::Rss
    }

    fn parse(&self, bytes: &[u8], feed_url: Url) -> Result<Podcast, FeedError> {
        let channel = ::rss::Channel::read_from(bytes)?;

        let (episodes, skipped_items) =
            collect_episodes(&feed_url, channel.items().iter().map(parse_item))?;

        let image_url = channel
            .image()
            .and_then(|img| Url::parse(img.url()).ok())
            .or_else(|| {
                channel
                    .itunes_ext()
                    .and_then(|ext| ext.image())
                    .and_then(|url| Url::parse(url).ok())
            });

        let author = channel
            .itunes_ext()
            .and_then(|ext| ext.author().map(String::from))
            .or_else(|| channel.managing_editor().map(String::from));

        Ok(Podcast {
            title: clean_title(Some(channel.title())),
            description: Some(channel.description().to_string()).filter(|s| !s.is_empty()),
            link: Url::parse(channel.link()).ok(),
            author,
            image_url,
            feed_url,
            format: FeedFormat::Rss,
            episodes,
            skipped_items,
        })
    }
}

fn parse_item(item: &::rss::Item) -> Result<Episode, FeedError> {
    let title = clean_title(item.title());

    let enclosure = item
        .enclosure()
        .ok_or_else(|| FeedError::MissingEnclosure {
            title: title.clone(),
        })?;

    let enclosure_url =
        Url::parse(enclosure.url().trim()).map_err(|_| FeedError::InvalidEnclosure {
            title: title.clone(),
            url: enclosure.url().to_string(),
        })?;

    let pub_date = item.pub_date().and_then(parse_date);
    let guid = item.guid().map(|g| g.value().to_string());
    let itunes = item.itunes_ext();

    let mut episode = Episode::new(
        &title,
        guid,
        Enclosure {
            url: enclosure_url,
            length: enclosure.length().trim().parse().ok().filter(|len| *len > 0),
            mime_type: Some(enclosure.mime_type().trim().to_string()).filter(|s| !s.is_empty()),
        },
    )
    .with_pub_date(pub_date)
    .with_description(item.description().map(String::from));

    episode.duration = itunes.and_then(|ext| ext.duration().map(String::from));
    episode.episode_number = itunes.and_then(|ext| ext.episode().and_then(|e| e.parse().ok()));
    episode.season_number = itunes.and_then(|ext| ext.season().and_then(|s| s.parse().ok()));

    Ok(episode)
}

/// Parse an RSS date, tolerating common deviations from RFC 2822
fn parse_date(date_str: &str) -> Option<DateTime<FixedOffset>> {
    let date_str = date_str.trim();
    if let Ok(dt) = DateTime::parse_from_rfc2822(date_str) {
        return Some(dt);
    }

    let formats = [
        "%a, %d %b %Y %H:%M:%S %z",
        "%d %b %Y %H:%M:%S %z",
        "%Y-%m-%dT%H:%M:%S%:z",
        "%Y-%m-%d %H:%M:%S %z",
    ];

    formats
        .iter()
        .find_map(|format| DateTime::parse_from_str(date_str, format).ok())
        .or_else(|| DateTime::parse_from_rfc3339(date_str).ok())
}
