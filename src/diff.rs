// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compare a feed's episodes against history to decide what to download.

use std::collections::HashSet;

use chrono::NaiveDate;

use crate::feed::Episode;

/// Plan for one feed, indicating what needs to be downloaded
#[derive(Debug, Clone, Default)]
pub struct FeedDiff {
    /// New episodes to download, in feed order
    pub pending: Vec<Episode>,
    /// Episodes already recorded in history
    pub already_known: Vec<Episode>,
    /// New episodes cut off by the limit
    pub over_limit: Vec<Episode>,
    /// Episodes outside the window, or passed over by an earlier first sync
    pub passed_over: Vec<Episode>,
    /// Distinct episodes in the feed
    pub total_episodes: usize,
}

impl FeedDiff {
    /// Unrecorded episodes still eligible for download
    pub fn new_episodes(&self) -> usize {
        self.pending.len() + self.over_limit.len()
    }
}

/// Bounds on which new episodes are taken
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Window {
    /// At most this many new episodes
    pub limit: Option<usize>,
    /// Only episodes published on or after this day; undated ones always pass
    pub published_since: Option<NaiveDate>,
}

impl Window {
    pub fn limit(limit: Option<usize>) -> Self {
        Self {
            limit,
            published_since: None,
        }
    }

    /// Tighten the limit to `limit` if that is smaller
    pub fn capped(self, limit: Option<usize>) -> Self {
        let limit = match (self.limit, limit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self { limit, ..self }
    }

    fn admits(&self, episode: &Episode) -> bool {
        match (self.published_since, episode.pub_date) {
            (Some(since), Some(published)) => published.date_naive() >= since,
            _ => true,
        }
    }
}

/// Split a feed's episodes into pending, known and over-limit
///
/// Feed order is kept as-is; the limit keeps the first `limit` new episodes,
/// which for a newest-first feed are the most recent ones. Only the episode
/// identifier decides whether an episode is known. Repeated identifiers
/// within one feed collapse to their first occurrence.
pub fn plan_feed(episodes: Vec<Episode>, known: &HashSet<String>, limit: Option<usize>) -> FeedDiff {
    plan_window(episodes, known, &HashSet::new(), Window::limit(limit))
}

/// Like [`plan_feed`], also setting aside passed-over episodes and new
/// episodes published before the window
///
/// The limit counts only episodes inside the window.
pub fn plan_window(
    episodes: Vec<Episode>,
    known: &HashSet<String>,
    passed_over: &HashSet<String>,
    window: Window,
) -> FeedDiff {
    let mut seen = HashSet::new();
    let mut diff = FeedDiff::default();

    for episode in episodes {
        if !seen.insert(episode.id.clone()) {
            tracing::debug!(episode_id = %episode.id, "duplicate episode id in feed");
            continue;
        }

        diff.total_episodes += 1;

        if known.contains(&episode.id) {
            diff.already_known.push(episode);
        } else if passed_over.contains(&episode.id) || !window.admits(&episode) {
            diff.passed_over.push(episode);
        } else if window.limit.is_some_and(|limit| diff.pending.len() >= limit) {
            diff.over_limit.push(episode);
        } else {
            diff.pending.push(episode);
        }
    }

    diff
}

/// Episodes to download, in feed order, at most `limit` of them
pub fn compute_pending(
    episodes: &[Episode],
    known: &HashSet<String>,
    limit: Option<usize>,
) -> Vec<Episode> {
    plan_feed(episodes.to_vec(), known, limit).pending
}

/// Keep episodes whose enclosure type is in `allowed`
///
/// An empty allow-list keeps everything, as do enclosures without a declared
/// type. Comparison ignores case and MIME parameters.
pub fn retain_media_types(episodes: Vec<Episode>, allowed: &[String]) -> Vec<Episode> {
    if allowed.is_empty() {
        return episodes;
    }

    episodes
        .into_iter()
        .filter(|episode| match episode.enclosure.mime_type.as_deref() {
            None => true,
            Some(mime) => {
                let essence = mime.split(';').next().unwrap_or("").trim();
                let keep = allowed.iter().any(|a| a.eq_ignore_ascii_case(essence));
                if !keep {
                    tracing::debug!(title = %episode.title, mime, "media type not allowed");
                }
                keep
            }
        })
        .collect()
}
