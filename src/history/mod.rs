// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Download history: which episodes of which feeds are already on disk.

mod json;
mod memory;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::episode::DownloadedFile;
use crate::error::HistoryError;
use crate::feed::Episode;

pub use json::{HISTORY_VERSION, JsonHistoryStore};
pub use memory::MemoryHistoryStore;

/// One successfully downloaded episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub feed_id: String,
    pub episode_id: String,
    pub path: PathBuf,
    pub downloaded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enclosure_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl HistoryRecord {
    pub fn new(
        feed_id: impl Into<String>,
        episode_id: impl Into<String>,
        path: impl Into<PathBuf>,
        downloaded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            feed_id: feed_id.into(),
            episode_id: episode_id.into(),
            path: path.into(),
            downloaded_at,
            title: None,
            enclosure_url: None,
            bytes: None,
            content_hash: None,
        }
    }

    /// Record for a file the downloader has just moved into place
    pub fn for_download(
        feed_id: &str,
        episode: &Episode,
        file: &DownloadedFile,
        downloaded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            title: Some(episode.title.clone()),
            enclosure_url: Some(episode.enclosure.url.to_string()),
            bytes: Some(file.bytes),
            content_hash: Some(file.content_hash.clone()),
            ..Self::new(feed_id, episode.id.as_str(), file.path.clone(), downloaded_at)
        }
    }
}

/// Persistent record of downloaded episodes, partitioned by feed
///
/// Records are append-only. Implementations must make `record_download`
/// and `record_passed_over` all-or-nothing: after an error the store is
/// unchanged.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn has_record(&self, feed_id: &str, episode_id: &str) -> Result<bool, HistoryError>;

    /// Add a record. Returns `false` if one already existed for the same key.
    async fn record_download(&self, record: HistoryRecord) -> Result<bool, HistoryError>;

    /// Identifiers of every episode recorded for a feed
    async fn list_known_episodes(&self, feed_id: &str) -> Result<HashSet<String>, HistoryError>;

    /// Full records for a feed, ordered by episode identifier
    async fn records(&self, feed_id: &str) -> Result<Vec<HistoryRecord>, HistoryError>;

    /// Remember episodes a feed's first sync chose not to download
    ///
    /// Passed-over episodes have no file and no record; later runs leave
    /// them alone.
    async fn record_passed_over(
        &self,
        feed_id: &str,
        episode_ids: Vec<String>,
    ) -> Result<(), HistoryError>;

    /// Identifiers stored by `record_passed_over`
    async fn list_passed_over(&self, feed_id: &str) -> Result<HashSet<String>, HistoryError>;
}

/// In-memory index shared by the store implementations
///
/// Lookups go through hash maps; serialization sorts feeds and episodes so
/// the persisted document is stable across writes.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub(crate) struct HistoryIndex {
    #[serde(default, rename = "feeds")]
    records: HashMap<String, HashMap<String, HistoryRecord>>,
    #[serde(default)]
    passed_over: HashMap<String, HashSet<String>>,
}

#[derive(Serialize)]
struct SortedIndex<'a> {
    feeds: BTreeMap<&'a String, BTreeMap<&'a String, &'a HistoryRecord>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    passed_over: BTreeMap<&'a String, BTreeSet<&'a String>>,
}

impl Serialize for HistoryIndex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SortedIndex {
            feeds: self
                .records
                .iter()
                .map(|(feed_id, episodes)| (feed_id, episodes.iter().collect()))
                .collect(),
            passed_over: self
                .passed_over
                .iter()
                .map(|(feed_id, episodes)| (feed_id, episodes.iter().collect()))
                .collect(),
        }
        .serialize(serializer)
    }
}

impl HistoryIndex {
    pub(crate) fn contains(&self, feed_id: &str, episode_id: &str) -> bool {
        self.records
            .get(feed_id)
            .is_some_and(|episodes| episodes.contains_key(episode_id))
    }

    /// Insert unless present; returns whether the record was added
    pub(crate) fn insert(&mut self, record: HistoryRecord) -> bool {
        let episodes = self.records.entry(record.feed_id.clone()).or_default();
        if episodes.contains_key(&record.episode_id) {
            return false;
        }
        episodes.insert(record.episode_id.clone(), record);
        true
    }

    pub(crate) fn remove(&mut self, feed_id: &str, episode_id: &str) {
        if let Some(episodes) = self.records.get_mut(feed_id) {
            episodes.remove(episode_id);
            if episodes.is_empty() {
                self.records.remove(feed_id);
            }
        }
    }

    pub(crate) fn known(&self, feed_id: &str) -> HashSet<String> {
        self.records
            .get(feed_id)
            .map(|episodes| episodes.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn records(&self, feed_id: &str) -> Vec<HistoryRecord> {
        let mut records: Vec<HistoryRecord> = self
            .records
            .get(feed_id)
            .map(|episodes| episodes.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.episode_id.cmp(&b.episode_id));
        records
    }

    /// Mark episodes passed over; returns the identifiers that were new
    pub(crate) fn pass_over(&mut self, feed_id: &str, episode_ids: Vec<String>) -> Vec<String> {
        let passed = self.passed_over.entry(feed_id.to_string()).or_default();
        let added: Vec<String> = episode_ids
            .into_iter()
            .filter(|id| passed.insert(id.clone()))
            .collect();
        if passed.is_empty() {
            self.passed_over.remove(feed_id);
        }
        added
    }

    pub(crate) fn forget_passed_over(&mut self, feed_id: &str, episode_ids: &[String]) {
        if let Some(passed) = self.passed_over.get_mut(feed_id) {
            for id in episode_ids {
                passed.remove(id);
            }
            if passed.is_empty() {
                self.passed_over.remove(feed_id);
            }
        }
    }

    pub(crate) fn passed_over(&self, feed_id: &str) -> HashSet<String> {
        self.passed_over.get(feed_id).cloned().unwrap_or_default()
    }
}
