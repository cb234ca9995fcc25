// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{HistoryIndex, HistoryRecord, HistoryStore};
use crate::episode::{partial_path, sync_directory};
use crate::error::HistoryError;

/// Layout version written to the history document
pub const HISTORY_VERSION: u32 = 1;

#[derive(Deserialize)]
struct VersionHeader {
    version: u32,
}

#[derive(Deserialize)]
struct StoredDocument {
    #[serde(flatten)]
    index: HistoryIndex,
}

#[derive(Serialize)]
struct DocumentRef<'a> {
    version: u32,
    #[serde(flatten)]
    index: &'a HistoryIndex,
}

/// History kept in a single JSON document
///
/// The whole document is rewritten on every new record: serialized to a
/// `.partial` sibling, synced, then renamed over the live file. A crash
/// therefore leaves either the old or the new document, never a torn one.
/// One mutex guards both the index and the file.
#[derive(Debug)]
pub struct JsonHistoryStore {
    path: PathBuf,
    index: Mutex<HistoryIndex>,
}

impl JsonHistoryStore {
    /// Load the history at `path`; a missing file is an empty history
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let path = path.into();

        // Left over from a write that never reached its rename
        let stale = partial_path(&path);
        if tokio::fs::remove_file(&stale).await.is_ok() {
            tracing::warn!(path = %stale.display(), "removed unfinished history write");
        }

        let index = match tokio::fs::read(&path).await {
            Ok(content) => parse_document(&path, &content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HistoryIndex::default(),
            Err(e) => return Err(HistoryError::ReadFailed { path, source: e }),
        };

        tracing::debug!(path = %path.display(), "history loaded");

        Ok(Self {
            path,
            index: Mutex::new(index),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, index: &HistoryIndex) -> Result<(), HistoryError> {
        let json = serde_json::to_vec_pretty(&DocumentRef {
            version: HISTORY_VERSION,
            index,
        })?;

        let write_error = |e: std::io::Error| HistoryError::WriteFailed {
            path: self.path.clone(),
            source: e,
        };

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(write_error)?;

        let temp_path = partial_path(&self.path);
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(write_error)?;
        file.write_all(&json).await.map_err(write_error)?;
        file.sync_all().await.map_err(write_error)?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(write_error(e));
        }

        // The new document is already visible; only its durability is in doubt
        if let Err(e) = sync_directory(parent).await {
            tracing::warn!(path = %parent.display(), error = %e, "could not sync history directory");
        }

        Ok(())
    }
}

fn parse_document(path: &Path, content: &[u8]) -> Result<HistoryIndex, HistoryError> {
    let corrupt = |e: serde_json::Error| HistoryError::Corrupt {
        path: path.to_path_buf(),
        source: e,
    };

    let header: VersionHeader = serde_json::from_slice(content).map_err(corrupt)?;
    if header.version != HISTORY_VERSION {
        return Err(HistoryError::UnsupportedVersion {
            path: path.to_path_buf(),
            version: header.version,
        });
    }

    let document: StoredDocument = serde_json::from_slice(content).map_err(corrupt)?;
    Ok(document.index)
}

#[async_trait]
impl HistoryStore for JsonHistoryStore {
    async fn has_record(&self, feed_id: &str, episode_id: &str) -> Result<bool, HistoryError> {
        Ok(self.index.lock().await.contains(feed_id, episode_id))
    }

    async fn record_download(&self, record: HistoryRecord) -> Result<bool, HistoryError> {
        let mut index = self.index.lock().await;

        let feed_id = record.feed_id.clone();
        let episode_id = record.episode_id.clone();
        if !index.insert(record) {
            return Ok(false);
        }

        if let Err(e) = self.persist(&index).await {
            index.remove(&feed_id, &episode_id);
            return Err(e);
        }

        tracing::debug!(%feed_id, %episode_id, "history record written");
        Ok(true)
    }

    async fn list_known_episodes(&self, feed_id: &str) -> Result<HashSet<String>, HistoryError> {
        Ok(self.index.lock().await.known(feed_id))
    }

    async fn records(&self, feed_id: &str) -> Result<Vec<HistoryRecord>, HistoryError> {
        Ok(self.index.lock().await.records(feed_id))
    }

    async fn record_passed_over(
        &self,
        feed_id: &str,
        episode_ids: Vec<String>,
    ) -> Result<(), HistoryError> {
        let mut index = self.index.lock().await;

        let added = index.pass_over(feed_id, episode_ids);
        if added.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.persist(&index).await {
            index.forget_passed_over(feed_id, &added);
            return Err(e);
        }

        tracing::debug!(%feed_id, count = added.len(), "passed-over episodes written");
        Ok(())
    }

    async fn list_passed_over(&self, feed_id: &str) -> Result<HashSet<String>, HistoryError> {
        Ok(self.index.lock().await.passed_over(feed_id))
    }
}
