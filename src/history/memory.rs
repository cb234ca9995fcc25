// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{HistoryIndex, HistoryRecord, HistoryStore};
use crate::error::HistoryError;

/// Volatile history, for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    index: Mutex<HistoryIndex>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn has_record(&self, feed_id: &str, episode_id: &str) -> Result<bool, HistoryError> {
        Ok(self.index.lock().await.contains(feed_id, episode_id))
    }

    async fn record_download(&self, record: HistoryRecord) -> Result<bool, HistoryError> {
        Ok(self.index.lock().await.insert(record))
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
        self.index.lock().await.pass_over(feed_id, episode_ids);
        Ok(())
    }

    async fn list_passed_over(&self, feed_id: &str) -> Result<HashSet<String>, HistoryError> {
        Ok(self.index.lock().await.passed_over(feed_id))
    }
}
