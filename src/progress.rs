// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

/// Events emitted during podcast synchronization for progress reporting
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Feed is being fetched from its source
    FetchingFeed {
        /// Identifies the feed slot (0 to max_concurrent_feeds-1)
        slot: usize,
        feed_name: String,
        url: String,
    },

    /// Feed has been parsed and diffed against history
    FeedParsed {
        slot: usize,
        feed_name: String,
        total_episodes: usize,
        /// Episodes not yet in history
        new_episodes: usize,
        /// New episodes left after the per-feed limit
        to_download: usize,
    },

    /// Feed could not be fetched, parsed or diffed
    FeedFailed {
        slot: usize,
        feed_name: String,
        error: String,
    },

    /// Partial files were cleaned up before downloading
    PartialFilesCleanedUp { feed_name: String, count: usize },

    /// A download is starting
    DownloadStarting {
        slot: usize,
        episode_title: String,
        /// Index of this episode in the download queue
        episode_index: usize,
        /// Total number of episodes to download
        total_to_download: usize,
        /// Expected content length in bytes, if known
        content_length: Option<u64>,
    },

    /// Download progress update
    DownloadProgress {
        slot: usize,
        episode_title: String,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    },

    /// Download is being finalized (renamed from .partial)
    Finalizing { slot: usize, episode_title: String },

    /// A download completed successfully
    DownloadCompleted {
        slot: usize,
        episode_title: String,
        bytes_downloaded: u64,
    },

    /// A download failed
    DownloadFailed {
        slot: usize,
        episode_title: String,
        error: String,
    },

    /// All work for a feed is done
    FeedCompleted {
        slot: usize,
        feed_name: String,
        downloaded: usize,
        skipped: usize,
        failed: usize,
    },

    /// Sync operation completed
    SyncCompleted {
        downloaded_count: usize,
        skipped_count: usize,
        failed_count: usize,
    },
}

/// Trait for reporting progress events during synchronization.
///
/// Implementations can use this to display progress bars, log messages,
/// or collect statistics.
pub trait ProgressReporter: Send + Sync {
    /// Report a progress event
    fn report(&self, event: ProgressEvent);
}

/// A shared reference to a progress reporter
pub type SharedProgressReporter = Arc<dyn ProgressReporter>;

/// A no-op progress reporter that silently ignores all events.
/// Useful for tests or quiet mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: ProgressEvent) {
        // Intentionally empty
    }
}

impl NoopReporter {
    /// Create a new NoopReporter wrapped in an Arc
    pub fn shared() -> SharedProgressReporter {
        Arc::new(Self)
    }
}
