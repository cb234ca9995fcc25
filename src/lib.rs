// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod config;
pub mod diff;
pub mod episode;
pub mod error;
pub mod feed;
pub mod history;
pub mod http;
pub mod opml;
pub mod policy;
pub mod progress;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export main types for convenience
pub use config::{Config, PodcastConfig};
pub use diff::{FeedDiff, Window, compute_pending, plan_feed, plan_window};
pub use episode::{DownloadedFile, FilenameTemplate, download_episode};
pub use error::{
    ConfigError, DownloadError, FeedError, HistoryError, IntegrityError, SyncError, TemplateError,
};
pub use feed::{Enclosure, Episode, Feed, FeedFormat, Podcast, parse_feed};
pub use history::{HistoryRecord, HistoryStore, JsonHistoryStore, MemoryHistoryStore};
pub use http::{HttpClient, HttpResponse, HttpSettings, ReqwestClient};
pub use opml::{podcasts_from_opml, read_opml};
pub use policy::{FirstSync, advance_last_run};
pub use progress::{NoopReporter, ProgressEvent, ProgressReporter, SharedProgressReporter};
pub use sync::{
    DownloadOutcome, FeedReport, FeedState, OutcomeResult, RunReport, SkipReason, SyncOptions,
    Syncer,
};
