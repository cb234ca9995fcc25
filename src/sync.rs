// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tokio::sync::mpsc;

use crate::diff::{FeedDiff, Window, plan_window, retain_media_types};
use crate::episode::{
    DownloadContext, DownloadedFile, FilenameTemplate, clean_partial_files, disambiguate,
    download_episode, prepare_directory,
};
use crate::error::{DownloadError, SyncError};
use crate::feed::{
    Episode, Feed, FeedLocation, Podcast, fetch_feed_bytes, file_path_to_url, parse_feed,
    read_feed_file,
};
use crate::history::{HistoryRecord, HistoryStore};
use crate::http::HttpClient;
use crate::policy::FirstSync;
use crate::progress::{ProgressEvent, SharedProgressReporter};

/// Options for podcast synchronization
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Root directory; each feed gets a subdirectory unless it overrides it
    pub download_dir: PathBuf,
    /// Naming for feeds without their own template
    pub file_name_template: FilenameTemplate,
    /// Maximum number of episodes downloaded across all feeds (None = all)
    pub downloads_limit: Option<usize>,
    /// Maximum number of feeds synced at once
    pub max_concurrent_feeds: usize,
    /// Pause between consecutive downloads of one feed
    pub download_delay: Duration,
    /// Attempts per episode within a run
    pub max_attempts: u32,
    /// Allowed enclosure MIME types (empty = all)
    pub media_types: Vec<String>,
    /// Plan only; nothing is downloaded or recorded
    pub dry_run: bool,
    /// Include already-downloaded, over-limit and passed-over episodes in reports
    pub report_skipped: bool,
    /// What a feed's first sync takes, unless the feed sets its own policy
    pub first_sync: FirstSync,
    /// When the previous run started, for `FirstSync::SinceLastRun`
    pub last_run: Option<DateTime<Utc>>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            file_name_template: FilenameTemplate::default(),
            downloads_limit: None,
            max_concurrent_feeds: 3,
            download_delay: Duration::ZERO,
            max_attempts: 1,
            media_types: Vec::new(),
            dry_run: false,
            report_skipped: false,
            first_sync: FirstSync::default(),
            last_run: None,
        }
    }
}

/// Run-wide cap on the number of downloads, shared by all feeds
#[derive(Debug)]
pub struct DownloadBudget {
    remaining: Option<AtomicUsize>,
}

impl DownloadBudget {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            remaining: limit.map(AtomicUsize::new),
        }
    }

    /// Claim one download; false once the budget is spent
    pub fn try_take(&self) -> bool {
        match &self.remaining {
            None => true,
            Some(remaining) => remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok(),
        }
    }

    /// Return a claim whose download failed
    pub fn refund(&self) {
        if let Some(remaining) = &self.remaining {
            remaining.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Per-feed, per-run progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    NotStarted,
    Fetching,
    /// Fetching or parsing the feed document failed
    FetchFailed,
    Parsed,
    Diffed,
    /// Working on the pending episode at `index`
    Downloading { index: usize },
    Completed,
    /// History could not be read or written; the rest of the feed was skipped
    Aborted,
}

/// Why an episode (or feed) was not downloaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyDownloaded,
    OverLimit,
    /// Left out by the feed's first sync
    PassedOver,
    DownloadBudgetExhausted,
    DryRun,
    Disabled,
    FeedAborted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::AlreadyDownloaded => "already downloaded",
            SkipReason::OverLimit => "over feed limit",
            SkipReason::PassedOver => "passed over on first sync",
            SkipReason::DownloadBudgetExhausted => "download limit reached",
            SkipReason::DryRun => "dry run",
            SkipReason::Disabled => "feed disabled",
            SkipReason::FeedAborted => "feed aborted",
        };
        f.write_str(text)
    }
}

#[derive(Debug)]
pub enum OutcomeResult {
    Downloaded { path: PathBuf, bytes: u64 },
    Skipped(SkipReason),
    Failed(SyncError),
}

/// What happened to one episode, or to the feed as a whole when `episode` is None
#[derive(Debug)]
pub struct DownloadOutcome {
    pub episode: Option<Episode>,
    pub result: OutcomeResult,
}

impl DownloadOutcome {
    pub fn is_downloaded(&self) -> bool {
        matches!(self.result, OutcomeResult::Downloaded { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.result, OutcomeResult::Skipped(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.result, OutcomeResult::Failed(_))
    }
}

/// Result of syncing one feed
#[derive(Debug)]
pub struct FeedReport {
    pub feed_name: String,
    pub feed_id: String,
    pub state: FeedState,
    pub outcomes: Vec<DownloadOutcome>,
}

impl FeedReport {
    pub fn downloaded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_downloaded()).count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_skipped()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failed()).count()
    }

    /// The error that stopped the feed before any episode was attempted
    pub fn feed_error(&self) -> Option<&SyncError> {
        self.outcomes.iter().find_map(|o| match (&o.episode, &o.result) {
            (None, OutcomeResult::Failed(e)) => Some(e),
            _ => None,
        })
    }
}

/// Result of syncing every configured feed, in configuration order
#[derive(Debug, Default)]
pub struct RunReport {
    pub feeds: Vec<FeedReport>,
}

impl RunReport {
    pub fn downloaded(&self) -> usize {
        self.feeds.iter().map(FeedReport::downloaded).sum()
    }

    pub fn skipped(&self) -> usize {
        self.feeds.iter().map(FeedReport::skipped).sum()
    }

    pub fn failed(&self) -> usize {
        self.feeds.iter().map(FeedReport::failed).sum()
    }

    /// Drives the process exit status
    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }
}

/// Tracks state and outcomes while one feed is processed
struct FeedRun {
    feed_name: String,
    feed_id: String,
    state: FeedState,
    outcomes: Vec<DownloadOutcome>,
}

impl FeedRun {
    fn new(feed: &Feed) -> Self {
        Self {
            feed_name: feed.name.clone(),
            feed_id: feed.id(),
            state: FeedState::NotStarted,
            outcomes: Vec::new(),
        }
    }

    fn transition(&mut self, next: FeedState) {
        tracing::debug!(feed = %self.feed_name, from = ?self.state, to = ?next, "feed state");
        self.state = next;
    }

    fn push(&mut self, episode: Option<Episode>, result: OutcomeResult) {
        self.outcomes.push(DownloadOutcome { episode, result });
    }

    fn skip_all(&mut self, episodes: impl IntoIterator<Item = Episode>, reason: SkipReason) {
        for episode in episodes {
            self.push(Some(episode), OutcomeResult::Skipped(reason));
        }
    }

    fn finish(mut self, state: FeedState) -> FeedReport {
        self.transition(state);
        FeedReport {
            feed_name: self.feed_name,
            feed_id: self.feed_id,
            state: self.state,
            outcomes: self.outcomes,
        }
    }
}

/// Hands a feed slot back to the pool when the task ends, even by panic
struct SlotGuard {
    slot: usize,
    pool: mpsc::Sender<usize>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // Capacity equals the number of slots, so there is always room
        let _ = self.pool.try_send(self.slot);
    }
}

/// Feeds that must not run at the same time, in configuration order
#[derive(Default)]
struct Lane {
    directories: HashSet<PathBuf>,
    feed_ids: HashSet<String>,
    feeds: Vec<(usize, Feed)>,
}

impl Lane {
    fn overlaps(&self, directory: &Path, feed_id: &str) -> bool {
        self.directories.contains(directory) || self.feed_ids.contains(feed_id)
    }

    fn absorb(&mut self, other: Lane) {
        self.directories.extend(other.directories);
        self.feed_ids.extend(other.feed_ids);
        self.feeds.extend(other.feeds);
    }
}

/// Group feeds that share a download directory or a feed id
///
/// Feeds in one lane run one after another; separate lanes may run
/// concurrently. Lanes are ordered by their first feed.
fn serial_lanes(feeds: Vec<(usize, Feed)>, root: &Path) -> Vec<Vec<(usize, Feed)>> {
    let mut lanes: Vec<Lane> = Vec::new();

    for (index, feed) in feeds {
        let directory = feed.directory_in(root);
        let feed_id = feed.id();

        let mut lane = Lane::default();
        let mut i = 0;
        while i < lanes.len() {
            if lanes[i].overlaps(&directory, &feed_id) {
                lane.absorb(lanes.swap_remove(i));
            } else {
                i += 1;
            }
        }

        lane.directories.insert(directory);
        lane.feed_ids.insert(feed_id);
        lane.feeds.push((index, feed));
        lanes.push(lane);
    }

    let mut lanes: Vec<Vec<(usize, Feed)>> = lanes
        .into_iter()
        .map(|mut lane| {
            lane.feeds.sort_by_key(|(index, _)| *index);
            lane.feeds
        })
        .collect();
    lanes.sort_by_key(|feeds| feeds.first().map(|(index, _)| *index));
    lanes
}

/// File names taken in one feed directory during a run
struct ClaimedNames {
    directory: PathBuf,
    taken: HashSet<String>,
}

impl ClaimedNames {
    fn new(directory: PathBuf) -> Self {
        Self {
            directory,
            taken: HashSet::new(),
        }
    }

    /// Names recorded in history stay reserved even when the file is gone
    fn reserve_recorded(&mut self, records: &[HistoryRecord]) {
        for record in records {
            if record.path.parent() == Some(self.directory.as_path())
                && let Some(name) = record.path.file_name().and_then(|n| n.to_str())
            {
                self.taken.insert(name.to_string());
            }
        }
    }

    /// Claim `rendered` for an episode
    ///
    /// A name held by another episode, or by a file already on disk, is
    /// replaced by the episode's own tagged variant.
    async fn claim(&mut self, rendered: String, episode_id: &str) -> String {
        if self.is_free(&rendered).await {
            self.taken.insert(rendered.clone());
            return rendered;
        }

        let mut candidate = disambiguate(&rendered, episode_id);
        let mut attempt = 1u32;
        while self.taken.contains(&candidate) {
            attempt += 1;
            candidate = disambiguate(&rendered, &format!("{episode_id}#{attempt}"));
        }

        tracing::debug!(%rendered, chosen = %candidate, "file name already taken");
        self.taken.insert(candidate.clone());
        candidate
    }

    async fn is_free(&self, name: &str) -> bool {
        !self.taken.contains(name)
            && matches!(
                tokio::fs::try_exists(self.directory.join(name)).await,
                Ok(false)
            )
    }
}

/// Synchronizes feeds against a history store
///
/// The history handle is passed in explicitly; nothing in the crate keeps
/// global download state.
pub struct Syncer<C: ?Sized, H: ?Sized> {
    client: Arc<C>,
    history: Arc<H>,
    reporter: SharedProgressReporter,
    options: SyncOptions,
    budget: DownloadBudget,
}

impl<C, H> Syncer<C, H>
where
    C: HttpClient + ?Sized + 'static,
    H: HistoryStore + ?Sized + 'static,
{
    pub fn new(
        client: Arc<C>,
        history: Arc<H>,
        reporter: SharedProgressReporter,
        options: SyncOptions,
    ) -> Self {
        Self {
            client,
            history,
            reporter,
            budget: DownloadBudget::new(options.downloads_limit),
            options,
        }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Sync every feed, at most `max_concurrent_feeds` at a time
    ///
    /// Feeds sharing a download directory or a feed id run one after
    /// another. A failing feed never affects the others. Reports come back
    /// in the order the feeds were given.
    pub async fn sync_all(self: Arc<Self>, feeds: Vec<Feed>) -> RunReport {
        // The slot pool limits concurrency and gives each running feed a stable slot ID
        let slots = self.options.max_concurrent_feeds.max(1);
        let (slot_tx, mut slot_rx) = mpsc::channel(slots);
        for slot in 0..slots {
            let _ = slot_tx.try_send(slot);
        }

        let total = feeds.len();
        let mut reports: Vec<Option<FeedReport>> = (0..total).map(|_| None).collect();
        let mut active = Vec::with_capacity(total);
        for (index, feed) in feeds.into_iter().enumerate() {
            if feed.disabled {
                reports[index] = Some(disabled_report(&feed));
            } else {
                active.push((index, feed));
            }
        }

        let mut running = Vec::new();
        for lane in serial_lanes(active, &self.options.download_dir) {
            // Acquire a slot BEFORE spawning so lanes start in configuration order
            let Some(slot) = slot_rx.recv().await else {
                break;
            };

            let guard = SlotGuard {
                slot,
                pool: slot_tx.clone(),
            };
            let syncer = Arc::clone(&self);
            let members: Vec<(usize, String, String)> = lane
                .iter()
                .map(|(index, feed)| (*index, feed.name.clone(), feed.id()))
                .collect();

            let handle = tokio::spawn(async move {
                let _guard = guard;
                let mut lane_reports = Vec::with_capacity(lane.len());
                for (index, feed) in lane {
                    lane_reports.push((index, syncer.sync_feed(&feed, slot).await));
                }
                lane_reports
            });

            running.push((members, handle));
        }

        for (members, handle) in running {
            match handle.await {
                Ok(lane_reports) => {
                    for (index, feed_report) in lane_reports {
                        reports[index] = Some(feed_report);
                    }
                }
                Err(e) => {
                    for (index, feed_name, feed_id) in members {
                        tracing::error!(feed = %feed_name, error = %e, "feed task failed");
                        reports[index] = Some(FeedReport {
                            feed_name,
                            feed_id,
                            state: FeedState::Aborted,
                            outcomes: vec![DownloadOutcome {
                                episode: None,
                                result: OutcomeResult::Failed(SyncError::TaskFailed(e.to_string())),
                            }],
                        });
                    }
                }
            }
        }

        let report = RunReport {
            feeds: reports.into_iter().flatten().collect(),
        };

        self.reporter.report(ProgressEvent::SyncCompleted {
            downloaded_count: report.downloaded(),
            skipped_count: report.skipped(),
            failed_count: report.failed(),
        });

        report
    }

    /// Sync a single feed: fetch, parse, diff, then download and record each
    /// pending episode in feed order
    pub async fn sync_feed(&self, feed: &Feed, slot: usize) -> FeedReport {
        if feed.disabled {
            return disabled_report(feed);
        }

        let report = self.run_feed(feed, slot).await;

        self.reporter.report(ProgressEvent::FeedCompleted {
            slot,
            feed_name: report.feed_name.clone(),
            downloaded: report.downloaded(),
            skipped: report.skipped(),
            failed: report.failed(),
        });

        tracing::info!(
            feed = %report.feed_name,
            state = ?report.state,
            downloaded = report.downloaded(),
            skipped = report.skipped(),
            failed = report.failed(),
            "feed finished"
        );

        report
    }

    async fn run_feed(&self, feed: &Feed, slot: usize) -> FeedReport {
        let mut run = FeedRun::new(feed);

        run.transition(FeedState::Fetching);
        self.reporter.report(ProgressEvent::FetchingFeed {
            slot,
            feed_name: feed.name.clone(),
            url: feed.source.clone(),
        });

        let podcast = match self.load_podcast(feed).await {
            Ok(podcast) => podcast,
            Err(e) => {
                self.report_feed_failure(slot, feed, &e);
                run.push(None, OutcomeResult::Failed(e));
                return run.finish(FeedState::FetchFailed);
            }
        };
        run.transition(FeedState::Parsed);

        let episodes = retain_media_types(podcast.episodes, &self.options.media_types);

        let known = match self.history.list_known_episodes(&run.feed_id).await {
            Ok(known) => known,
            Err(e) => {
                let e = SyncError::from(e);
                self.report_feed_failure(slot, feed, &e);
                run.push(None, OutcomeResult::Failed(e));
                return run.finish(FeedState::Aborted);
            }
        };

        let passed_over = match self.history.list_passed_over(&run.feed_id).await {
            Ok(passed_over) => passed_over,
            Err(e) => {
                let e = SyncError::from(e);
                self.report_feed_failure(slot, feed, &e);
                run.push(None, OutcomeResult::Failed(e));
                return run.finish(FeedState::Aborted);
            }
        };

        let (diff, newly_passed) = self.plan(feed, episodes, &known, passed_over);
        run.transition(FeedState::Diffed);

        self.reporter.report(ProgressEvent::FeedParsed {
            slot,
            feed_name: feed.name.clone(),
            total_episodes: diff.total_episodes,
            new_episodes: diff.new_episodes(),
            to_download: diff.pending.len(),
        });

        let FeedDiff {
            pending,
            already_known,
            over_limit,
            passed_over,
            ..
        } = diff;

        if !newly_passed.is_empty()
            && !self.options.dry_run
            && let Err(e) = self
                .history
                .record_passed_over(&run.feed_id, newly_passed)
                .await
        {
            let e = SyncError::from(e);
            self.report_feed_failure(slot, feed, &e);
            run.push(None, OutcomeResult::Failed(e));
            run.skip_all(pending, SkipReason::FeedAborted);
            return run.finish(FeedState::Aborted);
        }

        let directory = feed.directory_in(&self.options.download_dir);
        let mut names = ClaimedNames::new(directory.clone());
        if !pending.is_empty() && !self.options.dry_run {
            let prepared = match self.prepare(feed, &directory).await {
                Ok(()) => self
                    .history
                    .records(&run.feed_id)
                    .await
                    .map_err(SyncError::from),
                Err(e) => Err(SyncError::from(e)),
            };

            match prepared {
                Ok(records) => names.reserve_recorded(&records),
                Err(e) => {
                    self.report_feed_failure(slot, feed, &e);
                    run.push(None, OutcomeResult::Failed(e));
                    run.skip_all(pending, SkipReason::FeedAborted);
                    return run.finish(FeedState::Aborted);
                }
            }
        }

        let template = feed
            .file_name_template
            .as_ref()
            .unwrap_or(&self.options.file_name_template);
        let total_to_download = pending.len();
        let mut started = 0usize;
        let mut queue = pending.into_iter().enumerate();

        while let Some((index, episode)) = queue.next() {
            run.transition(FeedState::Downloading { index });

            // Another subscription to the same feed may have fetched it meanwhile
            match self.history.has_record(&run.feed_id, &episode.id).await {
                Ok(false) => {}
                Ok(true) => {
                    run.push(
                        Some(episode),
                        OutcomeResult::Skipped(SkipReason::AlreadyDownloaded),
                    );
                    continue;
                }
                Err(e) => {
                    run.push(Some(episode), OutcomeResult::Failed(e.into()));
                    run.skip_all(queue.map(|(_, e)| e), SkipReason::FeedAborted);
                    return run.finish(FeedState::Aborted);
                }
            }

            if !self.budget.try_take() {
                run.push(
                    Some(episode),
                    OutcomeResult::Skipped(SkipReason::DownloadBudgetExhausted),
                );
                continue;
            }

            if self.options.dry_run {
                tracing::info!(feed = %feed.name, title = %episode.title, url = %episode.enclosure.url, "would download");
                run.push(Some(episode), OutcomeResult::Skipped(SkipReason::DryRun));
                continue;
            }

            if started > 0 && !self.options.download_delay.is_zero() {
                tokio::time::sleep(self.options.download_delay).await;
            }
            started += 1;

            let file_name = names.claim(template.render(&episode), &episode.id).await;
            let context = DownloadContext {
                slot,
                episode_index: index,
                total_to_download,
            };

            let file = match self
                .download_with_retry(&episode, &directory, &file_name, &context)
                .await
            {
                Ok(file) => file,
                Err(e) => {
                    self.budget.refund();
                    self.report_download_failure(slot, &episode, &e.to_string());
                    run.push(Some(episode), OutcomeResult::Failed(e.into()));
                    continue;
                }
            };

            // Recorded right away so a crash later in the run keeps history in step with disk
            let record = HistoryRecord::for_download(&run.feed_id, &episode, &file, Utc::now());
            match self.history.record_download(record).await {
                Ok(_) => {
                    run.push(
                        Some(episode),
                        OutcomeResult::Downloaded {
                            path: file.path,
                            bytes: file.bytes,
                        },
                    );
                }
                Err(e) => {
                    if let Err(remove_error) = tokio::fs::remove_file(&file.path).await {
                        tracing::warn!(path = %file.path.display(), error = %remove_error, "could not remove unrecorded download");
                    }
                    self.report_download_failure(slot, &episode, &e.to_string());
                    tracing::error!(feed = %feed.name, error = %e, "history write failed, aborting feed");
                    run.push(Some(episode), OutcomeResult::Failed(e.into()));
                    run.skip_all(queue.map(|(_, e)| e), SkipReason::FeedAborted);
                    return run.finish(FeedState::Aborted);
                }
            }
        }

        if self.options.report_skipped {
            run.skip_all(already_known, SkipReason::AlreadyDownloaded);
            run.skip_all(over_limit, SkipReason::OverLimit);
            run.skip_all(passed_over, SkipReason::PassedOver);
        }

        run.finish(FeedState::Completed)
    }

    /// Diff a feed against history
    ///
    /// On a feed's first sync (nothing recorded, nothing passed over) the
    /// first-sync policy picks what to take. Everything it leaves out is
    /// returned so it can be remembered as passed over. The feed's own limit
    /// only paces downloads and never passes anything over.
    fn plan(
        &self,
        feed: &Feed,
        episodes: Vec<Episode>,
        known: &HashSet<String>,
        mut passed_over: HashSet<String>,
    ) -> (FeedDiff, Vec<String>) {
        let mut newly_passed = Vec::new();

        if known.is_empty() && passed_over.is_empty() {
            let policy = feed.first_sync.unwrap_or(self.options.first_sync);
            let window = policy.window(Local::now().date_naive(), self.options.last_run);
            tracing::debug!(feed = %feed.name, %policy, ?window, "first sync");

            let first = plan_window(episodes.clone(), known, &passed_over, window);
            newly_passed = first
                .over_limit
                .iter()
                .chain(&first.passed_over)
                .map(|episode| episode.id.clone())
                .collect();
            passed_over.extend(newly_passed.iter().cloned());
        }

        let diff = plan_window(episodes, known, &passed_over, Window::limit(feed.limit));
        (diff, newly_passed)
    }

    async fn load_podcast(&self, feed: &Feed) -> Result<Podcast, SyncError> {
        let (bytes, feed_url) = match feed.location()? {
            FeedLocation::Remote(url) => {
                let bytes = fetch_feed_bytes(self.client.as_ref(), url.as_str()).await?;
                (bytes, url)
            }
            FeedLocation::Local(path) => {
                let bytes = read_feed_file(&path).await?;
                (bytes, file_path_to_url(&path)?)
            }
        };

        let podcast = parse_feed(&bytes, feed_url, feed.format)?;
        if podcast.skipped_items > 0 {
            tracing::warn!(feed = %feed.name, skipped = podcast.skipped_items, "some feed items were skipped");
        }

        Ok(podcast)
    }

    async fn prepare(&self, feed: &Feed, directory: &Path) -> Result<(), DownloadError> {
        prepare_directory(directory).await?;

        match clean_partial_files(directory).await {
            Ok(0) => {}
            Ok(count) => self.reporter.report(ProgressEvent::PartialFilesCleanedUp {
                feed_name: feed.name.clone(),
                count,
            }),
            Err(e) => tracing::warn!(error = %e, "could not clean partial files"),
        }

        Ok(())
    }

    async fn download_with_retry(
        &self,
        episode: &Episode,
        directory: &Path,
        file_name: &str,
        context: &DownloadContext,
    ) -> Result<DownloadedFile, DownloadError> {
        let attempts = self.options.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = download_episode(
                self.client.as_ref(),
                episode,
                directory,
                file_name,
                context,
                &self.reporter,
            )
            .await;

            match result {
                Err(e) if attempt < attempts => {
                    tracing::warn!(title = %episode.title, attempt, error = %e, "download failed, retrying");
                    attempt += 1;
                    if !self.options.download_delay.is_zero() {
                        tokio::time::sleep(self.options.download_delay).await;
                    }
                }
                result => return result,
            }
        }
    }

    fn report_feed_failure(&self, slot: usize, feed: &Feed, error: &SyncError) {
        tracing::warn!(feed = %feed.name, error = %error, "feed failed");
        self.reporter.report(ProgressEvent::FeedFailed {
            slot,
            feed_name: feed.name.clone(),
            error: error.to_string(),
        });
    }

    fn report_download_failure(&self, slot: usize, episode: &Episode, error: &str) {
        tracing::warn!(title = %episode.title, error, "download failed");
        self.reporter.report(ProgressEvent::DownloadFailed {
            slot,
            episode_title: episode.title.clone(),
            error: error.to_string(),
        });
    }
}

fn disabled_report(feed: &Feed) -> FeedReport {
    tracing::debug!(feed = %feed.name, "feed disabled");
    let mut run = FeedRun::new(feed);
    run.push(None, OutcomeResult::Skipped(SkipReason::Disabled));
    run.finish(FeedState::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::{TempDir, tempdir};

    use crate::error::{FeedError, HistoryError, TransportError};
    use crate::history::{JsonHistoryStore, MemoryHistoryStore};
    use crate::http::{BufferedResponse, HttpResponse};
    use crate::progress::NoopReporter;
    use crate::test_support::{MockHttpClient, MockResponse, dated_rss_feed, rss_feed};

    const FEED_URL: &str = "https://example.com/feed.xml";

    fn three_episode_feed() -> String {
        rss_feed(
            "Test Podcast",
            &[
                ("Episode 3", "ep3", "https://example.com/ep3.mp3"),
                ("Episode 2", "ep2", "https://example.com/ep2.mp3"),
                ("Episode 1", "ep1", "https://example.com/ep1.mp3"),
            ],
        )
    }

    fn client_for(feed_url: &str, feed_xml: &str) -> MockHttpClient {
        MockHttpClient::new()
            .with_body(feed_url, feed_xml)
            .with_body("https://example.com/ep1.mp3", "audio one")
            .with_body("https://example.com/ep2.mp3", "audio two")
            .with_body("https://example.com/ep3.mp3", "audio three")
    }

    fn options(dir: &TempDir) -> SyncOptions {
        SyncOptions {
            download_dir: dir.path().to_path_buf(),
            first_sync: FirstSync::All,
            ..Default::default()
        }
    }

    fn syncer<C: HttpClient + 'static, H: HistoryStore + 'static>(
        client: C,
        history: Arc<H>,
        options: SyncOptions,
    ) -> Syncer<C, H> {
        Syncer::new(Arc::new(client), history, NoopReporter::shared(), options)
    }

    fn titles(report: &FeedReport, pick: fn(&DownloadOutcome) -> bool) -> Vec<String> {
        report
            .outcomes
            .iter()
            .filter(|o| pick(o))
            .filter_map(|o| o.episode.as_ref().map(|e| e.title.clone()))
            .collect()
    }

    fn feed() -> Feed {
        Feed::new("Test Podcast", FEED_URL)
    }

    #[tokio::test]
    async fn sync_downloads_and_records_all_episodes() {
        let dir = tempdir().unwrap();
        let history = Arc::new(MemoryHistoryStore::new());
        let syncer = syncer(
            client_for(FEED_URL, &three_episode_feed()),
            history.clone(),
            options(&dir),
        );

        let report = syncer.sync_feed(&feed(), 0).await;

        assert_eq!(report.state, FeedState::Completed);
        assert_eq!(report.downloaded(), 3);
        assert_eq!(
            titles(&report, DownloadOutcome::is_downloaded),
            vec!["Episode 3", "Episode 2", "Episode 1"]
        );

        let show_dir = dir.path().join("Test Podcast");
        assert_eq!(
            std::fs::read(show_dir.join("undated-Episode-1.mp3")).unwrap(),
            b"audio one"
        );

        let records = history.records(&feed().id()).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.path.starts_with(&show_dir)));
    }

    #[tokio::test]
    async fn second_run_downloads_nothing() {
        let dir = tempdir().unwrap();
        let history = Arc::new(MemoryHistoryStore::new());
        let client = client_for(FEED_URL, &three_episode_feed());
        let syncer = syncer(
            client.clone(),
            history.clone(),
            SyncOptions {
                report_skipped: true,
                ..options(&dir)
            },
        );

        syncer.sync_feed(&feed(), 0).await;
        let requests_after_first = client.request_count();
        let second = syncer.sync_feed(&feed(), 0).await;

        assert_eq!(second.downloaded(), 0);
        assert_eq!(second.skipped(), 3);
        assert!(second.outcomes.iter().all(|o| matches!(
            o.result,
            OutcomeResult::Skipped(SkipReason::AlreadyDownloaded)
        )));
        // Only the feed document was fetched again
        assert_eq!(client.request_count(), requests_after_first + 1);
        for id in ["ep1", "ep2", "ep3"] {
            assert!(history.has_record(&feed().id(), id).await.unwrap());
        }
    }

    #[tokio::test]
    async fn history_survives_restart() {
        let dir = tempdir().unwrap();
        let history_path = dir.path().join("history.json");
        let client = client_for(FEED_URL, &three_episode_feed());

        let first = syncer(
            client.clone(),
            Arc::new(JsonHistoryStore::open(&history_path).await.unwrap()),
            options(&dir),
        );
        assert_eq!(first.sync_feed(&feed(), 0).await.downloaded(), 3);
        drop(first);

        let second = syncer(
            client,
            Arc::new(JsonHistoryStore::open(&history_path).await.unwrap()),
            options(&dir),
        );
        assert_eq!(second.sync_feed(&feed(), 0).await.downloaded(), 0);
    }

    #[tokio::test]
    async fn failed_episode_does_not_stop_siblings() {
        let dir = tempdir().unwrap();
        let history = Arc::new(MemoryHistoryStore::new());
        let client = client_for(FEED_URL, &three_episode_feed())
            .with("https://example.com/ep2.mp3", MockResponse::NetworkError);
        let syncer = syncer(client, history.clone(), options(&dir));

        let report = syncer.sync_feed(&feed(), 0).await;

        let kinds: Vec<&str> = report
            .outcomes
            .iter()
            .map(|o| match o.result {
                OutcomeResult::Downloaded { .. } => "downloaded",
                OutcomeResult::Failed(_) => "failed",
                OutcomeResult::Skipped(_) => "skipped",
            })
            .collect();
        assert_eq!(kinds, vec!["downloaded", "failed", "downloaded"]);
        assert!(matches!(
            report.outcomes[1].result,
            OutcomeResult::Failed(SyncError::Download(DownloadError::HttpFailed { .. }))
        ));

        let feed_id = feed().id();
        assert!(history.has_record(&feed_id, "ep3").await.unwrap());
        assert!(!history.has_record(&feed_id, "ep2").await.unwrap());
        assert!(history.has_record(&feed_id, "ep1").await.unwrap());
        assert_eq!(report.state, FeedState::Completed);
    }

    #[tokio::test]
    async fn failed_episode_is_retried_next_run() {
        let dir = tempdir().unwrap();
        let history = Arc::new(MemoryHistoryStore::new());
        let client = client_for(FEED_URL, &three_episode_feed())
            .with("https://example.com/ep2.mp3", MockResponse::status(500));
        let syncer = syncer(client.clone(), history, options(&dir));

        assert_eq!(syncer.sync_feed(&feed(), 0).await.failed(), 1);

        client.set("https://example.com/ep2.mp3", MockResponse::body("audio two"));
        let second = syncer.sync_feed(&feed(), 0).await;

        assert_eq!(titles(&second, DownloadOutcome::is_downloaded), vec!["Episode 2"]);
    }

    #[tokio::test]
    async fn interrupted_download_leaves_no_record_and_no_file() {
        let dir = tempdir().unwrap();
        let history = Arc::new(MemoryHistoryStore::new());
        let feed_xml = rss_feed("Show", &[("Episode 1", "ep1", "https://example.com/ep1.mp3")]);
        let client = MockHttpClient::new().with_body(FEED_URL, feed_xml).with(
            "https://example.com/ep1.mp3",
            MockResponse::BrokenStream {
                first_chunk: b"half".to_vec(),
                content_length: Some(1000),
            },
        );
        let syncer = syncer(client, history.clone(), options(&dir));

        let report = syncer.sync_feed(&Feed::new("Show", FEED_URL), 0).await;

        assert_eq!(report.failed(), 1);
        assert!(!history.has_record(&feed().id(), "ep1").await.unwrap());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("Show"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn feed_failure_is_isolated() {
        let dir = tempdir().unwrap();
        let broken_url = "https://broken.example.com/feed.xml";
        let client = client_for(FEED_URL, &three_episode_feed())
            .with(broken_url, MockResponse::status(500));
        let syncer = Arc::new(syncer(
            client,
            Arc::new(MemoryHistoryStore::new()),
            options(&dir),
        ));

        let report = syncer
            .sync_all(vec![Feed::new("Broken", broken_url), feed()])
            .await;

        assert_eq!(report.feeds.len(), 2);
        let broken = &report.feeds[0];
        assert_eq!(broken.feed_name, "Broken");
        assert_eq!(broken.state, FeedState::FetchFailed);
        assert_eq!(broken.outcomes.len(), 1);
        assert!(matches!(
            broken.feed_error(),
            Some(SyncError::Feed(FeedError::HttpStatus { status: 500, .. }))
        ));

        let healthy = &report.feeds[1];
        assert_eq!(healthy.state, FeedState::Completed);
        assert_eq!(healthy.downloaded(), 3);
        assert!(report.has_failures());
    }

    #[tokio::test]
    async fn unparseable_feed_is_a_fetch_failure() {
        let dir = tempdir().unwrap();
        let client = MockHttpClient::new().with_body(FEED_URL, "this is not xml");
        let syncer = syncer(client, Arc::new(MemoryHistoryStore::new()), options(&dir));

        let report = syncer.sync_feed(&feed(), 0).await;

        assert_eq!(report.state, FeedState::FetchFailed);
        assert!(matches!(report.feed_error(), Some(SyncError::Feed(_))));
    }

    #[tokio::test]
    async fn per_feed_limit_takes_newest_unseen() {
        let dir = tempdir().unwrap();
        let syncer = syncer(
            client_for(FEED_URL, &three_episode_feed()),
            Arc::new(MemoryHistoryStore::new()),
            SyncOptions {
                report_skipped: true,
                ..options(&dir)
            },
        );

        let report = syncer.sync_feed(&feed().with_limit(Some(2)), 0).await;

        assert_eq!(
            titles(&report, DownloadOutcome::is_downloaded),
            vec!["Episode 3", "Episode 2"]
        );
        assert!(matches!(
            report.outcomes[2].result,
            OutcomeResult::Skipped(SkipReason::OverLimit)
        ));
    }

    #[tokio::test]
    async fn title_change_upstream_is_not_a_new_episode() {
        let dir = tempdir().unwrap();
        let history = Arc::new(MemoryHistoryStore::new());
        let client = client_for(FEED_URL, &three_episode_feed());
        let syncer = syncer(client.clone(), history, options(&dir));
        syncer.sync_feed(&feed(), 0).await;

        let retitled = rss_feed(
            "Test Podcast",
            &[
                ("Episode 3 (fixed audio)", "ep3", "https://example.com/ep3.mp3"),
                ("Episode 2", "ep2", "https://example.com/ep2.mp3"),
                ("Episode 1", "ep1", "https://example.com/ep1.mp3"),
            ],
        );
        client.set(FEED_URL, MockResponse::body(retitled));

        let report = syncer.sync_feed(&feed(), 0).await;

        assert_eq!(report.downloaded(), 0);
    }

    #[tokio::test]
    async fn dry_run_downloads_and_records_nothing() {
        let dir = tempdir().unwrap();
        let history = Arc::new(MemoryHistoryStore::new());
        let syncer = syncer(
            client_for(FEED_URL, &three_episode_feed()),
            history.clone(),
            SyncOptions {
                dry_run: true,
                ..options(&dir)
            },
        );

        let report = syncer.sync_feed(&feed(), 0).await;

        assert_eq!(report.skipped(), 3);
        assert!(report.outcomes.iter().all(|o| matches!(
            o.result,
            OutcomeResult::Skipped(SkipReason::DryRun)
        )));
        assert!(history.list_known_episodes(&feed().id()).await.unwrap().is_empty());
        assert!(!dir.path().join("Test Podcast").exists());
    }

    #[tokio::test]
    async fn download_budget_is_shared_across_feeds() {
        let dir = tempdir().unwrap();
        let other_url = "https://other.example.com/feed.xml";
        let other_feed = rss_feed("Other", &[("Other 1", "o1", "https://example.com/ep1.mp3")]);
        let client = client_for(FEED_URL, &three_episode_feed()).with_body(other_url, other_feed);
        let syncer = Arc::new(syncer(
            client,
            Arc::new(MemoryHistoryStore::new()),
            SyncOptions {
                downloads_limit: Some(2),
                max_concurrent_feeds: 1,
                ..options(&dir)
            },
        ));

        let report = syncer
            .sync_all(vec![feed(), Feed::new("Other", other_url)])
            .await;

        assert_eq!(report.downloaded(), 2);
        assert_eq!(report.feeds[0].downloaded(), 2);
        assert!(matches!(
            report.feeds[1].outcomes[0].result,
            OutcomeResult::Skipped(SkipReason::DownloadBudgetExhausted)
        ));
        assert!(!report.has_failures());
    }

    #[tokio::test]
    async fn failed_download_returns_its_budget() {
        let budget = DownloadBudget::new(Some(1));
        assert!(budget.try_take());
        assert!(!budget.try_take());
        budget.refund();
        assert!(budget.try_take());
        assert!(DownloadBudget::new(None).try_take());
    }

    #[tokio::test]
    async fn disabled_feed_is_skipped_without_fetching() {
        let dir = tempdir().unwrap();
        let client = client_for(FEED_URL, &three_episode_feed());
        let syncer = Arc::new(syncer(
            client.clone(),
            Arc::new(MemoryHistoryStore::new()),
            options(&dir),
        ));
        let mut disabled = feed();
        disabled.disabled = true;

        let report = syncer.sync_all(vec![disabled]).await;

        assert_eq!(client.request_count(), 0);
        assert!(matches!(
            report.feeds[0].outcomes[0],
            DownloadOutcome {
                episode: None,
                result: OutcomeResult::Skipped(SkipReason::Disabled)
            }
        ));
    }

    #[tokio::test]
    async fn local_feed_file_is_supported() {
        let dir = tempdir().unwrap();
        let feed_path = dir.path().join("feed.xml");
        std::fs::write(&feed_path, three_episode_feed()).unwrap();
        let syncer = syncer(
            client_for(FEED_URL, ""),
            Arc::new(MemoryHistoryStore::new()),
            options(&dir),
        );

        let local = Feed::new("Local", feed_path.to_string_lossy().to_string())
            .with_directory(dir.path().join("out"));
        let report = syncer.sync_feed(&local, 0).await;

        assert_eq!(report.downloaded(), 3);
        assert!(report.feed_id.starts_with("file://"));
        assert!(dir.path().join("out").join("undated-Episode-3.mp3").exists());
    }

    #[tokio::test]
    async fn custom_template_names_files() {
        let dir = tempdir().unwrap();
        let syncer = syncer(
            client_for(FEED_URL, &three_episode_feed()),
            Arc::new(MemoryHistoryStore::new()),
            SyncOptions {
                file_name_template: FilenameTemplate::parse("%file_name%.%file_extension%")
                    .unwrap(),
                ..options(&dir)
            },
        );

        syncer.sync_feed(&feed(), 0).await;

        assert!(dir.path().join("Test Podcast").join("ep2.mp3").exists());
    }

    #[tokio::test]
    async fn leftover_partial_files_are_cleaned_before_downloading() {
        let dir = tempdir().unwrap();
        let show_dir = dir.path().join("Test Podcast");
        std::fs::create_dir_all(&show_dir).unwrap();
        std::fs::write(show_dir.join("old.mp3.partial"), b"junk").unwrap();
        let syncer = syncer(
            client_for(FEED_URL, &three_episode_feed()),
            Arc::new(MemoryHistoryStore::new()),
            options(&dir),
        );

        syncer.sync_feed(&feed(), 0).await;

        assert!(!show_dir.join("old.mp3.partial").exists());
    }

    /// Client that fails the first request to each URL, then delegates
    struct FlakyClient {
        inner: MockHttpClient,
        failed: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl HttpClient for FlakyClient {
        async fn get_bytes(&self, url: &str) -> Result<BufferedResponse, TransportError> {
            self.inner.get_bytes(url).await
        }

        async fn get_stream(&self, url: &str) -> Result<HttpResponse, TransportError> {
            if self.failed.lock().unwrap().insert(url.to_string()) {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "timed out",
                )));
            }
            self.inner.get_stream(url).await
        }
    }

    #[tokio::test]
    async fn retries_within_run_when_configured() {
        let dir = tempdir().unwrap();
        let flaky = || FlakyClient {
            inner: client_for(FEED_URL, &three_episode_feed()),
            failed: Mutex::new(HashSet::new()),
        };

        let single = syncer(flaky(), Arc::new(MemoryHistoryStore::new()), options(&dir));
        assert_eq!(single.sync_feed(&feed(), 0).await.failed(), 3);

        let retrying = syncer(
            flaky(),
            Arc::new(MemoryHistoryStore::new()),
            SyncOptions {
                max_attempts: 2,
                ..options(&dir)
            },
        );
        assert_eq!(retrying.sync_feed(&feed(), 0).await.downloaded(), 3);
    }

    /// Store whose reads work but whose writes fail, or whose reads fail too
    struct BrokenHistoryStore {
        fail_reads: bool,
    }

    #[async_trait]
    impl HistoryStore for BrokenHistoryStore {
        async fn has_record(&self, _: &str, _: &str) -> Result<bool, HistoryError> {
            Ok(false)
        }

        async fn record_download(&self, _: HistoryRecord) -> Result<bool, HistoryError> {
            Err(HistoryError::Unavailable("disk full".to_string()))
        }

        async fn list_known_episodes(&self, _: &str) -> Result<HashSet<String>, HistoryError> {
            if self.fail_reads {
                Err(HistoryError::Unavailable("locked".to_string()))
            } else {
                Ok(HashSet::new())
            }
        }

        async fn records(&self, _: &str) -> Result<Vec<HistoryRecord>, HistoryError> {
            Ok(Vec::new())
        }

        async fn record_passed_over(&self, _: &str, _: Vec<String>) -> Result<(), HistoryError> {
            Err(HistoryError::Unavailable("disk full".to_string()))
        }

        async fn list_passed_over(&self, _: &str) -> Result<HashSet<String>, HistoryError> {
            Ok(HashSet::new())
        }
    }

    #[tokio::test]
    async fn history_write_failure_aborts_feed() {
        let dir = tempdir().unwrap();
        let syncer = syncer(
            client_for(FEED_URL, &three_episode_feed()),
            Arc::new(BrokenHistoryStore { fail_reads: false }),
            options(&dir),
        );

        let report = syncer.sync_feed(&feed(), 0).await;

        assert_eq!(report.state, FeedState::Aborted);
        assert!(matches!(
            report.outcomes[0].result,
            OutcomeResult::Failed(SyncError::History(_))
        ));
        assert_eq!(
            titles(&report, |o| matches!(
                o.result,
                OutcomeResult::Skipped(SkipReason::FeedAborted)
            )),
            vec!["Episode 2", "Episode 1"]
        );
        // The unrecorded file was removed again
        assert!(!dir.path().join("Test Podcast").join("undated-Episode-3.mp3").exists());
    }

    #[tokio::test]
    async fn history_read_failure_aborts_before_downloading() {
        let dir = tempdir().unwrap();
        let client = client_for(FEED_URL, &three_episode_feed());
        let syncer = syncer(
            client.clone(),
            Arc::new(BrokenHistoryStore { fail_reads: true }),
            options(&dir),
        );

        let report = syncer.sync_feed(&feed(), 0).await;

        assert_eq!(report.state, FeedState::Aborted);
        assert_eq!(report.outcomes.len(), 1);
        assert!(matches!(report.feed_error(), Some(SyncError::History(_))));
        assert_eq!(client.request_count(), 1);
    }

    #[tokio::test]
    async fn same_title_episodes_get_separate_files() {
        let dir = tempdir().unwrap();
        let history = Arc::new(MemoryHistoryStore::new());
        let feed_xml = rss_feed(
            "Show",
            &[
                ("Bonus", "b2", "https://example.com/bonus2.mp3"),
                ("Bonus", "b1", "https://example.com/bonus1.mp3"),
            ],
        );
        let client = MockHttpClient::new()
            .with_body(FEED_URL, feed_xml)
            .with_body("https://example.com/bonus2.mp3", "second bonus")
            .with_body("https://example.com/bonus1.mp3", "first bonus");
        let syncer = syncer(client, history.clone(), options(&dir));
        let show = Feed::new("Show", FEED_URL);

        let report = syncer.sync_feed(&show, 0).await;

        assert_eq!(report.downloaded(), 2);
        let records = history.records(&show.id()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_ne!(records[0].path, records[1].path);
        for (episode_id, content) in [("b1", "first bonus"), ("b2", "second bonus")] {
            let record = records.iter().find(|r| r.episode_id == episode_id).unwrap();
            assert_eq!(std::fs::read(&record.path).unwrap(), content.as_bytes());
        }
        let b2 = records.iter().find(|r| r.episode_id == "b2").unwrap();
        assert_eq!(b2.path, dir.path().join("Show").join("undated-Bonus.mp3"));
        assert_eq!(std::fs::read_dir(dir.path().join("Show")).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn foreign_file_at_target_path_is_kept() {
        let dir = tempdir().unwrap();
        let history = Arc::new(MemoryHistoryStore::new());
        let show_dir = dir.path().join("Test Podcast");
        std::fs::create_dir_all(&show_dir).unwrap();
        std::fs::write(show_dir.join("undated-Episode-3.mp3"), b"keep me").unwrap();
        let syncer = syncer(
            client_for(FEED_URL, &three_episode_feed()),
            history.clone(),
            options(&dir),
        );

        let report = syncer.sync_feed(&feed(), 0).await;

        assert_eq!(report.downloaded(), 3);
        assert_eq!(
            std::fs::read(show_dir.join("undated-Episode-3.mp3")).unwrap(),
            b"keep me"
        );
        let records = history.records(&feed().id()).await.unwrap();
        let ep3 = records.iter().find(|r| r.episode_id == "ep3").unwrap();
        assert_ne!(ep3.path, show_dir.join("undated-Episode-3.mp3"));
        assert_eq!(std::fs::read(&ep3.path).unwrap(), b"audio three");
    }

    #[tokio::test]
    async fn recorded_name_is_not_reused_by_another_episode() {
        let dir = tempdir().unwrap();
        let history = Arc::new(MemoryHistoryStore::new());
        let client = MockHttpClient::new()
            .with_body(
                FEED_URL,
                rss_feed("Show", &[("Bonus", "b1", "https://example.com/bonus1.mp3")]),
            )
            .with_body("https://example.com/bonus1.mp3", "first bonus")
            .with_body("https://example.com/bonus2.mp3", "second bonus");
        let syncer = syncer(client.clone(), history.clone(), options(&dir));
        let show = Feed::new("Show", FEED_URL);
        syncer.sync_feed(&show, 0).await;

        // The first file was moved away by the user; its name still belongs to b1
        let taken = dir.path().join("Show").join("undated-Bonus.mp3");
        std::fs::remove_file(&taken).unwrap();
        client.set(
            FEED_URL,
            MockResponse::body(rss_feed(
                "Show",
                &[
                    ("Bonus", "b2", "https://example.com/bonus2.mp3"),
                    ("Bonus", "b1", "https://example.com/bonus1.mp3"),
                ],
            )),
        );

        let report = syncer.sync_feed(&show, 0).await;

        assert_eq!(report.downloaded(), 1);
        let b2 = history
            .records(&show.id())
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.episode_id == "b2")
            .unwrap();
        assert_ne!(b2.path, taken);
        assert!(!taken.exists());
    }

    #[test]
    fn lanes_group_shared_directories_and_feed_ids() {
        let root = Path::new("/podcasts");
        let feeds = vec![
            (0, Feed::new("A", "https://a.example.com/feed").with_directory("/podcasts/x")),
            (1, Feed::new("B", "https://b.example.com/feed")),
            (2, Feed::new("C", "https://c.example.com/feed").with_directory("/podcasts/x")),
            (3, Feed::new("B again", "https://b.example.com/feed").with_directory("/elsewhere")),
            (4, Feed::new("E", "https://e.example.com/feed")),
        ];

        let lanes: Vec<Vec<usize>> = serial_lanes(feeds, root)
            .into_iter()
            .map(|lane| lane.into_iter().map(|(index, _)| index).collect())
            .collect();

        assert_eq!(lanes, vec![vec![0, 2], vec![1, 3], vec![4]]);
    }

    #[test]
    fn lanes_merge_transitively() {
        let root = Path::new("/podcasts");
        let feeds = vec![
            (0, Feed::new("A", "https://a.example.com/feed").with_directory("/podcasts/x")),
            (1, Feed::new("B", "https://b.example.com/feed").with_directory("/podcasts/y")),
            (2, Feed::new("A in y", "https://a.example.com/feed").with_directory("/podcasts/y")),
        ];

        let lanes = serial_lanes(feeds, root);

        assert_eq!(lanes.len(), 1);
        assert_eq!(lanes[0].len(), 3);
    }

    #[tokio::test]
    async fn feeds_sharing_a_directory_do_not_disturb_each_other() {
        let dir = tempdir().unwrap();
        let shared = dir.path().join("shared");
        let slow_url = "https://slow.example.com/feed.xml";
        let quick_url = "https://quick.example.com/feed.xml";
        let client = MockHttpClient::new()
            .with_body(
                slow_url,
                rss_feed("Slow", &[("Long talk", "s1", "https://example.com/long.mp3")]),
            )
            .with_body(
                quick_url,
                rss_feed("Quick", &[("Short talk", "q1", "https://example.com/short.mp3")]),
            )
            .with(
                "https://example.com/long.mp3",
                MockResponse::Slow {
                    body: b"long audio".to_vec(),
                    pause: Duration::from_millis(200),
                },
            )
            .with_body("https://example.com/short.mp3", "short audio");
        let syncer = Arc::new(syncer(
            client,
            Arc::new(MemoryHistoryStore::new()),
            SyncOptions {
                max_concurrent_feeds: 2,
                ..options(&dir)
            },
        ));

        let report = syncer
            .sync_all(vec![
                Feed::new("Slow", slow_url).with_directory(&shared),
                Feed::new("Quick", quick_url).with_directory(&shared),
            ])
            .await;

        assert!(!report.has_failures());
        assert_eq!(report.downloaded(), 2);
        assert_eq!(report.feeds[0].feed_name, "Slow");
        assert_eq!(
            std::fs::read(shared.join("undated-Long-talk.mp3")).unwrap(),
            b"long audio"
        );
        assert_eq!(
            std::fs::read(shared.join("undated-Short-talk.mp3")).unwrap(),
            b"short audio"
        );
    }

    #[tokio::test]
    async fn duplicate_subscription_downloads_once() {
        let dir = tempdir().unwrap();
        let client = client_for(FEED_URL, &three_episode_feed());
        let syncer = Arc::new(syncer(
            client.clone(),
            Arc::new(MemoryHistoryStore::new()),
            SyncOptions {
                max_concurrent_feeds: 2,
                ..options(&dir)
            },
        ));

        let report = syncer
            .sync_all(vec![
                feed(),
                Feed::new("Same show", FEED_URL).with_directory(dir.path().join("copy")),
            ])
            .await;

        assert_eq!(report.feeds[0].downloaded(), 3);
        assert_eq!(report.feeds[1].downloaded(), 0);
        // Two feed fetches, three episodes
        assert_eq!(client.request_count(), 5);
        assert!(!dir.path().join("copy").exists());
    }

    #[tokio::test]
    async fn first_sync_takes_newest_episode_by_default() {
        let dir = tempdir().unwrap();
        let history = Arc::new(MemoryHistoryStore::new());
        let client = client_for(FEED_URL, &three_episode_feed())
            .with_body("https://example.com/ep4.mp3", "audio four");
        let syncer = syncer(
            client.clone(),
            history.clone(),
            SyncOptions {
                first_sync: FirstSync::default(),
                report_skipped: true,
                ..options(&dir)
            },
        );

        let first = syncer.sync_feed(&feed(), 0).await;

        assert_eq!(titles(&first, DownloadOutcome::is_downloaded), vec!["Episode 3"]);
        assert_eq!(
            titles(&first, |o| matches!(
                o.result,
                OutcomeResult::Skipped(SkipReason::PassedOver)
            )),
            vec!["Episode 2", "Episode 1"]
        );
        assert_eq!(
            history.list_passed_over(&feed().id()).await.unwrap(),
            HashSet::from(["ep2".to_string(), "ep1".to_string()])
        );

        client.set(
            FEED_URL,
            MockResponse::body(rss_feed(
                "Test Podcast",
                &[
                    ("Episode 4", "ep4", "https://example.com/ep4.mp3"),
                    ("Episode 3", "ep3", "https://example.com/ep3.mp3"),
                    ("Episode 2", "ep2", "https://example.com/ep2.mp3"),
                    ("Episode 1", "ep1", "https://example.com/ep1.mp3"),
                ],
            )),
        );
        let second = syncer.sync_feed(&feed(), 0).await;

        assert_eq!(titles(&second, DownloadOutcome::is_downloaded), vec!["Episode 4"]);
    }

    #[tokio::test]
    async fn failed_first_download_is_retried_without_the_back_catalogue() {
        let dir = tempdir().unwrap();
        let client = client_for(FEED_URL, &three_episode_feed())
            .with("https://example.com/ep3.mp3", MockResponse::status(503));
        let syncer = syncer(
            client.clone(),
            Arc::new(MemoryHistoryStore::new()),
            SyncOptions {
                first_sync: FirstSync::Last,
                ..options(&dir)
            },
        );

        assert_eq!(syncer.sync_feed(&feed(), 0).await.failed(), 1);

        client.set("https://example.com/ep3.mp3", MockResponse::body("audio three"));
        let second = syncer.sync_feed(&feed(), 0).await;

        assert_eq!(titles(&second, DownloadOutcome::is_downloaded), vec!["Episode 3"]);
    }

    #[tokio::test]
    async fn feed_policy_overrides_run_policy() {
        let dir = tempdir().unwrap();
        let syncer = syncer(
            client_for(FEED_URL, &three_episode_feed()),
            Arc::new(MemoryHistoryStore::new()),
            SyncOptions {
                first_sync: FirstSync::Last,
                ..options(&dir)
            },
        );

        let report = syncer
            .sync_feed(&feed().with_first_sync(FirstSync::LastEpisodes(2)), 0)
            .await;

        assert_eq!(
            titles(&report, DownloadOutcome::is_downloaded),
            vec!["Episode 3", "Episode 2"]
        );
    }

    #[tokio::test]
    async fn feed_limit_paces_but_does_not_pass_over() {
        let dir = tempdir().unwrap();
        let history = Arc::new(MemoryHistoryStore::new());
        let syncer = syncer(
            client_for(FEED_URL, &three_episode_feed()),
            history.clone(),
            options(&dir),
        );
        let limited = feed().with_limit(Some(1));

        assert_eq!(syncer.sync_feed(&limited, 0).await.downloaded(), 1);
        assert!(history.list_passed_over(&feed().id()).await.unwrap().is_empty());
        assert_eq!(
            titles(&syncer.sync_feed(&limited, 0).await, DownloadOutcome::is_downloaded),
            vec!["Episode 2"]
        );
    }

    #[tokio::test]
    async fn first_sync_by_age_keeps_recent_and_undated_episodes() {
        let dir = tempdir().unwrap();
        let feed_xml = dated_rss_feed(
            "Test Podcast",
            &[
                ("Episode 3", "ep3", "https://example.com/ep3.mp3", 2),
                ("Episode 2", "ep2", "https://example.com/ep2.mp3", 30),
            ],
        );
        let client = client_for(FEED_URL, &feed_xml);
        let syncer = syncer(
            client,
            Arc::new(MemoryHistoryStore::new()),
            SyncOptions {
                first_sync: FirstSync::FromDays(10),
                ..options(&dir)
            },
        );

        let report = syncer.sync_feed(&feed(), 0).await;

        assert_eq!(titles(&report, DownloadOutcome::is_downloaded), vec!["Episode 3"]);
    }

    #[tokio::test]
    async fn dry_run_first_sync_remembers_nothing() {
        let dir = tempdir().unwrap();
        let history = Arc::new(MemoryHistoryStore::new());
        let syncer = syncer(
            client_for(FEED_URL, &three_episode_feed()),
            history.clone(),
            SyncOptions {
                first_sync: FirstSync::Last,
                dry_run: true,
                ..options(&dir)
            },
        );

        let report = syncer.sync_feed(&feed(), 0).await;

        assert_eq!(report.skipped(), 1);
        assert!(history.list_passed_over(&feed().id()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn passed_over_write_failure_aborts_feed() {
        let dir = tempdir().unwrap();
        let syncer = syncer(
            client_for(FEED_URL, &three_episode_feed()),
            Arc::new(BrokenHistoryStore { fail_reads: false }),
            SyncOptions {
                first_sync: FirstSync::Last,
                ..options(&dir)
            },
        );

        let report = syncer.sync_feed(&feed(), 0).await;

        assert_eq!(report.state, FeedState::Aborted);
        assert!(matches!(report.feed_error(), Some(SyncError::History(_))));
        assert_eq!(
            titles(&report, |o| matches!(
                o.result,
                OutcomeResult::Skipped(SkipReason::FeedAborted)
            )),
            vec!["Episode 3"]
        );
        assert_eq!(report.downloaded(), 0);
    }

    #[tokio::test]
    async fn syncer_accepts_trait_object_history() {
        let dir = tempdir().unwrap();
        let history: Arc<dyn HistoryStore> = Arc::new(MemoryHistoryStore::new());
        let syncer: Syncer<MockHttpClient, dyn HistoryStore> = Syncer::new(
            Arc::new(client_for(FEED_URL, &three_episode_feed())),
            history,
            NoopReporter::shared(),
            options(&dir),
        );

        assert_eq!(syncer.sync_feed(&feed(), 0).await.downloaded(), 3);
    }
}
