// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use colored::Colorize;
use console::Emoji;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use podsync::{
    Config, JsonHistoryStore, NoopReporter, OutcomeResult, ProgressEvent, ProgressReporter,
    ReqwestClient, RunReport, SharedProgressReporter, Syncer, advance_last_run, read_opml,
};

// Emoji with fallback for terminals without Unicode support
static MICROPHONE: Emoji<'_, '_> = Emoji("🎙️  ", "");
static SEARCH: Emoji<'_, '_> = Emoji("🔍 ", "[~] ");
static HEADPHONES: Emoji<'_, '_> = Emoji("🎧 ", "[i] ");
static DOWNLOAD: Emoji<'_, '_> = Emoji("📥 ", "[v] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static BROOM: Emoji<'_, '_> = Emoji("🧹 ", "[-] ");
static PARTY: Emoji<'_, '_> = Emoji("🎉 ", "[*] ");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "x ");
static SKIP: Emoji<'_, '_> = Emoji("⏭  ", "- ");

/// Download new podcast episodes, remembering what was already fetched
#[derive(Parser, Debug)]
#[command(name = "podsync")]
#[command(about = "Download new podcast episodes, remembering what was already fetched")]
#[command(version)]
struct Args {
    /// Feed URL or path to a local feed file (instead of the configured podcasts)
    #[arg(requires = "output_dir")]
    feed: Option<String>,

    /// Output directory for episodes of FEED
    output_dir: Option<PathBuf>,

    /// Configuration file [default: <config dir>/podsync/config.json]
    #[arg(long)]
    config: Option<PathBuf>,

    /// Download history file [default: <data dir>/podsync/history.json]
    #[arg(long)]
    history: Option<PathBuf>,

    /// Maximum number of feeds synced at once
    #[arg(short = 'c', long)]
    concurrent: Option<usize>,

    /// Maximum number of new episodes per feed
    #[arg(short, long)]
    limit: Option<usize>,

    /// Maximum number of episodes downloaded in this run
    #[arg(long)]
    downloads_limit: Option<usize>,

    /// Seconds to wait between downloads
    #[arg(long)]
    delay: Option<u64>,

    /// Attempts per episode before giving up for this run
    #[arg(long)]
    attempts: Option<u32>,

    /// What a feed's first sync downloads, e.g. download_last_3_episodes
    #[arg(long, value_name = "POLICY")]
    first_sync: Option<String>,

    /// Add the podcasts of an OPML file to the configuration, print it and exit
    #[arg(long, value_name = "FILE", conflicts_with = "feed")]
    import_opml: Option<PathBuf>,

    /// Show what would be downloaded without downloading
    #[arg(long)]
    dry_run: bool,

    /// Also list episodes that were skipped
    #[arg(long)]
    report_skipped: bool,

    /// Quiet mode - suppress progress output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Log debug details to stderr
    #[arg(short, long)]
    verbose: bool,
}

/// Progress reporter using indicatif for terminal output
struct IndicatifReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<usize, ProgressBar>>,
    main_bar: ProgressBar,
}

impl IndicatifReporter {
    fn new() -> Self {
        let multi = MultiProgress::new();

        let main_style = ProgressStyle::default_bar()
            .template("{spinner:.green} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());

        let main_bar = multi.add(ProgressBar::new_spinner());
        main_bar.set_style(main_style);
        main_bar.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            multi,
            bars: Mutex::new(HashMap::new()),
            main_bar,
        }
    }

    fn get_or_create_bar(&self, slot: usize) -> ProgressBar {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bar) = bars.get(&slot) {
            return bar.clone();
        }

        let style = ProgressStyle::default_bar()
            .template(&format!(
                "  {DOWNLOAD}[{{bar:30.cyan/blue}}] {{bytes}}/{{total_bytes}} {{wide_msg}}"
            ))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░");

        let bar = self.multi.add(ProgressBar::new(0));
        bar.set_style(style);
        bars.insert(slot, bar.clone());
        bar
    }

    fn finish_bar(&self, slot: usize) {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bar) = bars.remove(&slot) {
            bar.finish_and_clear();
        }
    }

    fn println(&self, line: String) {
        let _ = self.multi.println(line);
    }
}

impl ProgressReporter for IndicatifReporter {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::FetchingFeed { feed_name, url, .. } => {
                self.main_bar.set_message(format!(
                    "{SEARCH}Fetching {}: {}",
                    feed_name.bold(),
                    url.cyan()
                ));
            }

            ProgressEvent::FeedParsed {
                feed_name,
                total_episodes,
                new_episodes,
                to_download,
                ..
            } => {
                self.println(format!(
                    "{HEADPHONES}{} • {} episodes total, {} new, {} to download",
                    feed_name.bold().green(),
                    total_episodes.to_string().cyan(),
                    new_episodes.to_string().yellow(),
                    to_download.to_string().yellow()
                ));
            }

            ProgressEvent::FeedFailed {
                feed_name, error, ..
            } => {
                self.println(format!("{FAILURE}{} - {}", feed_name.red().bold(), error.red()));
            }

            ProgressEvent::PartialFilesCleanedUp { feed_name, count } => {
                self.println(format!(
                    "{BROOM}{}: removed {} unfinished download(s)",
                    feed_name,
                    count.to_string().yellow()
                ));
            }

            ProgressEvent::DownloadStarting {
                slot,
                episode_title,
                episode_index,
                total_to_download,
                content_length,
            } => {
                let bar = self.get_or_create_bar(slot);
                bar.set_length(content_length.unwrap_or(0));
                bar.set_position(0);
                bar.set_message(format!(
                    "[{}/{}] {}",
                    (episode_index + 1).to_string().cyan(),
                    total_to_download.to_string().cyan(),
                    truncate_title(&episode_title, 40)
                ));
            }

            ProgressEvent::DownloadProgress {
                slot,
                bytes_downloaded,
                total_bytes,
                ..
            } => {
                let bar = self.get_or_create_bar(slot);
                if let Some(total) = total_bytes {
                    bar.set_length(total);
                }
                bar.set_position(bytes_downloaded);
            }

            ProgressEvent::Finalizing {
                slot,
                episode_title,
            } => {
                let bar = self.get_or_create_bar(slot);
                bar.set_message(format!("Finalizing {}", truncate_title(&episode_title, 40)));
            }

            ProgressEvent::DownloadCompleted {
                slot,
                episode_title,
                bytes_downloaded,
            } => {
                let bar = self.get_or_create_bar(slot);
                bar.set_position(bytes_downloaded);
                self.finish_bar(slot);
                self.println(format!(
                    "  {SUCCESS}{}",
                    truncate_title(&episode_title, 60).green()
                ));
            }

            ProgressEvent::DownloadFailed {
                slot,
                episode_title,
                error,
            } => {
                self.finish_bar(slot);
                self.println(format!(
                    "  {FAILURE}{} - {}",
                    truncate_title(&episode_title, 30).red(),
                    error.red()
                ));
            }

            ProgressEvent::FeedCompleted {
                slot,
                feed_name,
                downloaded,
                failed,
                ..
            } => {
                self.finish_bar(slot);
                if downloaded > 0 || failed > 0 {
                    self.println(format!(
                        "{} {} downloaded, {} failed",
                        format!("{feed_name}:").bold(),
                        downloaded.to_string().green(),
                        failed.to_string().red()
                    ));
                }
            }

            ProgressEvent::SyncCompleted {
                downloaded_count,
                skipped_count,
                failed_count,
            } => {
                self.main_bar.finish_and_clear();
                println!(
                    "\n{PARTY}{} {} downloaded, {} skipped, {} failed",
                    "Sync complete:".bold().green(),
                    downloaded_count.to_string().green().bold(),
                    skipped_count.to_string().yellow(),
                    if failed_count > 0 {
                        failed_count.to_string().red().bold()
                    } else {
                        failed_count.to_string().green()
                    }
                );
            }
        }
    }
}

fn truncate_title(title: &str, max_len: usize) -> String {
    if title.chars().count() <= max_len {
        title.to_string()
    } else {
        let kept: String = title.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

/// Send library logs to stderr; RUST_LOG overrides the flags
fn init_logging(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,podsync={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Load the configuration file and apply command-line overrides
fn resolve_config(args: &Args) -> Result<Config> {
    let mut config = match (&args.config, &args.feed) {
        (Some(path), _) => Config::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        (None, Some(_)) => Config::default(),
        (None, None) => {
            let path = Config::default_path().context("Unable to resolve config directory")?;
            Config::load(&path)
                .with_context(|| format!("Failed to load configuration {}", path.display()))?
        }
    };

    if let (Some(feed), Some(output_dir)) = (&args.feed, &args.output_dir) {
        config.podcasts = Config::for_feed(feed, output_dir.clone()).podcasts;
    }

    if let Some(concurrent) = args.concurrent {
        config.max_concurrent_feeds = concurrent;
    }
    if let Some(limit) = args.limit {
        for podcast in &mut config.podcasts {
            podcast.limit = Some(limit);
        }
    }
    if args.downloads_limit.is_some() {
        config.downloads_limit = args.downloads_limit;
    }
    if let Some(delay) = args.delay {
        config.download_delay = delay;
    }
    if let Some(attempts) = args.attempts {
        config.max_attempts = attempts;
    }
    if let Some(history) = &args.history {
        config.history_file = Some(history.clone());
    }
    if let Some(first_sync) = &args.first_sync {
        config.first_sync = first_sync.clone();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Merge an OPML export into the configuration and print the result as JSON
fn import_opml(args: &Args, opml_path: &Path) -> Result<()> {
    let mut config = match &args.config {
        Some(path) if path.exists() => Config::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        _ => Config::default(),
    };

    let podcasts = read_opml(opml_path)
        .with_context(|| format!("Failed to import {}", opml_path.display()))?;
    let found = podcasts.len();
    let added = config.merge_podcasts(podcasts);

    println!("{}", serde_json::to_string_pretty(&config)?);
    if !args.quiet {
        eprintln!(
            "{SUCCESS}{} of {} podcasts added",
            added.to_string().green(),
            found
        );
    }

    Ok(())
}

/// Print failures (always) and skipped episodes (on request)
fn print_outcomes(report: &RunReport, report_skipped: bool) {
    if report.has_failures() {
        eprintln!("\n{}", "Failures:".red().bold());
    }

    for feed in &report.feeds {
        for outcome in &feed.outcomes {
            let title = outcome
                .episode
                .as_ref()
                .map(|e| e.title.as_str())
                .unwrap_or("(feed)");

            match &outcome.result {
                OutcomeResult::Failed(error) => eprintln!(
                    "  {}{} / {} - {}",
                    CROSS,
                    feed.feed_name.bold(),
                    title.yellow(),
                    error.to_string().dimmed()
                ),
                OutcomeResult::Skipped(reason) if report_skipped => println!(
                    "  {}{} / {} ({})",
                    SKIP,
                    feed.feed_name,
                    title,
                    reason.to_string().dimmed()
                ),
                _ => {}
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Some(opml_path) = &args.import_opml {
        return import_opml(&args, opml_path);
    }

    let config = resolve_config(&args)?;

    if !args.quiet {
        println!(
            "\n{}{} {}\n",
            MICROPHONE,
            "podsync".bold().magenta(),
            "- Podcast Synchronizer".dimmed()
        );
    }

    let feeds = config.feeds()?;
    let mut options = config.sync_options()?;
    options.dry_run = args.dry_run;
    options.report_skipped = args.report_skipped;

    if let Some(marker) = config.last_run_marker() {
        let last_run = advance_last_run(&marker, Utc::now(), args.dry_run)
            .await
            .with_context(|| format!("Failed to update last run marker {}", marker.display()))?;
        options.last_run = Some(last_run);
    }

    let client =
        ReqwestClient::with_settings(&config.http_settings()).context("Failed to build HTTP client")?;

    let history_path = config
        .history_path()
        .context("Unable to resolve data directory for the history file")?;
    let history = JsonHistoryStore::open(&history_path)
        .await
        .with_context(|| format!("Failed to open history {}", history_path.display()))?;
    tracing::debug!(path = %history_path.display(), "using history file");

    let reporter: SharedProgressReporter = if args.quiet {
        NoopReporter::shared()
    } else {
        Arc::new(IndicatifReporter::new())
    };

    let syncer = Arc::new(Syncer::new(
        Arc::new(client),
        Arc::new(history),
        reporter,
        options,
    ));

    let report = syncer.sync_all(feeds).await;

    print_outcomes(&report, args.report_skipped && !args.quiet);

    if report.has_failures() {
        std::process::exit(1);
    }

    Ok(())
}
