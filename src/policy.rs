// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! What to take from a feed that has no download history yet.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc, Weekday};

use crate::diff::Window;
use crate::error::ConfigError;

/// Policy applied on a feed's first sync, when none of its episodes is recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirstSync {
    /// Only the newest episode
    #[default]
    Last,
    /// Everything the feed lists
    All,
    /// The newest `n` episodes
    LastEpisodes(usize),
    /// Episodes published in the last `n` days
    FromDays(u32),
    /// Episodes published since the latest past occurrence of a weekday
    FromWeekday(Weekday),
    /// Episodes published since the latest past occurrence of a day of the month
    FromDayOfMonth(u32),
    /// Episodes published since the previous run
    SinceLastRun,
}

impl FirstSync {
    /// The window this policy opens, relative to `today`
    ///
    /// Without a recorded previous run, `SinceLastRun` starts today.
    pub fn window(&self, today: NaiveDate, last_run: Option<DateTime<Utc>>) -> Window {
        match *self {
            FirstSync::Last => Window::limit(Some(1)),
            FirstSync::All => Window::default(),
            FirstSync::LastEpisodes(n) => Window::limit(Some(n)),
            FirstSync::FromDays(days) => since(
                today
                    .checked_sub_days(Days::new(u64::from(days)))
                    .unwrap_or(NaiveDate::MIN),
            ),
            FirstSync::FromWeekday(weekday) => since(last_weekday(today, weekday)),
            FirstSync::FromDayOfMonth(day) => since(last_day_of_month(today, day)),
            FirstSync::SinceLastRun => since(last_run.map_or(today, |at| at.date_naive())),
        }
    }

    pub fn needs_last_run(&self) -> bool {
        matches!(self, FirstSync::SinceLastRun)
    }
}

fn since(day: NaiveDate) -> Window {
    Window {
        limit: None,
        published_since: Some(day),
    }
}

/// Latest `weekday` strictly before `today`
fn last_weekday(today: NaiveDate, weekday: Weekday) -> NaiveDate {
    let current = today.weekday().num_days_from_monday();
    let target = weekday.num_days_from_monday();
    let days_ago = match (current + 7 - target) % 7 {
        0 => 7,
        n => n,
    };
    today - Days::new(u64::from(days_ago))
}

/// Latest `day` of a month on or before `today`, clamped to short months
fn last_day_of_month(today: NaiveDate, day: u32) -> NaiveDate {
    if today.day() >= day {
        return today.with_day(day).unwrap_or(today);
    }

    let end_of_previous = today.with_day(1).unwrap_or(today) - Days::new(1);
    end_of_previous
        .with_day(day.min(end_of_previous.day()))
        .unwrap_or(end_of_previous)
}

impl FromStr for FirstSync {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        let invalid = || ConfigError::InvalidFirstSync {
            value: value.to_string(),
        };

        match value {
            "download_last" => return Ok(FirstSync::Last),
            "download_all_from_feed" => return Ok(FirstSync::All),
            "download_since_last_run" => return Ok(FirstSync::SinceLastRun),
            _ => {}
        }

        if let Some(count) = value
            .strip_prefix("download_last_")
            .and_then(|rest| rest.strip_suffix("_episodes"))
        {
            return count.parse().map(FirstSync::LastEpisodes).map_err(|_| invalid());
        }

        if let Some(label) = value.strip_prefix("download_from_") {
            if let Some(days) = label.strip_suffix("_days") {
                return days.parse().map(FirstSync::FromDays).map_err(|_| invalid());
            }
            return parse_day_label(label).ok_or_else(invalid);
        }

        Err(invalid())
    }
}

/// `1st`, `15`, `monday`, `Fri`, ...
fn parse_day_label(label: &str) -> Option<FirstSync> {
    let lower = label.to_ascii_lowercase();
    let digits = ["st", "nd", "rd", "th"]
        .iter()
        .find_map(|suffix| lower.strip_suffix(suffix))
        .unwrap_or(&lower);

    if let Ok(day) = digits.parse::<u32>() {
        return (1..=31).contains(&day).then_some(FirstSync::FromDayOfMonth(day));
    }

    lower.parse::<Weekday>().ok().map(FirstSync::FromWeekday)
}

impl fmt::Display for FirstSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirstSync::Last => f.write_str("download_last"),
            FirstSync::All => f.write_str("download_all_from_feed"),
            FirstSync::LastEpisodes(n) => write!(f, "download_last_{n}_episodes"),
            FirstSync::FromDays(n) => write!(f, "download_from_{n}_days"),
            FirstSync::FromWeekday(weekday) => write!(f, "download_from_{weekday}"),
            FirstSync::FromDayOfMonth(day) => write!(f, "download_from_{day}"),
            FirstSync::SinceLastRun => f.write_str("download_since_last_run"),
        }
    }
}

/// Read the previous run's time from the marker at `path`, then stamp it with `now`
///
/// A missing marker counts as a run happening now. A dry run reads the
/// marker but leaves it untouched.
pub async fn advance_last_run(
    path: &Path,
    now: DateTime<Utc>,
    dry_run: bool,
) -> Result<DateTime<Utc>, ConfigError> {
    let marker_error = |e: std::io::Error| ConfigError::LastRunMarker {
        path: path.to_path_buf(),
        source: e,
    };

    let previous = match tokio::fs::read_to_string(path).await {
        Ok(content) => match DateTime::parse_from_rfc3339(content.trim()) {
            Ok(at) => at.with_timezone(&Utc),
            Err(_) => {
                // Foreign marker file: fall back to when it was last touched
                let modified = tokio::fs::metadata(path)
                    .await
                    .and_then(|m| m.modified())
                    .map_err(marker_error)?;
                DateTime::<Utc>::from(modified)
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "no last run marker yet, starting from now");
            now
        }
        Err(e) => return Err(marker_error(e)),
    };

    if !dry_run {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(marker_error)?;
        }
        tokio::fs::write(path, now.to_rfc3339())
            .await
            .map_err(marker_error)?;
    }

    tracing::info!(last_run = %previous, "previous run");
    Ok(previous)
}
