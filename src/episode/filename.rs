// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::format::{Item, StrftimeItems};
use sha2::{Digest, Sha256};

use crate::error::TemplateError;
use crate::feed::{Enclosure, Episode};

/// Maximum length for the title portion of a filename
const MAX_TITLE_LENGTH: usize = 100;

/// Most filesystems cap a single path component at 255 bytes
pub const MAX_FILE_NAME_BYTES: usize = 255;

/// Default naming: "YYYY-MM-DD-sanitized-title.ext"
pub const DEFAULT_TEMPLATE: &str = "%publish_date:$Y-$m-$d%-%title%.%file_extension%";

/// Date format behind the bare `%publish_date%` placeholder
const COMPACT_DATE_FORMAT: &str = "%Y%m%d";

const UNDATED: &str = "undated";

/// Check if a character is allowed in filenames (whitelist approach)
fn is_valid_filename_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ')
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Title,
    FileName,
    Extension,
    PublishDate(String),
}

/// A parsed file name template.
///
/// Placeholders:
/// - `%title%`: episode title, sanitized
/// - `%file_name%`: last path segment of the enclosure URL, lowercased, without extension
/// - `%file_extension%`: media extension hint
/// - `%publish_date%`: publish date as `YYYYMMDD`
/// - `%publish_date:FORMAT%`: publish date in a chrono format where `$` stands for `%`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl Default for FilenameTemplate {
    fn default() -> Self {
        Self {
            source: DEFAULT_TEMPLATE.to_string(),
            segments: vec![
                Segment::PublishDate("%Y-%m-%d".to_string()),
                Segment::Literal("-".to_string()),
                Segment::Title,
                Segment::Literal(".".to_string()),
                Segment::Extension,
            ],
        }
    }
}

impl FilenameTemplate {
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = template;

        while let Some(start) = rest.find('%') {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }

            let after = &rest[start + 1..];
            let end = after.find('%').ok_or_else(|| TemplateError::Unterminated {
                template: template.to_string(),
            })?;

            segments.push(parse_placeholder(&after[..end])?);
            rest = &after[end + 1..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Render the file name for an episode, safe to join onto a directory
    pub fn render(&self, episode: &Episode) -> String {
        let rendered: String = self
            .segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => text.clone(),
                Segment::Title => {
                    let title = sanitize_title(&episode.title);
                    if title.is_empty() {
                        "untitled".to_string()
                    } else {
                        title
                    }
                }
                Segment::FileName => url_file_stem(&episode.enclosure),
                Segment::Extension => episode.extension.clone(),
                Segment::PublishDate(format) => episode
                    .pub_date
                    .map(|dt| dt.format(format).to_string())
                    .unwrap_or_else(|| UNDATED.to_string()),
            })
            .collect();

        let limited = limit_file_name(MAX_FILE_NAME_BYTES, rendered.trim());
        sanitize_filename::sanitize(limited)
    }
}

fn parse_placeholder(token: &str) -> Result<Segment, TemplateError> {
    match token {
        "title" => Ok(Segment::Title),
        "file_name" => Ok(Segment::FileName),
        "file_extension" => Ok(Segment::Extension),
        "publish_date" => Ok(Segment::PublishDate(COMPACT_DATE_FORMAT.to_string())),
        _ => match token.strip_prefix("publish_date:") {
            Some(format) => {
                let format = format.replace('$', "%");
                validate_date_format(&format)?;
                Ok(Segment::PublishDate(format))
            }
            None => Err(TemplateError::UnknownPlaceholder {
                name: token.to_string(),
            }),
        },
    }
}

/// Reject formats chrono cannot render; formatting them would panic later
fn validate_date_format(format: &str) -> Result<(), TemplateError> {
    let invalid =
        format.is_empty() || StrftimeItems::new(format).any(|item| matches!(item, Item::Error));

    if invalid {
        Err(TemplateError::InvalidDateFormat {
            format: format.to_string(),
        })
    } else {
        Ok(())
    }
}

/// Last URL path segment, lowercased, with its extension removed
fn url_file_stem(enclosure: &Enclosure) -> String {
    let name = enclosure
        .url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("")
        .to_lowercase();

    let stem = match name.rfind('.') {
        Some(pos) if pos > 0 => &name[..pos],
        _ => name.as_str(),
    };

    if stem.is_empty() {
        "episode".to_string()
    } else {
        stem.to_string()
    }
}

/// Get the media file extension for an enclosure
///
/// Attempts to extract from URL path or MIME type, defaults to "mp3"
pub fn media_extension(enclosure: &Enclosure) -> String {
    // Try to get extension from URL path
    if let Some(ext) = enclosure
        .url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|filename| filename.rsplit_once('.').map(|(_, ext)| ext))
        .filter(|ext| is_valid_media_extension(ext))
    {
        return ext.to_lowercase();
    }

    // Try to get extension from MIME type
    if let Some(ref mime) = enclosure.mime_type
        && let Some(ext) = mime_to_extension(mime)
    {
        return ext.to_string();
    }

    "mp3".to_string()
}

/// Trim a file name to `max_bytes`, keeping the extension intact
pub fn limit_file_name(max_bytes: usize, file_name: &str) -> String {
    if file_name.len() <= max_bytes {
        return file_name.to_string();
    }

    let (stem, extension) = match file_name.rfind('.') {
        Some(pos) if file_name.len() - pos < max_bytes => file_name.split_at(pos),
        _ => (file_name, ""),
    };

    let mut end = max_bytes - extension.len();
    while !stem.is_char_boundary(end) {
        end -= 1;
    }

    format!("{}{}", &stem[..end], extension)
}

/// Give `file_name` a suffix derived from `episode_id`, before the extension
///
/// Two episodes whose names render identically get distinct names this way,
/// and the same episode always gets the same one.
pub fn disambiguate(file_name: &str, episode_id: &str) -> String {
    let digest = Sha256::digest(episode_id.as_bytes());
    let tag: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();

    let (stem, extension) = match file_name.rfind('.') {
        Some(pos) if pos > 0 => file_name.split_at(pos),
        _ => (file_name, ""),
    };

    let suffix = format!("-{tag}{extension}");
    let mut end = stem.len().min(MAX_FILE_NAME_BYTES.saturating_sub(suffix.len()));
    while !stem.is_char_boundary(end) {
        end -= 1;
    }

    format!("{}{}", &stem[..end], suffix)
}

/// Sanitize a title for use in a filename using whitelist approach
fn sanitize_title(title: &str) -> String {
    let sanitized: String = title
        .chars()
        .map(|c| if is_valid_filename_char(c) { c } else { '-' })
        .collect();

    // Collapse multiple spaces/dashes into single dash
    let collapsed = collapse_separators(&sanitized);

    let trimmed = collapsed.trim_matches(|c: char| c == '-' || c == '.' || c.is_whitespace());

    if trimmed.len() > MAX_TITLE_LENGTH {
        truncate_at_boundary(trimmed, MAX_TITLE_LENGTH)
    } else {
        trimmed.to_string()
    }
}

/// Collapse multiple spaces and dashes into single dashes
fn collapse_separators(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut last_was_separator = false;

    for c in s.chars() {
        if c == '-' || c.is_whitespace() {
            if !last_was_separator {
                result.push('-');
                last_was_separator = true;
            }
        } else {
            result.push(c);
            last_was_separator = false;
        }
    }

    result
}

/// Truncate string at a word boundary
fn truncate_at_boundary(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }

    // Only ASCII survives sanitization, so byte and char offsets agree
    let truncated: String = s.chars().take(max_len).collect();
    if let Some(pos) = truncated.rfind('-')
        && pos > max_len / 2
    {
        return truncated[..pos].to_string();
    }

    truncated.trim_end_matches('-').to_string()
}

/// Check if a string is a known media file extension
fn is_valid_media_extension(ext: &str) -> bool {
    matches!(
        ext.to_lowercase().as_str(),
        "mp3" | "m4a" | "m4b" | "mp4" | "m4v" | "aac" | "ogg" | "oga" | "opus" | "wav" | "flac"
    )
}

/// Map MIME types to file extensions
fn mime_to_extension(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next().unwrap_or("").trim().to_lowercase();
    match essence.as_str() {
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Some("m4a"),
        "audio/x-m4b" => Some("m4b"),
        "video/mp4" => Some("mp4"),
        "video/x-m4v" => Some("m4v"),
        "audio/aac" => Some("aac"),
        "audio/ogg" => Some("ogg"),
        "audio/opus" => Some("opus"),
        "audio/wav" | "audio/x-wav" => Some("wav"),
        "audio/flac" | "audio/x-flac" => Some("flac"),
        _ => None,
    }
}
