// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::error::{DownloadError, IntegrityError};
use crate::feed::Episode;
use crate::http::{HttpClient, is_success};
use crate::progress::{ProgressEvent, SharedProgressReporter};

/// Suffix of in-flight downloads
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Context for tracking a download in concurrent scenarios
#[derive(Debug, Clone)]
pub struct DownloadContext {
    /// Slot ID (0 to max_concurrent-1) for progress bar management
    pub slot: usize,
    /// Index of this episode in the download queue
    pub episode_index: usize,
    /// Total number of episodes to download
    pub total_to_download: usize,
}

/// A file that was fully written and moved into place
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub bytes: u64,
    /// `sha256:<hex>` of the file contents
    pub content_hash: String,
}

/// Path of the temporary file used while downloading to `final_path`
pub fn partial_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Removes the temporary file when dropped unless the download was committed
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed && std::fs::remove_file(&self.path).is_ok() {
            tracing::debug!(path = %self.path.display(), "removed partial download");
        }
    }
}

/// Check a finished transfer: something arrived, and it matches Content-Length when known
pub fn verify_integrity(received: u64, expected: Option<u64>) -> Result<(), IntegrityError> {
    if received == 0 {
        return Err(IntegrityError::EmptyBody);
    }

    match expected {
        Some(expected) if expected != received => {
            Err(IntegrityError::LengthMismatch { expected, received })
        }
        _ => Ok(()),
    }
}

/// Download an episode into `destination` under `file_name`
///
/// The body is streamed to `<file_name>.partial`, checked, and only then
/// renamed to its final name. If anything fails, or the future is dropped
/// midway, the partial file is removed and no final file appears.
pub async fn download_episode<C: HttpClient + ?Sized>(
    client: &C,
    episode: &Episode,
    destination: &Path,
    file_name: &str,
    context: &DownloadContext,
    reporter: &SharedProgressReporter,
) -> Result<DownloadedFile, DownloadError> {
    let url = episode.enclosure.url.as_str();
    let final_path = destination.join(file_name);
    let temp_path = partial_path(&final_path);

    let response = client
        .get_stream(url)
        .await
        .map_err(|e| DownloadError::HttpFailed {
            url: url.to_string(),
            source: e,
        })?;

    if !is_success(response.status) {
        return Err(DownloadError::HttpStatus {
            url: url.to_string(),
            status: response.status,
        });
    }

    reporter.report(ProgressEvent::DownloadStarting {
        slot: context.slot,
        episode_title: episode.title.clone(),
        episode_index: context.episode_index,
        total_to_download: context.total_to_download,
        content_length: response.content_length,
    });

    // Declared before the file so the handle is closed first on drop
    let mut guard = PartialFile::new(temp_path.clone());
    let mut file = File::create(&temp_path)
        .await
        .map_err(|e| DownloadError::FileCreateFailed {
            path: temp_path.clone(),
            source: e,
        })?;

    let mut hasher = Sha256::new();
    let mut bytes_downloaded: u64 = 0;
    let mut stream = response.body;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| DownloadError::StreamFailed {
            url: url.to_string(),
            source: e,
        })?;

        file.write_all(&chunk)
            .await
            .map_err(|e| DownloadError::FileWriteFailed {
                path: temp_path.clone(),
                source: e,
            })?;

        hasher.update(&chunk);
        bytes_downloaded += chunk.len() as u64;

        reporter.report(ProgressEvent::DownloadProgress {
            slot: context.slot,
            episode_title: episode.title.clone(),
            bytes_downloaded,
            total_bytes: response.content_length,
        });
    }

    file.flush()
        .await
        .map_err(|e| DownloadError::FileWriteFailed {
            path: temp_path.clone(),
            source: e,
        })?;
    file.sync_all()
        .await
        .map_err(|e| DownloadError::FileWriteFailed {
            path: temp_path.clone(),
            source: e,
        })?;
    drop(file);

    verify_integrity(bytes_downloaded, response.content_length).map_err(|e| {
        DownloadError::Integrity {
            url: url.to_string(),
            source: e,
        }
    })?;

    reporter.report(ProgressEvent::Finalizing {
        slot: context.slot,
        episode_title: episode.title.clone(),
    });

    tokio::fs::rename(&temp_path, &final_path)
        .await
        .map_err(|e| DownloadError::RenameFailed {
            from: temp_path.clone(),
            to: final_path.clone(),
            source: e,
        })?;
    guard.disarm();

    // The rename is only durable once the directory entry is on disk
    if let Err(e) = sync_directory(destination).await {
        let _ = tokio::fs::remove_file(&final_path).await;
        return Err(DownloadError::FileWriteFailed {
            path: destination.to_path_buf(),
            source: e,
        });
    }

    reporter.report(ProgressEvent::DownloadCompleted {
        slot: context.slot,
        episode_title: episode.title.clone(),
        bytes_downloaded,
    });

    Ok(DownloadedFile {
        path: final_path,
        bytes: bytes_downloaded,
        content_hash: format!("sha256:{:x}", hasher.finalize()),
    })
}

/// Flush a directory's entries to disk, making earlier renames in it durable
#[cfg(unix)]
pub async fn sync_directory(dir: &Path) -> std::io::Result<()> {
    File::open(dir).await?.sync_all().await
}

/// Directories cannot be opened for syncing here; renames are left to the OS
#[cfg(not(unix))]
pub async fn sync_directory(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Create the destination directory if needed
pub async fn prepare_directory(dir: &Path) -> Result<(), DownloadError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| DownloadError::CreateDirectoryFailed {
            path: dir.to_path_buf(),
            source: e,
        })
}

/// Remove `.partial` files left behind by interrupted runs
///
/// Returns the number of files removed. A missing directory counts as clean.
pub async fn clean_partial_files(dir: &Path) -> Result<usize, DownloadError> {
    let read_error = |e: std::io::Error| DownloadError::ReadDirectoryFailed {
        path: dir.to_path_buf(),
        source: e,
    };

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(read_error(e)),
    };

    let mut cleaned = 0;
    while let Some(entry) = entries.next_entry().await.map_err(read_error)? {
        let path = entry.path();
        let is_partial = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(PARTIAL_SUFFIX));

        if is_partial && tokio::fs::remove_file(&path).await.is_ok() {
            cleaned += 1;
        }
    }

    Ok(cleaned)
}
