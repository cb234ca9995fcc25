// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod download;
mod filename;

pub use download::{
    DownloadContext, DownloadedFile, PARTIAL_SUFFIX, clean_partial_files, download_episode,
    partial_path, prepare_directory, sync_directory, verify_integrity,
};
pub use filename::{
    DEFAULT_TEMPLATE, FilenameTemplate, MAX_FILE_NAME_BYTES, disambiguate, limit_file_name,
    media_extension,
};
