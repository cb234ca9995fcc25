// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stable episode and feed identifiers.
//!
//! History lookups are keyed by these strings, so any change to the
//! derivation re-downloads (or hides) episodes for every existing user.

use url::Url;

/// Derive an episode identifier.
///
/// A trimmed, non-empty GUID always wins. Without one the enclosure URL is
/// normalized: scheme and host lowercased, default port removed, fragment
/// dropped. The query string is kept because some hosts put the file
/// selector in it.
pub fn episode_id(guid: Option<&str>, enclosure_url: &Url) -> String {
    guid.map(str::trim)
        .filter(|g| !g.is_empty())
        .map(String::from)
        .unwrap_or_else(|| normalize_url(enclosure_url))
}

/// Canonical string form of a URL used for identity comparisons
pub fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    normalized.into()
}
