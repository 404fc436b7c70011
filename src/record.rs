//! Normalized extraction results and the storage keys derived from them.
//!
//! A [`Record`] pairs the link identifying a feed entry with the URL of its
//! playable media. Its [`Key`] is the relative path under which the delivery
//! store persists it, derived from the link alone.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

/// Metadata field names reserved for the record's own attributes.
const RESERVED_FIELDS: [&str; 2] = ["link", "url"];

/// Errors raised while building a record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// The link cannot be turned into a safe storage key.
    #[error("invalid link '{link}': {reason}")]
    InvalidLink { link: String, reason: String },

    /// The media URL is not an absolute URL.
    #[error("invalid media url '{url}': {reason}")]
    InvalidMediaUrl { url: String, reason: String },
}

fn invalid_link(link: &str, reason: impl Into<String>) -> RecordError {
    RecordError::InvalidLink {
        link: link.to_string(),
        reason: reason.into(),
    }
}

/// Relative, traversal-free storage path derived from a record's link.
///
/// Segments are separated by `/` regardless of platform and never contain
/// `.` or `..`, empty segments, NUL or backslash characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(String);

impl Key {
    /// Builds a key from an already relative path such as `show/ep1`.
    ///
    /// Leading and trailing separators are stripped and empty segments
    /// collapsed.
    pub fn parse(raw: &str) -> Result<Self, RecordError> {
        Self::from_relative(raw, raw)
    }

    fn from_relative(raw: &str, context: &str) -> Result<Self, RecordError> {
        let mut segments = Vec::new();
        for segment in raw.split('/').filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." {
                return Err(invalid_link(context, "path traversal segment"));
            }
            if segment.contains('\0') || segment.contains('\\') {
                return Err(invalid_link(context, "forbidden character in path"));
            }
            segments.push(segment);
        }

        if segments.is_empty() {
            return Err(invalid_link(context, "no path left after removing scheme and host"));
        }

        Ok(Self(segments.join("/")))
    }

    /// Rebuilds a key from a path relative to a store root.
    pub(crate) fn from_path(relative: &Path) -> Result<Self, RecordError> {
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                std::path::Component::Normal(part) => match part.to_str() {
                    Some(part) => parts.push(part),
                    None => {
                        return Err(invalid_link(
                            &relative.display().to_string(),
                            "path is not valid UTF-8",
                        ))
                    }
                },
                _ => {
                    return Err(invalid_link(
                        &relative.display().to_string(),
                        "path is not a plain relative path",
                    ))
                }
            }
        }
        Self::parse(&parts.join("/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Platform path of this key, to be joined onto a store root.
    pub fn to_path(&self) -> PathBuf {
        self.0.split('/').collect()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the storage key for a link.
///
/// The scheme and network location are dropped; path, query and fragment
/// are kept, so `http://example.com/show/ep1?fmt=mp3` becomes
/// `show/ep1?fmt=mp3`.
///
/// # Errors
///
/// Returns [`RecordError::InvalidLink`] if the link is not an absolute URL,
/// has no path left once the host is removed, or would escape the store
/// root.
///
/// # Examples
///
/// ```
/// use streamr::record::make_key;
///
/// let key = make_key("https://example.com/show/ep1/").unwrap();
/// assert_eq!(key.as_str(), "show/ep1");
/// assert!(make_key("not a url").is_err());
/// ```
pub fn make_key(link: &str) -> Result<Key, RecordError> {
    let parsed = Url::parse(link).map_err(|e| invalid_link(link, e.to_string()))?;
    if parsed.cannot_be_a_base() {
        return Err(invalid_link(link, "URL has no hierarchical path"));
    }

    // Everything after the authority: path, then query and fragment as-is.
    let tail = &parsed[url::Position::BeforePath..];
    Key::from_relative(tail, link)
}

/// An immutable link / media-URL pair with its derived storage key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    link: String,
    url: String,
    key: Key,
    meta: BTreeMap<String, String>,
}

impl Record {
    /// Creates a record, deriving its key from `link`.
    ///
    /// Both URLs are kept in their parsed, serialized form, which never
    /// contains whitespace; tabs and newlines in the input are dropped.
    ///
    /// # Errors
    ///
    /// - [`RecordError::InvalidLink`] if no safe key can be derived
    /// - [`RecordError::InvalidMediaUrl`] if `url` is not an absolute URL
    pub fn new(link: impl AsRef<str>, url: impl AsRef<str>) -> Result<Self, RecordError> {
        let link = link.as_ref();
        let url = url.as_ref();
        let key = make_key(link)?;
        let link = Url::parse(link).map_err(|e| invalid_link(link, e.to_string()))?;
        let url = Url::parse(url).map_err(|e| RecordError::InvalidMediaUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            link: link.into(),
            url: url.into(),
            key,
            meta: BTreeMap::new(),
        })
    }

    /// Reassembles a record read back from the store.
    pub(crate) fn from_stored(
        key: Key,
        link: String,
        url: String,
        meta: BTreeMap<String, String>,
    ) -> Self {
        Self {
            link,
            url,
            key,
            meta,
        }
    }

    /// Attaches a metadata field. Newlines in the value are flattened to
    /// spaces; empty values and the reserved `link`/`url` names are ignored.
    pub fn with_meta(mut self, field: &str, value: &str) -> Self {
        let field = field.trim();
        let value = value.split_whitespace().collect::<Vec<_>>().join(" ");
        if field.is_empty()
            || field.contains(char::is_whitespace)
            || RESERVED_FIELDS.contains(&field)
            || value.is_empty()
        {
            return self;
        }
        self.meta.insert(field.to_string(), value);
        self
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn meta(&self) -> &BTreeMap<String, String> {
        &self.meta
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key.as_str())
    }
}
