//! Streaming extractors that turn a feed document into [`Record`]s.
//!
//! Each extractor reads its source forward-only and yields records as soon
//! as a feed entry is complete, so memory use is bounded by the size of one
//! entry rather than the whole document:
//!
//! - [`Extractor::Rss`] - `<item>` blocks with a `<link>` and an `<enclosure url>`
//! - [`Extractor::EmbeddedJson`] - HTML pages pushing JSON track objects from a script
//! - [`Extractor::Curated`] - `<item>` blocks filtered by title, with the media
//!   link taken from `content:encoded`
//!
//! Variants are compiled in only when the cargo feature providing their
//! parser is enabled. Every iterator stops for good after its first error
//! and never yields a record for an entry left open at end of stream.

#[cfg(feature = "rss")]
mod curated;
#[cfg(feature = "embedded-json")]
mod embedded;
#[cfg(feature = "rss")]
mod rss;
#[cfg(feature = "rss")]
mod xml;

use std::io::BufRead;
use thiserror::Error;
use url::Url;

use crate::record::{Record, RecordError};

#[cfg(feature = "rss")]
pub use curated::CuratedFilter;

/// Lazy sequence of extraction results.
pub type Records<'a> = Box<dyn Iterator<Item = Result<Record, ExtractError>> + Send + 'a>;

/// Errors that end an extraction.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// A feed entry carried a link or media URL no record can be built from.
    #[error(transparent)]
    Record(#[from] RecordError),

    /// The document is not well-formed XML.
    #[error("XML parse error: {0}")]
    Xml(String),

    /// An embedded track payload could not be decoded.
    #[cfg(feature = "embedded-json")]
    #[error("invalid JSON payload on line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Reading the underlying stream failed.
    #[error("failed to read feed: {0}")]
    Io(#[from] std::io::Error),
}

/// A feed flavor and the parser strategy that goes with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extractor {
    #[cfg(feature = "rss")]
    Rss,
    #[cfg(feature = "embedded-json")]
    EmbeddedJson,
    #[cfg(feature = "rss")]
    Curated(CuratedFilter),
}

impl Extractor {
    /// Canonical selector name of this extractor.
    pub fn name(&self) -> &'static str {
        match *self {
            #[cfg(feature = "rss")]
            Extractor::Rss => "rss",
            #[cfg(feature = "embedded-json")]
            Extractor::EmbeddedJson => "embedded-json",
            #[cfg(feature = "rss")]
            Extractor::Curated(_) => "curated",
        }
    }

    /// Starts extracting records from `source`.
    ///
    /// `origin` is the URL the document was actually served from (after
    /// redirects); relative references are resolved against it.
    ///
    /// Nothing is read until the returned iterator is polled.
    #[cfg_attr(not(feature = "embedded-json"), allow(unused_variables))]
    pub fn records<'a, R>(&self, source: R, origin: &Url) -> Records<'a>
    where
        R: BufRead + Send + 'a,
    {
        match *self {
            #[cfg(feature = "rss")]
            Extractor::Rss => Box::new(rss::RssRecords::new(source)),
            #[cfg(feature = "embedded-json")]
            Extractor::EmbeddedJson => {
                Box::new(embedded::EmbeddedRecords::new(source, origin.clone()))
            }
            #[cfg(feature = "rss")]
            Extractor::Curated(ref filter) => {
                Box::new(curated::CuratedRecords::new(source, filter.clone()))
            }
        }
    }
}
