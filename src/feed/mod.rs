//! Feed dispatch: from a `selector+url` feed URL to a stream of records.
//!
//! - [`registry`] - selector name → [`Extractor`], built once at start-up
//! - [`fetcher`] - HTTP fetch with retry on 429/5xx, body exposed as a blocking reader
//!
//! # Example
//!
//! ```ignore
//! let dispatcher = Dispatcher::new(&config)?;
//! let extraction = dispatcher.dispatch("rss+https://example.com/feed.xml").await?;
//! let report = tokio::task::spawn_blocking(move || ingest(&store, extraction)).await??;
//! ```

mod fetcher;
mod registry;

use thiserror::Error;
use url::Url;

use crate::config::Config;
use crate::extract::{ExtractError, Extractor, Records};
use crate::record::Record;
use crate::store::{DeliveryStore, StoreError};

pub use fetcher::{FeedSource, FetchError, FetchPolicy};
pub use registry::{Registry, SELECTOR_DELIMITER};

/// Errors raised before extraction starts.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The feed URL has no `name+` prefix.
    #[error("feed URL '{0}' has no extractor selector (expected 'name+url')")]
    MissingSelector(String),

    /// The selector names no extractor available in this build.
    #[error("unknown extractor '{name}' (available: {available})")]
    UnknownExtractor { name: String, available: String },

    /// The part after the selector is not a fetchable URL.
    #[error("invalid feed URL '{url}': {reason}")]
    InvalidFeedUrl { url: String, reason: String },

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Routes feed URLs to extractors and opens the documents they name.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    registry: Registry,
    policy: FetchPolicy,
}

impl Dispatcher {
    /// Builds the HTTP client and extractor registry from configuration.
    pub fn new(config: &Config) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.timeout())
            .build()
            .map_err(FetchError::Network)?;

        Ok(Self::with_client(
            client,
            Registry::new(config),
            FetchPolicy {
                timeout: config.timeout(),
                max_retries: config.max_retries,
                backoff: config.retry_backoff(),
            },
        ))
    }

    pub fn with_client(client: reqwest::Client, registry: Registry, policy: FetchPolicy) -> Self {
        Self {
            client,
            registry,
            policy,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Resolves the selector, fetches the document and starts extraction.
    ///
    /// The selector is checked before any request is made. Relative
    /// references in the document resolve against the URL the body was
    /// finally served from, not the one requested.
    ///
    /// The returned [`Extraction`] reads the network body synchronously and
    /// must be consumed on a blocking thread (`tokio::task::spawn_blocking`).
    pub async fn dispatch(&self, feed_url: &str) -> Result<Extraction, DispatchError> {
        let (extractor, fetch_url) = self.registry.resolve(feed_url)?;
        let source = fetcher::open(&self.client, &fetch_url, self.policy).await?;

        tracing::info!(
            extractor = extractor.name(),
            feed = %fetch_url,
            origin = %source.origin,
            "Extracting feed"
        );
        Ok(Extraction::new(&extractor, source))
    }
}

/// Records being pulled out of one fetched document.
pub struct Extraction {
    extractor: &'static str,
    origin: Url,
    records: Records<'static>,
}

impl Extraction {
    /// Wires an already opened source into an extractor.
    pub fn new(extractor: &Extractor, source: FeedSource) -> Self {
        let records = extractor.records(source.reader, &source.origin);
        Self {
            extractor: extractor.name(),
            origin: source.origin,
            records,
        }
    }

    pub fn extractor(&self) -> &'static str {
        self.extractor
    }

    /// URL the document was served from.
    pub fn origin(&self) -> &Url {
        &self.origin
    }
}

impl Iterator for Extraction {
    type Item = Result<Record, ExtractError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.records.next()
    }
}

impl std::fmt::Debug for Extraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extraction")
            .field("extractor", &self.extractor)
            .field("origin", &self.origin.as_str())
            .finish_non_exhaustive()
    }
}

/// Outcome of feeding one extraction into the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Records the feed yielded.
    pub found: usize,
    /// Records that were new to the store.
    pub added: usize,
}

#[derive(Debug, Error)]
pub enum IngestError {
    /// The feed could not be read to the end. Records before the failure
    /// are already stored.
    #[error("extraction failed after {} records: {source}", .report.found)]
    Extract {
        report: IngestReport,
        #[source]
        source: ExtractError,
    },

    /// Writing to the store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Adds every extracted record to the store, stopping at the first error.
///
/// A record whose key collides with a stored entry is skipped, as in
/// [`DeliveryStore::update`].
///
/// Blocking: runs the extraction and the filesystem writes on the calling
/// thread.
pub fn ingest<I>(store: &DeliveryStore, records: I) -> Result<IngestReport, IngestError>
where
    I: IntoIterator<Item = Result<Record, ExtractError>>,
{
    let mut report = IngestReport::default();
    for record in records {
        let record = match record {
            Ok(record) => record,
            Err(source) => return Err(IngestError::Extract { report, source }),
        };
        report.found += 1;
        if store.add_or_skip(&record)? {
            report.added += 1;
        }
    }
    Ok(report)
}
