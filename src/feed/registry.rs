use std::collections::BTreeMap;
use url::Url;

use super::DispatchError;
use crate::config::Config;
use crate::extract::Extractor;

/// Separates the extractor name from the fetch URL in a feed URL.
pub const SELECTOR_DELIMITER: char = '+';

/// Extractors available in this build, by selector name.
///
/// Built once at start-up. An extractor whose parser was compiled out is
/// simply missing, so its selector is rejected like any unknown name.
#[derive(Debug, Clone)]
pub struct Registry {
    extractors: BTreeMap<&'static str, Extractor>,
}

impl Registry {
    #[cfg_attr(not(feature = "rss"), allow(unused_variables))]
    pub fn new(config: &Config) -> Self {
        #[allow(unused_mut)]
        let mut extractors = BTreeMap::new();

        #[cfg(feature = "rss")]
        {
            extractors.insert("rss", Extractor::Rss);
            extractors.insert(
                "curated",
                Extractor::Curated(crate::extract::CuratedFilter {
                    title_contains: config.curated.title_contains.clone(),
                    marker: config.curated.marker.clone(),
                }),
            );
        }

        #[cfg(feature = "embedded-json")]
        {
            extractors.insert("embedded-json", Extractor::EmbeddedJson);
            // Name used by feed URLs written for earlier releases.
            extractors.insert("soundcloud", Extractor::EmbeddedJson);
        }

        tracing::debug!(
            extractors = ?extractors.keys().collect::<Vec<_>>(),
            "Extractor registry built"
        );
        Self { extractors }
    }

    /// Selector names in this build, sorted.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.extractors.keys().copied()
    }

    pub fn get(&self, name: &str) -> Option<&Extractor> {
        self.extractors.get(name)
    }

    /// Splits `selector+url` and looks the selector up.
    ///
    /// Performs no I/O, so a bad selector is rejected before any request.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::MissingSelector`] if there is no `+`
    /// - [`DispatchError::UnknownExtractor`] if the name is not registered
    /// - [`DispatchError::InvalidFeedUrl`] if the fetch URL is not http(s)
    pub fn resolve(&self, feed_url: &str) -> Result<(Extractor, Url), DispatchError> {
        let (name, fetch_url) = feed_url
            .split_once(SELECTOR_DELIMITER)
            .ok_or_else(|| DispatchError::MissingSelector(feed_url.to_string()))?;

        let extractor = self
            .get(name)
            .ok_or_else(|| DispatchError::UnknownExtractor {
                name: name.to_string(),
                available: self.names().collect::<Vec<_>>().join(", "),
            })?
            .clone();

        let url = Url::parse(fetch_url).map_err(|e| DispatchError::InvalidFeedUrl {
            url: fetch_url.to_string(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(DispatchError::InvalidFeedUrl {
                    url: fetch_url.to_string(),
                    reason: format!("unsupported scheme '{scheme}'"),
                })
            }
        }

        Ok((extractor, url))
    }
}
