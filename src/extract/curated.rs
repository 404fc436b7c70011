use std::io::BufRead;

use super::xml::{ItemReader, RawItem};
use super::ExtractError;
use crate::record::Record;

/// Selection rules for the curated extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CuratedFilter {
    /// Literal substring an item's `<title>` must contain.
    pub title_contains: String,
    /// Phrase marking the line of `content:encoded` that holds the media anchor.
    pub marker: String,
}

/// Yields records for the `<item>`s whose title passes the filter, taking
/// the media URL from the item's `content:encoded` HTML.
pub(crate) struct CuratedRecords<R: BufRead> {
    items: ItemReader<R>,
    filter: CuratedFilter,
    failed: bool,
}

impl<R: BufRead> CuratedRecords<R> {
    pub fn new(source: R, filter: CuratedFilter) -> Self {
        Self {
            items: ItemReader::new(source, true),
            filter,
            failed: false,
        }
    }

    fn to_record(&self, item: RawItem) -> Option<Result<Record, ExtractError>> {
        let title = item.title?;
        if !title.contains(&self.filter.title_contains) {
            tracing::trace!(title = %title, "Title does not match filter, skipping item");
            return None;
        }

        let media = item
            .encoded
            .as_deref()
            .and_then(|content| find_media_url(content, &self.filter.marker));
        let (link, url) = match (item.link, media) {
            (Some(link), Some(url)) => (link, url),
            (link, _) => {
                tracing::warn!(
                    title = %title,
                    link = link.as_deref().unwrap_or("-"),
                    marker = %self.filter.marker,
                    "Skipping matching item without a link or a marked media anchor"
                );
                return None;
            }
        };

        Some(
            Record::new(link, url)
                .map(|record| record.with_meta("title", &title))
                .map_err(ExtractError::from),
        )
    }
}

impl<R: BufRead> Iterator for CuratedRecords<R> {
    type Item = Result<Record, ExtractError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        loop {
            let item = match self.items.next_item() {
                Ok(Some(item)) => item,
                Ok(None) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            };

            match self.to_record(item) {
                Some(Ok(record)) => return Some(Ok(record)),
                Some(Err(e)) => {
                    self.failed = true;
                    return Some(Err(e));
                }
                None => continue,
            }
        }
    }
}

/// Finds the media link in an HTML blurb.
///
/// Looks at the first line containing `marker` that also carries a
/// quoted `http(s)://` token after the marker, typically
/// `Download: <a href="https://cdn.example.com/mix.mp3">mp3</a>`.
fn find_media_url(content: &str, marker: &str) -> Option<String> {
    content
        .lines()
        .filter_map(|line| line.find(marker).map(|at| &line[at + marker.len()..]))
        .find_map(first_http_token)
        .map(|raw| match quick_xml::escape::unescape(raw) {
            Ok(url) => url.into_owned(),
            Err(_) => raw.to_string(),
        })
}

/// First single- or double-quoted token starting with an HTTP scheme.
fn first_http_token(text: &str) -> Option<&str> {
    let mut rest = text;
    loop {
        let open = rest.find(['"', '\''])?;
        let quote = rest[open..].chars().next()?;
        let after = &rest[open + 1..];
        let close = after.find(quote)?;
        let token = &after[..close];
        if token.starts_with("http://") || token.starts_with("https://") {
            return Some(token);
        }
        rest = &after[close + 1..];
    }
}
