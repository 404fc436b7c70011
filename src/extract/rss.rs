use std::io::BufRead;

use super::xml::{ItemReader, RawItem};
use super::ExtractError;
use crate::record::Record;

/// Yields one record per `<item>` carrying both a `<link>` and an
/// `<enclosure url="...">`.
pub(crate) struct RssRecords<R: BufRead> {
    items: ItemReader<R>,
    failed: bool,
}

impl<R: BufRead> RssRecords<R> {
    pub fn new(source: R) -> Self {
        Self {
            items: ItemReader::new(source, false),
            failed: false,
        }
    }
}

impl<R: BufRead> Iterator for RssRecords<R> {
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

            match to_record(item) {
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

fn to_record(item: RawItem) -> Option<Result<Record, ExtractError>> {
    if item.is_empty() {
        return None;
    }

    let (link, url) = match (item.link, item.enclosure) {
        (Some(link), Some(url)) => (link, url),
        (link, url) => {
            tracing::warn!(
                link = link.as_deref().unwrap_or("-"),
                url = url.as_deref().unwrap_or("-"),
                title = item.title.as_deref().unwrap_or("-"),
                "Skipping item without both a link and an enclosure"
            );
            return None;
        }
    };

    let record = match Record::new(link, url) {
        Ok(record) => record,
        Err(e) => return Some(Err(e.into())),
    };
    Some(Ok(match item.title {
        Some(title) => record.with_meta("title", &title),
        None => record,
    }))
}
