use serde::Deserialize;
use std::io::{self, BufRead, Read};
use url::Url;

use super::ExtractError;
use crate::record::{Record, RecordError};

/// Script statement that hands one track object to the page's player.
const PUSH_PREFIX: &str = "window.SC.bufferTracks.push(";
const PUSH_SUFFIX: &str = ");";

/// Longest line buffered while scanning; longer lines are skipped unread.
const MAX_LINE_BYTES: usize = 1 << 20;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BufferedTrack {
    /// Page of the track, relative to the document.
    uri: String,
    stream_url: String,
    #[serde(default)]
    title: Option<String>,
}

/// Scans an HTML page line by line for embedded track payloads.
pub(crate) struct EmbeddedRecords<R: BufRead> {
    source: R,
    origin: Url,
    line: Vec<u8>,
    line_no: usize,
    done: bool,
}

impl<R: BufRead> EmbeddedRecords<R> {
    pub fn new(source: R, origin: Url) -> Self {
        Self {
            source,
            origin,
            line: Vec::new(),
            line_no: 0,
            done: false,
        }
    }

    /// Discards input up to and including the next newline.
    fn skip_rest_of_line(&mut self) -> io::Result<()> {
        loop {
            let available = match self.source.fill_buf() {
                Ok(buf) => buf,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(end) => {
                    self.source.consume(end + 1);
                    return Ok(());
                }
                None => {
                    let len = available.len();
                    self.source.consume(len);
                }
            }
        }
    }

    fn to_record(&self, payload: &str) -> Result<Record, ExtractError> {
        let track: BufferedTrack =
            serde_json::from_str(payload).map_err(|source| ExtractError::Json {
                line: self.line_no,
                source,
            })?;

        let link = self
            .origin
            .join(&track.uri)
            .map_err(|e| RecordError::InvalidLink {
                link: track.uri.clone(),
                reason: e.to_string(),
            })?;

        let record = Record::new(link.as_str(), track.stream_url)?;
        Ok(match track.title {
            Some(title) => record.with_meta("title", &title),
            None => record,
        })
    }
}

impl<R: BufRead> Iterator for EmbeddedRecords<R> {
    type Item = Result<Record, ExtractError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            self.line.clear();
            let mut bounded = self.source.by_ref().take(MAX_LINE_BYTES as u64);
            match bounded.read_until(b'\n', &mut self.line) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => self.line_no += 1,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }

            if self.line.len() == MAX_LINE_BYTES && self.line.last() != Some(&b'\n') {
                tracing::warn!(
                    line = self.line_no,
                    max_bytes = MAX_LINE_BYTES,
                    "Line too long to scan, skipping it"
                );
                if let Err(e) = self.skip_rest_of_line() {
                    self.done = true;
                    return Some(Err(e.into()));
                }
                continue;
            }

            // Pages are not guaranteed to be valid UTF-8 outside the payload.
            let text = String::from_utf8_lossy(&self.line);
            let Some(call) = text.trim_start().strip_prefix(PUSH_PREFIX) else {
                continue;
            };
            let Some(payload) = call.trim_end().strip_suffix(PUSH_SUFFIX) else {
                tracing::warn!(
                    line = self.line_no,
                    "Track push without a closing '{PUSH_SUFFIX}', skipping line"
                );
                continue;
            };

            let result = self.to_record(payload);
            if result.is_err() {
                self.done = true;
            }
            return Some(result);
        }
        None
    }
}
