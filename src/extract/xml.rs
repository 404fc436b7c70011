//! Item-level event loop shared by the XML extractors.

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;
use std::io::BufRead;

use super::ExtractError;

/// Namespace of `content:encoded` (RSS 1.0 content module).
const CONTENT_NS: &[u8] = b"http://purl.org/rss/1.0/modules/content/";

/// Elements the item loop cares about, matched by namespace and local name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Item,
    Link,
    Title,
    Enclosure,
    Encoded,
    Other,
}

impl Tag {
    fn classify(ns: &ResolveResult<'_>, local: &[u8]) -> Self {
        match ns {
            ResolveResult::Unbound => match local {
                b"item" => Tag::Item,
                b"link" => Tag::Link,
                b"title" => Tag::Title,
                b"enclosure" => Tag::Enclosure,
                _ => Tag::Other,
            },
            ResolveResult::Bound(Namespace(uri)) if *uri == CONTENT_NS && local == b"encoded" => {
                Tag::Encoded
            }
            _ => Tag::Other,
        }
    }
}

/// Fields collected from one `<item>` block. The first occurrence of each
/// field wins.
#[derive(Debug, Default)]
pub(crate) struct RawItem {
    pub link: Option<String>,
    pub enclosure: Option<String>,
    pub title: Option<String>,
    pub encoded: Option<String>,
}

impl RawItem {
    pub fn is_empty(&self) -> bool {
        self.link.is_none()
            && self.enclosure.is_none()
            && self.title.is_none()
            && self.encoded.is_none()
    }
}

/// Pull parser yielding one [`RawItem`] per closed top-level `<item>`.
///
/// Item nesting is tracked with a depth counter: an `<item>` nested inside
/// another adds to the outer one rather than closing it early.
pub(crate) struct ItemReader<R: BufRead> {
    reader: NsReader<R>,
    depth: usize,
    capturing: Option<Tag>,
    text: String,
    item: RawItem,
    with_encoded: bool,
    done: bool,
}

impl<R: BufRead> ItemReader<R> {
    /// `with_encoded` enables collecting `content:encoded`, which can be
    /// large and is only needed by the curated extractor.
    pub fn new(source: R, with_encoded: bool) -> Self {
        let mut reader = NsReader::from_reader(source);
        // Self-closing tags arrive as Start + End, so `<enclosure/>` needs no special case.
        reader.config_mut().expand_empty_elements = true;

        Self {
            reader,
            depth: 0,
            capturing: None,
            text: String::new(),
            item: RawItem::default(),
            with_encoded,
            done: false,
        }
    }

    /// Reads until the next top-level `<item>` closes.
    ///
    /// Returns `Ok(None)` at end of document, including when the document
    /// ends inside an open item.
    pub fn next_item(&mut self) -> Result<Option<RawItem>, ExtractError> {
        if self.done {
            return Ok(None);
        }

        let mut buf = Vec::new();
        loop {
            buf.clear();
            let (ns, event) = match self.reader.read_resolved_event_into(&mut buf) {
                Ok(resolved) => resolved,
                Err(e) => {
                    self.done = true;
                    return Err(ExtractError::Xml(e.to_string()));
                }
            };

            match event {
                Event::Start(start) => {
                    let tag = Tag::classify(&ns, start.local_name().as_ref());
                    if let Err(e) = self.on_start(tag, &start) {
                        self.done = true;
                        return Err(e);
                    }
                }
                Event::End(end) => {
                    let tag = Tag::classify(&ns, end.local_name().as_ref());
                    if let Some(item) = self.on_end(tag) {
                        return Ok(Some(item));
                    }
                }
                Event::Text(text) if self.capturing.is_some() => match text.unescape() {
                    Ok(text) => self.text.push_str(&text),
                    Err(e) => {
                        self.done = true;
                        return Err(ExtractError::Xml(e.to_string()));
                    }
                },
                Event::CData(data) if self.capturing.is_some() => {
                    match self.reader.decoder().decode(&data) {
                        Ok(text) => self.text.push_str(&text),
                        Err(e) => {
                            self.done = true;
                            return Err(ExtractError::Xml(e.to_string()));
                        }
                    }
                }
                Event::Eof => {
                    self.done = true;
                    if self.depth > 0 {
                        tracing::debug!(
                            depth = self.depth,
                            "Document ended inside an open item, dropping it"
                        );
                    }
                    return Ok(None);
                }
                _ => {}
            }
        }
    }

    fn on_start(&mut self, tag: Tag, start: &BytesStart<'_>) -> Result<(), ExtractError> {
        if tag == Tag::Item {
            self.depth += 1;
            if self.depth == 1 {
                self.item = RawItem::default();
                self.capturing = None;
            }
            return Ok(());
        }

        if self.depth == 0 || self.capturing.is_some() {
            return Ok(());
        }

        match tag {
            Tag::Link | Tag::Title => self.begin_capture(tag),
            Tag::Encoded if self.with_encoded => self.begin_capture(tag),
            Tag::Enclosure if self.item.enclosure.is_none() => {
                self.item.enclosure = self.attribute(start, b"url")?;
            }
            _ => {}
        }
        Ok(())
    }

    fn on_end(&mut self, tag: Tag) -> Option<RawItem> {
        if self.depth == 0 {
            return None;
        }

        if self.capturing == Some(tag) {
            self.capturing = None;
            let value = self.text.trim().to_string();
            let slot = match tag {
                Tag::Link => &mut self.item.link,
                Tag::Title => &mut self.item.title,
                Tag::Encoded => &mut self.item.encoded,
                _ => return None,
            };
            if slot.is_none() && !value.is_empty() {
                *slot = Some(value);
            }
            return None;
        }

        if tag == Tag::Item {
            self.depth -= 1;
            if self.depth == 0 {
                self.capturing = None;
                return Some(std::mem::take(&mut self.item));
            }
        }
        None
    }

    fn begin_capture(&mut self, tag: Tag) {
        self.capturing = Some(tag);
        self.text.clear();
    }

    /// Value of an unprefixed attribute. Prefixed attributes such as
    /// `media:url` belong to another namespace and never match.
    fn attribute(
        &self,
        start: &BytesStart<'_>,
        name: &[u8],
    ) -> Result<Option<String>, ExtractError> {
        for attr in start.attributes() {
            let attr = match attr {
                Ok(attr) => attr,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed attribute");
                    continue;
                }
            };
            if attr.key.as_ref() == name {
                let value = attr
                    .decode_and_unescape_value(self.reader.decoder())
                    .map_err(|e| ExtractError::Xml(e.to_string()))?;
                let value = value.trim();
                return Ok((!value.is_empty()).then(|| value.to_string()));
            }
        }
        Ok(None)
    }
}
