//! On-disk form of a record: one `field value` pair per line.
//!
//! ```text
//! link http://example.com/shows/ep1
//! url http://cdn.example.com/ep1.mp3
//! title Episode one
//! ```
//!
//! Files holding nothing but a media URL are accepted too; their link is
//! the key itself since the original link cannot be recovered.

use std::collections::BTreeMap;

use crate::record::{Key, Record};

pub(crate) fn encode(record: &Record) -> String {
    let mut out = format!("link {}\nurl {}\n", record.link(), record.url());
    for (field, value) in record.meta() {
        out.push_str(field);
        out.push(' ');
        out.push_str(value);
        out.push('\n');
    }
    out
}

/// Parses a stored record. The error is a human-readable reason.
pub(crate) fn decode(key: Key, content: &str) -> Result<Record, String> {
    let content = content.trim();
    if content.is_empty() {
        return Err("empty record file".to_string());
    }

    if !content.contains(char::is_whitespace) {
        let link = key.to_string();
        return Ok(Record::from_stored(
            key,
            link,
            content.to_string(),
            BTreeMap::new(),
        ));
    }

    let mut link = None;
    let mut url = None;
    let mut meta = BTreeMap::new();
    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (field, value) = match line.split_once(char::is_whitespace) {
            Some((field, value)) => (field, value.trim()),
            None => (line, ""),
        };
        match field {
            "link" => link = Some(value.to_string()),
            "url" => url = Some(value.to_string()),
            _ => {
                meta.insert(field.to_string(), value.to_string());
            }
        }
    }

    let url = url
        .filter(|u| !u.is_empty())
        .ok_or_else(|| "missing 'url' field".to_string())?;
    let link = link
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| key.to_string());
    Ok(Record::from_stored(key, link, url, meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encode_then_decode_keeps_fields() {
        let record = Record::new("http://example.com/a/b", "http://cdn/b.mp3")
            .unwrap()
            .with_meta("title", "B side");
        let text = encode(&record);
        assert_eq!(
            text,
            "link http://example.com/a/b\nurl http://cdn/b.mp3\ntitle B side\n"
        );
        assert_eq!(decode(record.key().clone(), &text).unwrap(), record);
    }

    #[test]
    fn test_bare_url_file() {
        let key = Key::parse("a/b").unwrap();
        let record = decode(key, "http://cdn/b.mp3\n").unwrap();
        assert_eq!(record.url(), "http://cdn/b.mp3");
        assert_eq!(record.link(), "a/b");
    }

    #[test]
    fn test_missing_url_is_rejected() {
        let key = Key::parse("a").unwrap();
        assert!(decode(key.clone(), "link http://example.com/a\n").is_err());
        assert!(decode(key, "  \n").is_err());
    }
}
