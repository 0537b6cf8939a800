//! Outbox file format.
//!
//! Agents that cannot speak the socket protocol drop files into
//! `<outbox>/<agent>/<messageType>`.  Format:
//!
//! ```text
//! KEY1: value1
//! KEY2: value2
//!
//! body…
//! ```
//!
//! Header keys are uppercased; parsing stops at the first blank line.
//! Unrecognised keys are preserved verbatim.  A file with no colon on the
//! first line is body-only.

use std::collections::BTreeMap;

/// A parsed outbox file: headers map plus body string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutboxFile {
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Parse outbox file content.
///
/// Header parsing stops at the first blank line or the first line without a
/// colon; everything after belongs to the body.
pub fn parse(content: &str) -> OutboxFile {
    let mut lines = content.split_inclusive('\n');

    // Body-only fast path: no colon on the first line.
    match content.lines().next() {
        None => return OutboxFile::default(),
        Some(first) if !first.contains(':') => {
            return OutboxFile {
                headers: BTreeMap::new(),
                body: content.to_owned(),
            };
        }
        Some(_) => {}
    }

    let mut headers = BTreeMap::new();
    let mut consumed = 0usize;
    for line in lines.by_ref() {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            consumed += line.len();
            break;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            // Malformed header line: the body starts here.
            break;
        };
        headers.insert(
            key.trim().to_ascii_uppercase(),
            value.trim().to_owned(),
        );
        consumed += line.len();
    }

    OutboxFile {
        headers,
        body: content[consumed..].to_owned(),
    }
}
