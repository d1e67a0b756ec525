use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

/// Literal prefix marking the first line of a reply as a tag line.
pub const TAG_PREFIX: &str = "LLM-TAGS:";

/// A single tag value. A bare key (`c` in `a=1;c`) is a flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagValue {
    Text(String),
    Flag,
}

impl TagValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::Text(v) => Some(v),
            TagValue::Flag => None,
        }
    }
}

impl Serialize for TagValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TagValue::Text(v) => serializer.serialize_str(v),
            TagValue::Flag => serializer.serialize_bool(true),
        }
    }
}

/// Result of splitting a raw reply into its tag line and body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedTags {
    pub tags: BTreeMap<String, TagValue>,
    pub body: String,
}

impl ParsedTags {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.tags.get(key).and_then(TagValue::as_str)
    }

    /// Boolean reading of a tag: a bare flag is true, a text value is true
    /// only when it spells `true` (ASCII case-insensitive). Absent is false.
    pub fn flag(&self, key: &str) -> bool {
        match self.tags.get(key) {
            Some(TagValue::Flag) => true,
            Some(TagValue::Text(v)) => v.eq_ignore_ascii_case("true"),
            None => false,
        }
    }
}

/// Parse the `LLM-TAGS:` convention. Only the first line is inspected.
pub fn parse_llm_tags(raw: &str) -> ParsedTags {
    let (first, rest) = match raw.split_once('\n') {
        Some((first, rest)) => (first, rest),
        None => (raw, ""),
    };
    let first = first.strip_suffix('\r').unwrap_or(first);

    let Some(payload) = first.strip_prefix(TAG_PREFIX) else {
        return ParsedTags {
            tags: BTreeMap::new(),
            body: raw.trim().to_string(),
        };
    };

    let mut tags = BTreeMap::new();
    for piece in payload.split(';') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let (key, value) = match piece.split_once('=') {
            Some((k, v)) => (k.trim(), TagValue::Text(v.trim().to_string())),
            None => (piece, TagValue::Flag),
        };
        if key.is_empty() {
            continue;
        }
        // later duplicates win
        tags.insert(key.to_string(), value);
    }

    ParsedTags {
        tags,
        body: rest.trim().to_string(),
    }
}
