//! Tag extraction, merging and blacklist filtering.

use tracing::{debug, warn};

use crate::{ConfigError, ParseError, TagSet, WatchedObject, TAG_LIST_ANNOTATION};

const ASSIGN: char = '=';

/// Keys reserved by EC2 and the in-tree cloud provider, compared lower-cased.
const RESERVED_KEYS: [&str; 2] = ["name", "kubernetescluster"];
const RESERVED_PREFIX: &str = "kubernetes.io/";

/// Result of parsing a tag list: accepted tags plus every rejected entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedTags {
    pub tags: TagSet,
    pub rejected: Vec<ParseError>,
}

fn split_pair(entry: &str) -> Result<(&str, &str), ParseError> {
    let mut parts = entry.split(ASSIGN);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(""), Some(_), None) => Err(ParseError::EmptyKey { entry: entry.to_string() }),
        (Some(key), Some(value), None) => Ok((key, value)),
        _ => Err(ParseError::InvalidEntry { entry: entry.to_string() }),
    }
}

/// Parse a `sep`-delimited list of `key=value` entries. An entry that does not
/// split into exactly a non-empty key and a value is rejected; later duplicates win.
pub fn parse_tag_list(raw: &str, separator: &str) -> ParsedTags {
    let mut out = ParsedTags::default();
    for entry in raw.split(separator) {
        match split_pair(entry) {
            Ok((key, value)) => {
                out.tags.insert(key.to_string(), value.to_string());
            }
            Err(e) => out.rejected.push(e),
        }
    }
    out
}

/// Tags declared on the object's tag-list annotation. `None` when the
/// annotation is absent; malformed entries are skipped with a warning.
pub fn extract_tags(obj: &WatchedObject) -> Option<TagSet> {
    let Some(raw) = obj.annotation(TAG_LIST_ANNOTATION) else {
        debug!(pvc = %obj.key(), "no additional tags defined");
        return None;
    };
    let parsed = parse_tag_list(raw, obj.tag_separator());
    for err in &parsed.rejected {
        match err {
            ParseError::EmptyKey { .. } => warn!(pvc = %obj.key(), error = %err, "ignoring tag, empty key"),
            ParseError::InvalidEntry { .. } => warn!(pvc = %obj.key(), error = %err, "ignoring tag, invalid format"),
        }
    }
    Some(parsed.tags)
}

/// Union of both sets; on key collision the custom value wins.
pub fn merge_tags(defaults: &TagSet, custom: Option<&TagSet>) -> TagSet {
    let mut merged = defaults.clone();
    if let Some(custom) = custom {
        merged.extend(custom.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    debug!(tags = ?merged, "merged tag list");
    merged
}

pub fn is_blacklisted(key: &str) -> bool {
    let lower = key.to_lowercase();
    RESERVED_KEYS.contains(&lower.as_str()) || lower.starts_with(RESERVED_PREFIX)
}

/// Drop reserved keys. Returns the dispatchable set and the dropped keys.
pub fn filter_blacklisted(tags: TagSet) -> (TagSet, Vec<String>) {
    let mut dropped = Vec::new();
    let kept = tags
        .into_iter()
        .filter(|(k, _)| {
            if is_blacklisted(k) {
                warn!(key = %k, "tag name is in the list of blacklisted names");
                dropped.push(k.clone());
                false
            } else {
                true
            }
        })
        .collect();
    (kept, dropped)
}

/// Parse one `--default-tag` value. Unlike annotation entries this is strict:
/// a malformed value rejects startup.
pub fn parse_default_tag(value: &str) -> Result<(String, String), ConfigError> {
    split_pair(value)
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .map_err(|_| ConfigError::InvalidTagFormat(value.to_string()))
}
