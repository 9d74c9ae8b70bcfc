//! Dotted component paths (`rows.0.val`) and their comparisons.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

static BRACKET_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)\]").expect("bracket index regex is valid"));

/// Rewrite bracketed row indices into dotted segments (`rows[0].val` -> `rows.0.val`).
pub fn normalize(path: &str) -> Cow<'_, str> {
    let trimmed = path.trim().trim_matches('.');
    if !trimmed.contains('[') {
        return Cow::Borrowed(trimmed);
    }
    Cow::Owned(BRACKET_INDEX.replace_all(trimmed, ".$1").into_owned())
}

/// Append `segment` to `prefix`, skipping empty parts.
pub fn join(prefix: &str, segment: &str) -> String {
    match (prefix.is_empty(), segment.is_empty()) {
        (true, _) => segment.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{prefix}.{segment}"),
    }
}

pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|segment| !segment.is_empty())
}

/// Drop the final segment; `None` once nothing is left.
pub fn strip_last(path: &str) -> Option<&str> {
    path.rsplit_once('.').map(|(head, _)| head)
}

/// Segment-aware prefix test: `a.b` covers `a.b` and `a.b.c` but not `a.bc`.
pub fn covers(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() {
        return false;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('.'),
        None => false,
    }
}

/// Segment-aware suffix test: `val` and `0.val` both end `rows.0.val`.
pub fn ends_with_segments(path: &str, suffix: &str) -> bool {
    if suffix.is_empty() {
        return false;
    }
    match path.strip_suffix(suffix) {
        Some(rest) => rest.is_empty() || rest.ends_with('.'),
        None => false,
    }
}

/// True for purely numeric segments (row positions).
pub fn is_index(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_rewrites_bracket_indices() {
        assert_eq!(normalize("rows[0].val"), "rows.0.val");
        assert_eq!(normalize("a[1][2].b"), "a.1.2.b");
        assert_eq!(normalize(" plain.path "), "plain.path");
    }

    #[test]
    fn covers_is_segment_aware() {
        assert!(covers("a.b", "a.b"));
        assert!(covers("a.b", "a.b.c"));
        assert!(!covers("a.b", "a.bc"));
        assert!(!covers("", "a"));
    }

    #[test]
    fn ends_with_segments_is_segment_aware() {
        assert!(ends_with_segments("rows.0.val", "val"));
        assert!(ends_with_segments("rows.0.val", "0.val"));
        assert!(ends_with_segments("val", "val"));
        assert!(!ends_with_segments("rows.0.interval", "val"));
    }

    #[test]
    fn strip_last_stops_at_root() {
        assert_eq!(strip_last("a.b.c"), Some("a.b"));
        assert_eq!(strip_last("a"), None);
    }

    #[test]
    fn join_skips_empty_parts() {
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("a", ""), "a");
        assert_eq!(join("a", "b"), "a.b");
    }
}
