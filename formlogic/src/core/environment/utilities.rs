//! Utility-library bindings exposed to expressions.
//!
//! Each function here backs one entry in the pinned library table. The shared
//! statics (date formats, mask tokens) are read-only and the only state
//! concurrent passes have in common.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use serde_json::Value;

use crate::core::{data, path};

/// Path lookup into a JSON value (`a.b.0.c` or `a.b[0].c`).
pub fn get<'v>(value: &'v Value, object_path: &str) -> Option<&'v Value> {
    let normalized = path::normalize(object_path);
    let segments: Vec<&str> = path::segments(&normalized).collect();
    data::get(value, &segments)
}

pub fn has(value: &Value, object_path: &str) -> bool {
    get(value, object_path).is_some()
}

const DATE_TIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%d.%m.%Y"];

/// Parse the date shapes submissions commonly carry. Naive inputs are taken as UTC.
pub fn parse_date(input: &str) -> Option<DateTime<FixedOffset>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(input) {
        return Some(parsed);
    }
    let utc = FixedOffset::east_opt(0)?;
    for format in DATE_TIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Some(naive.and_utc().with_timezone(&utc));
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(input, format) {
            return date
                .and_hms_opt(0, 0, 0)
                .map(|naive| naive.and_utc().with_timezone(&utc));
        }
    }
    None
}

pub fn is_valid_date(input: &str) -> bool {
    parse_date(input).is_some()
}

/// Reformat a parseable date with a chrono format string.
pub fn format_date(input: &str, format: &str) -> Option<String> {
    parse_date(input).map(|date| date.format(format).to_string())
}

#[derive(Debug, Clone, Copy)]
enum MaskToken {
    Digit,
    Letter,
    Alphanumeric,
    Literal(char),
}

fn mask_token(c: char) -> MaskToken {
    match c {
        '9' => MaskToken::Digit,
        'a' => MaskToken::Letter,
        '*' => MaskToken::Alphanumeric,
        other => MaskToken::Literal(other),
    }
}

impl MaskToken {
    fn accepts(self, c: char) -> bool {
        match self {
            MaskToken::Digit => c.is_ascii_digit(),
            MaskToken::Letter => c.is_alphabetic(),
            MaskToken::Alphanumeric => c.is_alphanumeric(),
            MaskToken::Literal(literal) => literal == c,
        }
    }
}

/// Apply an input mask (`9` digit, `a` letter, `*` alphanumeric, anything else
/// literal). Characters that fit no slot are skipped; output stops when the
/// input runs out.
pub fn apply_mask(value: &str, mask: &str) -> String {
    let mut out = String::with_capacity(mask.len());
    let mut input = value.chars().peekable();
    for token in mask.chars().map(mask_token) {
        if input.peek().is_none() {
            break;
        }
        match token {
            MaskToken::Literal(literal) => {
                out.push(literal);
                if input.peek() == Some(&literal) {
                    input.next();
                }
            }
            slot => {
                for c in input.by_ref() {
                    if slot.accepts(c) {
                        out.push(c);
                        break;
                    }
                }
            }
        }
    }
    out
}

/// True when `value` is a complete rendering of `mask`.
pub fn matches_mask(value: &str, mask: &str) -> bool {
    value.chars().count() == mask.chars().count()
        && value
            .chars()
            .zip(mask.chars().map(mask_token))
            .all(|(c, token)| token.accepts(c))
}

pub fn btoa(input: &str) -> String {
    STANDARD.encode(input.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_accepts_dotted_and_bracketed_paths() {
        let value = json!({ "a": { "rows": [{ "b": 1 }] } });
        assert_eq!(get(&value, "a.rows.0.b"), Some(&json!(1)));
        assert_eq!(get(&value, "a.rows[0].b"), Some(&json!(1)));
        assert!(!has(&value, "a.missing"));
    }

    #[test]
    fn parse_date_handles_common_shapes() {
        assert!(is_valid_date("2024-02-29"));
        assert!(is_valid_date("2024-02-29T10:00:00Z"));
        assert!(is_valid_date("02/29/2024"));
        assert!(!is_valid_date("2023-02-29"));
        assert!(!is_valid_date("Invalid date"));
        assert_eq!(
            format_date("2024-03-01T12:30:00+02:00", "%d.%m.%Y").as_deref(),
            Some("01.03.2024")
        );
    }

    #[test]
    fn apply_mask_inserts_literals() {
        assert_eq!(apply_mask("5551234567", "(999) 999-9999"), "(555) 123-4567");
        assert_eq!(apply_mask("55512", "(999) 999-9999"), "(555) 12");
        assert_eq!(apply_mask("ab12", "aa-99"), "ab-12");
    }

    #[test]
    fn matches_mask_requires_complete_value() {
        assert!(matches_mask("(555) 123-4567", "(999) 999-9999"));
        assert!(!matches_mask("(555) 123-456", "(999) 999-9999"));
        assert!(!matches_mask("(555) 12a-4567", "(999) 999-9999"));
    }

    #[test]
    fn btoa_encodes_standard_base64() {
        assert_eq!(btoa("hello"), "aGVsbG8=");
    }
}
