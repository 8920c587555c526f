//! Header Block - The `map[key:[value] ...]` literal at the end of request lines
//!
//! Grammar, as written by the request logger:
//!
//! ```text
//! block   = "map[" entries "]"
//! entries = "" | entry *( " " entry )
//! entry   = key ":[" value "]"
//! ```
//!
//! Keys may not contain `:[`. Values may contain spaces and brackets but not
//! the `] ` terminator, except for the final value which runs up to the byte
//! before the closing envelope bracket. Duplicate keys keep the last value.

use std::collections::HashMap;

const ENVELOPE_OPEN: &str = "map[";
const ENVELOPE_CLOSE: char = ']';
const VALUE_OPEN: &str = ":[";
const VALUE_CLOSE: &str = "] ";

/// Errors while tokenizing a header block
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderBlockError {
    #[error("header block is not wrapped in map[...]: {0:?}")]
    MissingEnvelope(String),

    #[error("expected `key:[` at offset {offset} of header block")]
    MissingKey { offset: usize },

    #[error("value of header {key:?} is not closed with `]`")]
    UnterminatedValue { key: String },
}

/// Parse a complete `map[...]` header block
pub fn parse_header_block(block: &str) -> Result<HashMap<String, String>, HeaderBlockError> {
    let inner = block
        .strip_prefix(ENVELOPE_OPEN)
        .and_then(|s| s.strip_suffix(ENVELOPE_CLOSE))
        .ok_or_else(|| HeaderBlockError::MissingEnvelope(block.to_string()))?;
    parse_header_entries(inner)
}

/// Tokenize the entries of a header block with the envelope already stripped
pub fn parse_header_entries(s: &str) -> Result<HashMap<String, String>, HeaderBlockError> {
    let mut headers = HashMap::new();
    if s.is_empty() {
        return Ok(headers);
    }

    // Byte index of the last value's closing bracket
    let limit = s.len() - 1;
    let mut start = 0;

    while start < s.len() {
        let key_end = s[start..]
            .find(VALUE_OPEN)
            .map(|i| start + i)
            .ok_or(HeaderBlockError::MissingKey { offset: start })?;
        let key = &s[start..key_end];

        let value_start = key_end + VALUE_OPEN.len();
        let value = match s[value_start..].find(VALUE_CLOSE) {
            Some(i) => {
                let value_end = value_start + i;
                start = value_end + VALUE_CLOSE.len();
                // A separator must be followed by another entry
                if start == s.len() {
                    return Err(HeaderBlockError::MissingKey { offset: start });
                }
                &s[value_start..value_end]
            }
            None => {
                if value_start > limit || !s.ends_with(ENVELOPE_CLOSE) {
                    return Err(HeaderBlockError::UnterminatedValue {
                        key: key.to_string(),
                    });
                }
                start = s.len();
                &s[value_start..limit]
            }
        };

        headers.insert(key.to_string(), value.to_string());
    }

    Ok(headers)
}

/// Render headers in the block format, keys sorted for stable output
pub fn render_header_block(headers: &HashMap<String, String>) -> String {
    let mut entries: Vec<(&String, &String)> = headers.iter().collect();
    entries.sort();

    let body = entries
        .iter()
        .map(|(key, value)| format!("{}{}{}]", key, VALUE_OPEN, value))
        .collect::<Vec<_>>()
        .join(" ");

    format!("{}{}{}", ENVELOPE_OPEN, body, ENVELOPE_CLOSE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_single_entry() {
        let parsed = parse_header_block("map[User-Agent:[test]]").unwrap();
        assert_eq!(parsed, headers(&[("User-Agent", "test")]));
    }

    #[test]
    fn test_values_with_spaces() {
        let parsed = parse_header_block(
            "map[Accept:[text/html application/json] User-Agent:[Mozilla/5.0 (X11; Linux x86_64)]]",
        )
        .unwrap();
        assert_eq!(
            parsed,
            headers(&[
                ("Accept", "text/html application/json"),
                ("User-Agent", "Mozilla/5.0 (X11; Linux x86_64)"),
            ])
        );
    }

    #[test]
    fn test_empty_block_and_empty_value() {
        assert!(parse_header_block("map[]").unwrap().is_empty());

        let parsed = parse_header_block("map[Cookie:[] Referer:[]]").unwrap();
        assert_eq!(parsed, headers(&[("Cookie", ""), ("Referer", "")]));
    }

    #[test]
    fn test_last_duplicate_wins() {
        let parsed = parse_header_block("map[X:[1] X:[2]]").unwrap();
        assert_eq!(parsed, headers(&[("X", "2")]));
    }

    #[test]
    fn test_value_containing_brackets() {
        let parsed = parse_header_block("map[A:[x]] B:[[y]]]").unwrap();
        assert_eq!(parsed, headers(&[("A", "x]"), ("B", "[y]")]));
    }

    #[test]
    fn test_missing_envelope_is_rejected() {
        assert!(matches!(
            parse_header_block("User-Agent:[test]"),
            Err(HeaderBlockError::MissingEnvelope(_))
        ));
        assert!(matches!(
            parse_header_block("map[User-Agent:[test]"),
            Err(HeaderBlockError::MissingEnvelope(_))
        ));
    }

    #[test]
    fn test_missing_key_marker_is_rejected() {
        assert_eq!(
            parse_header_block("map[garbage]"),
            Err(HeaderBlockError::MissingKey { offset: 0 })
        );
        assert_eq!(
            parse_header_block("map[A:[1] garbage]"),
            Err(HeaderBlockError::MissingKey { offset: 6 })
        );
        // One stray byte after the last entry
        assert_eq!(
            parse_header_block("map[A:[1] B]"),
            Err(HeaderBlockError::MissingKey { offset: 6 })
        );
        // Trailing separator with no entry after it
        assert_eq!(
            parse_header_block("map[A:[1] ]"),
            Err(HeaderBlockError::MissingKey { offset: 6 })
        );
        assert_eq!(
            parse_header_block("map[A:[1] B:[2] x]"),
            Err(HeaderBlockError::MissingKey { offset: 12 })
        );
    }

    #[test]
    fn test_unterminated_value_is_rejected() {
        assert_eq!(
            parse_header_entries("A:[1"),
            Err(HeaderBlockError::UnterminatedValue { key: "A".to_string() })
        );
        assert_eq!(
            parse_header_entries("A:["),
            Err(HeaderBlockError::UnterminatedValue { key: "A".to_string() })
        );
    }

    #[test]
    fn test_render_is_sorted() {
        let rendered = render_header_block(&headers(&[("b", "2"), ("a", "1 1")]));
        assert_eq!(rendered, "map[a:[1 1] b:[2]]");
        assert_eq!(render_header_block(&HashMap::new()), "map[]");
    }
}
