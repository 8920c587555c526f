//! Line Classification - Decide whether a raw log line is a request record
//!
//! A request line starts with a `YYYY/MM/DD hh:mm:ss` timestamp in the first
//! 19 bytes, followed by one separator byte and a configured source tag.
//! Everything else is unrelated server output and goes to the ignored sink.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// chrono layout matching the timestamp prefix
pub const TIMESTAMP_LAYOUT: &str = "%Y/%m/%d %H:%M:%S";

/// Length in bytes of the timestamp prefix
pub const TIMESTAMP_LEN: usize = 19;

/// Byte offset at which the source tag begins
pub const SOURCE_OFFSET: usize = TIMESTAMP_LEN + 1;

/// Shape of the timestamp prefix: `d` is an ASCII digit, anything else is literal
const TIMESTAMP_SHAPE: &[u8; TIMESTAMP_LEN] = b"dddd/dd/dd dd:dd:dd";

/// Parse a timestamp prefix into seconds since the epoch (UTC)
///
/// The slice must be exactly 19 bytes and match the layout byte for byte,
/// so single-digit months or a missing separator are rejected even when
/// chrono alone would accept them.
pub fn parse_timestamp(prefix: &str) -> Option<i64> {
    let bytes = prefix.as_bytes();
    if bytes.len() != TIMESTAMP_LEN {
        return None;
    }

    // Four-digit year: the leading digit may not be zero
    if !matches!(bytes[0], b'1'..=b'9') {
        return None;
    }

    let shape_ok = bytes
        .iter()
        .zip(TIMESTAMP_SHAPE.iter())
        .all(|(b, s)| match s {
            b'd' => b.is_ascii_digit(),
            literal => b == literal,
        });
    if !shape_ok {
        return None;
    }

    NaiveDateTime::parse_from_str(prefix, TIMESTAMP_LAYOUT)
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

/// Check whether a line is a request-log line for one of the given source tags
pub fn is_request_line<S: AsRef<str>>(sources: &[S], line: &str) -> bool {
    let Some(prefix) = line.get(..TIMESTAMP_LEN) else {
        return false;
    };
    if parse_timestamp(prefix).is_none() {
        return false;
    }

    let Some(rest) = line.get(SOURCE_OFFSET..) else {
        return false;
    };
    sources.iter().any(|tag| rest.starts_with(tag.as_ref()))
}

/// The set of source tags that mark request-log lines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceTags(Vec<String>);

impl SourceTags {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            tags.into_iter()
                .map(Into::into)
                .filter(|t: &String| !t.is_empty())
                .collect(),
        )
    }

    /// Parse a comma separated tag list, e.g. `log.go:,server.go:`
    pub fn from_csv(csv: &str) -> Self {
        Self::new(csv.split(',').map(str::trim))
    }

    pub fn is_request_line(&self, line: &str) -> bool {
        is_request_line(&self.0, line)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for SourceTags {
    fn default() -> Self {
        Self::new(["log.go:"])
    }
}
