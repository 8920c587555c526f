//! Request Line Parser - Extract a structured request from a classified line
//!
//! Line layout (single spaces between tokens):
//!
//! ```text
//! 2022/05/01 12:00:00 log.go: 1.2.3.4:5555 HTTP/1.1 GET example.com /path map[User-Agent:[test]]
//! <---- timestamp ---> source  address    protocol method host      url   header block
//! ```
//!
//! The URL and header block are optional. When no space follows the URL the
//! rest of the line is the URL and there are no headers.

use crate::classify::{parse_timestamp, SOURCE_OFFSET, TIMESTAMP_LEN};
use crate::header_block::{parse_header_block, HeaderBlockError};
use serde::Serialize;
use std::collections::HashMap;

/// Structural violations in a classified line
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedLine {
    #[error("invalid timestamp prefix: {0:?}")]
    Timestamp(String),

    #[error("line ends before the {0} field")]
    MissingField(&'static str),

    #[error("address is not in host:port form: {0:?}")]
    Address(String),

    #[error("invalid header block: {0}")]
    HeaderBlock(#[from] HeaderBlockError),
}

/// A parsed request-log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestRecord {
    /// Seconds since the epoch (UTC)
    pub timestamp: i64,
    pub source: String,
    /// Client host with the port removed
    pub address: String,
    pub protocol: String,
    pub method: String,
    pub host: String,
    pub url: String,
    pub headers: HashMap<String, String>,
}

impl RequestRecord {
    /// Fields in line order: source, address, protocol, method, host, url
    pub fn fields(&self) -> [&str; 6] {
        [
            &self.source,
            &self.address,
            &self.protocol,
            &self.method,
            &self.host,
            &self.url,
        ]
    }
}

/// Split `host:port` and return the host
///
/// Accepts bracketed IPv6 (`[::1]:80`). A bare host with more than one colon
/// is ambiguous and rejected. The port itself is not validated.
pub fn split_host_port(addr: &str) -> Option<&str> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        after.strip_prefix(':')?;
        return Some(host);
    }

    let (host, port) = addr.rsplit_once(':')?;
    if host.contains(':') || port.contains(']') {
        return None;
    }
    Some(host)
}

/// Cursor over the space separated tokens after the timestamp
struct Tokens<'a> {
    rest: &'a str,
}

impl<'a> Tokens<'a> {
    /// Take the next token, which must be followed by a space
    fn take(&mut self, field: &'static str) -> Result<&'a str, MalformedLine> {
        let (token, rest) = self
            .rest
            .split_once(' ')
            .ok_or(MalformedLine::MissingField(field))?;
        self.rest = rest;
        Ok(token)
    }

    /// Take the next token, or whatever remains when no space follows
    fn take_or_rest(&mut self) -> (&'a str, Option<&'a str>) {
        match self.rest.split_once(' ') {
            Some((token, rest)) => (token, Some(rest)),
            None => (self.rest, None),
        }
    }
}

/// Parse a line that passed classification
pub fn parse_request_line(line: &str) -> Result<RequestRecord, MalformedLine> {
    let prefix = line
        .get(..TIMESTAMP_LEN)
        .ok_or_else(|| MalformedLine::Timestamp(line.to_string()))?;
    let timestamp =
        parse_timestamp(prefix).ok_or_else(|| MalformedLine::Timestamp(prefix.to_string()))?;

    if line.as_bytes().get(TIMESTAMP_LEN) != Some(&b' ') {
        return Err(MalformedLine::MissingField("source"));
    }

    let mut tokens = Tokens {
        rest: &line[SOURCE_OFFSET..],
    };

    let source = tokens.take("source")?;
    let raw_address = tokens.take("address")?;
    let address = split_host_port(raw_address)
        .ok_or_else(|| MalformedLine::Address(raw_address.to_string()))?;
    let protocol = tokens.take("protocol")?;
    let method = tokens.take("method")?;
    let (host, after_host) = tokens.take_or_rest();

    let (url, headers) = match after_host {
        None => ("", HashMap::new()),
        Some(rest) => {
            let mut tail = Tokens { rest };
            match tail.take_or_rest() {
                (url, None) => (url, HashMap::new()),
                (url, Some(block)) => (url, parse_header_block(block)?),
            }
        }
    };

    Ok(RequestRecord {
        timestamp,
        source: source.to_string(),
        address: address.to_string(),
        protocol: protocol.to_string(),
        method: method.to_string(),
        host: host.to_string(),
        url: url.to_string(),
        headers,
    })
}
