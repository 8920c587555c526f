//! Query Builder - Filtered, grouped request counts for the dashboard
//!
//! Predicates are optional and ANDed. Header predicates pull in a join
//! between `requests` and `headers`; which side drives the join depends on
//! whether the aggregated column lives on the request or the header.
//! Every value is a bound parameter; the SQL text only ever contains
//! fixed column names.

use rusqlite::ToSql;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Maximum number of groups returned by an aggregate query
pub const GROUP_LIMIT: usize = 1000;

/// Errors from predicate or dimension names supplied by a client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("unknown predicate: {0}")]
    UnknownPredicate(String),

    #[error(
        "unknown dimension: {0} (expected one of: requests, address, protocol, method, url, \
         header-key, header-value)"
    )]
    UnknownDimension(String),

    #[error("{name} must be seconds since the epoch, got {value:?}")]
    InvalidTimestamp { name: &'static str, value: String },
}

/// Optional predicates over requests and their headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFilter {
    /// Exclusive lower bound on the request timestamp
    pub start: Option<i64>,
    /// Exclusive upper bound on the request timestamp
    pub end: Option<i64>,
    pub address: Option<String>,
    pub protocol: Option<String>,
    pub method: Option<String>,
    pub url: Option<String>,
    pub header_key: Option<String>,
    pub header_value: Option<String>,
}

impl RequestFilter {
    /// Names accepted by [`RequestFilter::set`]
    pub const PREDICATES: [&'static str; 8] = [
        "start",
        "end",
        "address",
        "protocol",
        "method",
        "url",
        "header-key",
        "header-value",
    ];

    /// Set a predicate by name; an empty value clears it
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), QueryError> {
        let text = (!value.is_empty()).then(|| value.to_string());
        match name {
            "start" => self.start = parse_bound("start", value)?,
            "end" => self.end = parse_bound("end", value)?,
            "address" => self.address = text,
            "protocol" => self.protocol = text,
            "method" => self.method = text,
            "url" => self.url = text,
            "header-key" => self.header_key = text,
            "header-value" => self.header_value = text,
            other => return Err(QueryError::UnknownPredicate(other.to_string())),
        }
        Ok(())
    }

    /// Build a filter from `name=value` pairs, e.g. decoded query parameters
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, QueryError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut filter = Self::default();
        for (name, value) in pairs {
            filter.set(name, value)?;
        }
        Ok(filter)
    }

    pub fn has_header_predicate(&self) -> bool {
        self.header_key.is_some() || self.header_value.is_some()
    }

    pub fn has_request_predicate(&self) -> bool {
        self.start.is_some()
            || self.end.is_some()
            || self.address.is_some()
            || self.protocol.is_some()
            || self.method.is_some()
            || self.url.is_some()
    }

    /// Request-side clauses, qualified with the `r` alias
    fn request_clauses(&self, clauses: &mut Vec<String>, params: &mut Vec<Box<dyn ToSql>>) {
        if let Some(start) = self.start {
            clauses.push("r.timestamp > ?".to_string());
            params.push(Box::new(start));
        }
        if let Some(end) = self.end {
            clauses.push("r.timestamp < ?".to_string());
            params.push(Box::new(end));
        }
        let columns = [
            ("address", &self.address),
            ("protocol", &self.protocol),
            ("method", &self.method),
            ("url", &self.url),
        ];
        for (column, value) in columns {
            if let Some(value) = value {
                clauses.push(format!("r.{} = ?", column));
                params.push(Box::new(value.clone()));
            }
        }
    }

    /// Header-side clauses, qualified with the `h` alias
    fn header_clauses(&self, clauses: &mut Vec<String>, params: &mut Vec<Box<dyn ToSql>>) {
        if let Some(ref key) = self.header_key {
            clauses.push("h.key = ?".to_string());
            params.push(Box::new(key.clone()));
        }
        if let Some(ref value) = self.header_value {
            clauses.push("h.value = ?".to_string());
            params.push(Box::new(value.clone()));
        }
    }
}

fn parse_bound(name: &'static str, value: &str) -> Result<Option<i64>, QueryError> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .trim()
        .parse::<i64>()
        .map(Some)
        .map_err(|_| QueryError::InvalidTimestamp {
            name,
            value: value.to_string(),
        })
}

/// What a query returns: raw requests, or counts grouped by one column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dimension {
    Requests,
    Address,
    Protocol,
    Method,
    Url,
    HeaderKey,
    HeaderValue,
}

impl Dimension {
    pub const ALL: [Dimension; 7] = [
        Dimension::Requests,
        Dimension::Address,
        Dimension::Protocol,
        Dimension::Method,
        Dimension::Url,
        Dimension::HeaderKey,
        Dimension::HeaderValue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Requests => "requests",
            Dimension::Address => "address",
            Dimension::Protocol => "protocol",
            Dimension::Method => "method",
            Dimension::Url => "url",
            Dimension::HeaderKey => "header-key",
            Dimension::HeaderValue => "header-value",
        }
    }

    /// Qualified column for aggregate dimensions
    fn column(&self) -> Option<&'static str> {
        match self {
            Dimension::Requests => None,
            Dimension::Address => Some("r.address"),
            Dimension::Protocol => Some("r.protocol"),
            Dimension::Method => Some("r.method"),
            Dimension::Url => Some("r.url"),
            Dimension::HeaderKey => Some("h.key"),
            Dimension::HeaderValue => Some("h.value"),
        }
    }

    pub fn is_header_side(&self) -> bool {
        matches!(self, Dimension::HeaderKey | Dimension::HeaderValue)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dimension {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dimension::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| QueryError::UnknownDimension(s.to_string()))
    }
}

/// SQL text plus its positional parameters
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<Box<dyn ToSql>>,
}

impl SqlQuery {
    pub fn param_refs(&self) -> Vec<&dyn ToSql> {
        self.params.iter().map(|p| p.as_ref()).collect()
    }
}

impl fmt::Debug for SqlQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlQuery")
            .field("sql", &self.sql)
            .field("params", &self.params.len())
            .finish()
    }
}

/// Composes the SQL for one filter and dimension
pub struct QueryBuilder<'a> {
    filter: &'a RequestFilter,
    dimension: Dimension,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(filter: &'a RequestFilter, dimension: Dimension) -> Self {
        Self { filter, dimension }
    }

    pub fn build(&self) -> SqlQuery {
        match self.dimension.column() {
            None => self.build_requests(),
            Some(column) if self.dimension.is_header_side() => self.build_header_groups(column),
            Some(column) => self.build_request_groups(column),
        }
    }

    /// Raw request rows, with the owning file name
    fn build_requests(&self) -> SqlQuery {
        let mut sql = String::from(
            "SELECT DISTINCT r.id, f.name, r.timestamp, r.source, r.address, r.protocol, \
             r.method, r.host, r.url FROM requests r INNER JOIN log_files f ON f.id = r.file_id",
        );
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        self.push_header_join(&mut sql, &mut params);
        self.push_request_where(&mut sql, &mut params);

        sql.push_str(" ORDER BY r.timestamp ASC, r.id ASC");
        SqlQuery { sql, params }
    }

    /// Counts grouped by a request column; headers join in only when filtered on
    fn build_request_groups(&self, column: &str) -> SqlQuery {
        let mut sql = format!(
            "SELECT {col} AS group_value, COUNT(DISTINCT r.id) AS group_count FROM requests r",
            col = column
        );
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        self.push_header_join(&mut sql, &mut params);
        self.push_request_where(&mut sql, &mut params);
        push_grouping(&mut sql, column);

        SqlQuery { sql, params }
    }

    /// Counts grouped by a header column; requests join in only when filtered on
    fn build_header_groups(&self, column: &str) -> SqlQuery {
        let mut sql = format!(
            "SELECT {col} AS group_value, COUNT(h.id) AS group_count FROM headers h",
            col = column
        );
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if self.filter.has_request_predicate() {
            let mut clauses = vec!["r.id = h.request_id".to_string()];
            self.filter.request_clauses(&mut clauses, &mut params);
            sql.push_str(" INNER JOIN requests r ON ");
            sql.push_str(&clauses.join(" AND "));
        }

        let mut clauses = Vec::new();
        self.filter.header_clauses(&mut clauses, &mut params);
        push_where(&mut sql, &clauses);
        push_grouping(&mut sql, column);

        SqlQuery { sql, params }
    }

    fn push_header_join(&self, sql: &mut String, params: &mut Vec<Box<dyn ToSql>>) {
        if !self.filter.has_header_predicate() {
            return;
        }
        let mut clauses = vec!["h.request_id = r.id".to_string()];
        self.filter.header_clauses(&mut clauses, params);
        sql.push_str(" INNER JOIN headers h ON ");
        sql.push_str(&clauses.join(" AND "));
    }

    fn push_request_where(&self, sql: &mut String, params: &mut Vec<Box<dyn ToSql>>) {
        let mut clauses = Vec::new();
        self.filter.request_clauses(&mut clauses, params);
        push_where(sql, &clauses);
    }
}

fn push_where(sql: &mut String, clauses: &[String]) {
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
}

fn push_grouping(sql: &mut String, column: &str) {
    sql.push_str(&format!(
        " GROUP BY {col} ORDER BY group_count DESC, group_value ASC LIMIT {limit}",
        col = column,
        limit = GROUP_LIMIT
    ));
}

// ============================================================================
// Results
// ============================================================================

/// One stored request, as returned by the raw dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestRow {
    pub id: i64,
    pub file: String,
    pub timestamp: i64,
    pub source: String,
    pub address: String,
    pub protocol: String,
    pub method: String,
    pub host: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
}

/// Raw request rows with the observed time span
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestPage {
    pub total: usize,
    /// Earliest timestamp in the page, `None` when empty
    pub start: Option<i64>,
    /// Latest timestamp in the page, `None` when empty
    pub end: Option<i64>,
    pub rows: Vec<RequestRow>,
}

impl RequestPage {
    pub fn push(&mut self, row: RequestRow) {
        self.total += 1;
        self.start = Some(self.start.map_or(row.timestamp, |s| s.min(row.timestamp)));
        self.end = Some(self.end.map_or(row.timestamp, |e| e.max(row.timestamp)));
        self.rows.push(row);
    }
}

/// One group of an aggregate query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupCount {
    pub value: String,
    pub count: u64,
}

/// Grouped counts, ordered by count descending
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Aggregate {
    pub dimension: Dimension,
    /// Sum of all group counts
    pub total: u64,
    /// Largest group count, for scaling charts
    pub limit: u64,
    pub rows: Vec<GroupCount>,
}

impl Aggregate {
    pub fn new(dimension: Dimension) -> Self {
        Self {
            dimension,
            total: 0,
            limit: 0,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, group: GroupCount) {
        self.total += group.count;
        self.limit = self.limit.max(group.count);
        self.rows.push(group);
    }

    pub fn count_of(&self, value: &str) -> Option<u64> {
        self.rows.iter().find(|g| g.value == value).map(|g| g.count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum QueryResult {
    Requests(RequestPage),
    Groups(Aggregate),
}
