//! # Wire Data Model
//!
//! Request and response types shared by the endpoint and the replicated
//! store, plus the log entry that carries a request through consensus.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{ReplisqlError, Result};

/// Read consistency requested by a query, ordered by strictness.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ConsistencyLevel {
    /// Serve from local state; no freshness guarantee
    None,
    /// Serve on the current leader without a quorum round
    #[default]
    Weak,
    /// Serve only after a quorum round trip through the log
    Strong,
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyLevel::None => write!(f, "none"),
            ConsistencyLevel::Weak => write!(f, "weak"),
            ConsistencyLevel::Strong => write!(f, "strong"),
        }
    }
}

/// A single column value returned by a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

/// Outcome of one statement that changes rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SqlResult {
    pub last_insert_id: i64,
    pub rows_affected: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Elapsed seconds, present when timings were requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
}

impl SqlResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Outcome of one statement that returns rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SqlRows {
    pub columns: Vec<String>,
    pub types: Vec<String>,
    pub values: Vec<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
}

impl SqlRows {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Statements that modify the database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub queries: Vec<String>,
    pub atomic: bool,
    pub timings: bool,
}

impl ExecuteRequest {
    pub fn new<I, S>(queries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queries: queries.into_iter().map(Into::into).collect(),
            atomic: false,
            timings: false,
        }
    }

    /// Run the whole batch inside one transaction.
    pub fn atomic(mut self) -> Self {
        self.atomic = true;
        self
    }

    pub fn with_timings(mut self) -> Self {
        self.timings = true;
        self
    }
}

/// Statements that return rows and do not modify the database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub queries: Vec<String>,
    pub atomic: bool,
    pub timings: bool,
    pub level: ConsistencyLevel,
}

impl QueryRequest {
    pub fn new<I, S>(queries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queries: queries.into_iter().map(Into::into).collect(),
            atomic: false,
            timings: false,
            level: ConsistencyLevel::default(),
        }
    }

    pub fn atomic(mut self) -> Self {
        self.atomic = true;
        self
    }

    pub fn with_timings(mut self) -> Self {
        self.timings = true;
        self
    }

    pub fn with_level(mut self, level: ConsistencyLevel) -> Self {
        self.level = level;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub results: Vec<SqlResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecuteResponse {
    /// Response describing a batch that could not run at all.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// True if the batch or any of its statements reported an error.
    pub fn has_errors(&self) -> bool {
        self.error.is_some() || self.results.iter().any(|r| r.error.is_some())
    }

    pub fn first_error(&self) -> Option<&str> {
        self.error
            .as_deref()
            .or_else(|| self.results.iter().find_map(|r| r.error.as_deref()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub rows: Vec<SqlRows>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResponse {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn has_errors(&self) -> bool {
        self.error.is_some() || self.rows.iter().any(|r| r.error.is_some())
    }

    pub fn first_error(&self) -> Option<&str> {
        self.error
            .as_deref()
            .or_else(|| self.rows.iter().find_map(|r| r.error.as_deref()))
    }
}

/// A client request packaged for the consensus log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntry {
    Execute(ExecuteRequest),
    /// Execute, rolling back any open transaction if anything fails
    ExecuteOrAbort(ExecuteRequest),
    Query(QueryRequest),
}

impl LogEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            LogEntry::Execute(_) => "execute",
            LogEntry::ExecuteOrAbort(_) => "execute_or_abort",
            LogEntry::Query(_) => "query",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| {
            ReplisqlError::serialization(format!("Failed to encode log entry: {}", e))
        })
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| {
            ReplisqlError::serialization(format!("Failed to decode log entry: {}", e))
        })
    }
}

/// What the state machine returns after applying a committed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    Execute(ExecuteResponse),
    Query(QueryResponse),
}

impl ApplyOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            ApplyOutcome::Execute(_) => "execute",
            ApplyOutcome::Query(_) => "query",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consistency_levels_are_ordered() {
        assert!(ConsistencyLevel::None < ConsistencyLevel::Weak);
        assert!(ConsistencyLevel::Weak < ConsistencyLevel::Strong);
        assert_eq!(ConsistencyLevel::default(), ConsistencyLevel::Weak);
    }

    #[test]
    fn test_log_entry_encoding() {
        let entry = LogEntry::Query(
            QueryRequest::new(["SELECT * FROM foo"])
                .atomic()
                .with_level(ConsistencyLevel::Strong),
        );
        let bytes = entry.to_bytes().unwrap();
        assert_eq!(LogEntry::from_bytes(&bytes).unwrap(), entry);

        assert!(matches!(
            LogEntry::from_bytes(&[0xff, 0xff, 0xff]),
            Err(ReplisqlError::Serialization { .. })
        ));
    }

    #[test]
    fn test_response_error_helpers() {
        let mut response = ExecuteResponse {
            results: vec![SqlResult::default(), SqlResult::failed("near \"INSRT\": syntax error")],
            ..Default::default()
        };
        assert!(response.has_errors());
        assert_eq!(response.first_error(), Some("near \"INSRT\": syntax error"));

        response.results.pop();
        assert!(!response.has_errors());

        let failed = QueryResponse::failed("store closed");
        assert_eq!(failed.first_error(), Some("store closed"));
    }

    #[test]
    fn test_omitted_fields_in_json() {
        let json = serde_json::to_string(&SqlResult {
            last_insert_id: 1,
            rows_affected: 1,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(json, r#"{"last_insert_id":1,"rows_affected":1}"#);
    }
}
