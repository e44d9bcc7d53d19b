use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Per-query error string the backend uses when its concurrent-query limit rejects a start.
pub const RATE_LIMIT_ERROR: &str = "LimitExceededException";

/// One caller-specified log query, before interpolation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogQuery {
    pub ref_id: String,
    pub expression: String,
    #[serde(default)]
    pub log_group_names: Vec<String>,
    /// `None` or `"default"` means the configured default region.
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub stats_groups: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// The window ending now and reaching `window` into the past.
    pub fn last(window: Duration) -> Self {
        let to = Utc::now();
        let span = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let from = to.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self { from, to }
    }

    pub fn validate(&self) -> Result<(), QueryError> {
        if self.from >= self.to {
            return Err(QueryError::invalid(
                "invalid time range: start time must be before end time",
            ));
        }
        Ok(())
    }
}

/// A sub-query ready to submit. Built once per caller query and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubQueryTask {
    pub ref_id: String,
    pub query_string: String,
    pub region: String,
    pub log_group_names: Vec<String>,
    #[serde(default)]
    pub is_stats_query: bool,
}

/// A task the backend accepted during submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedQuery {
    pub ref_id: String,
    pub query_id: String,
    pub region: String,
}

/// Per-refId outcome of a start request, as the backend reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of a start reply, and the payload of a failed start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResults {
    pub results: BTreeMap<String, StartResult>,
}

/// A submitted query that has not reached a terminal status yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningQuery {
    pub ref_id: String,
    #[serde(rename = "queryId")]
    pub id: String,
    pub region: String,
    #[serde(default)]
    pub is_stats_query: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryStatus {
    Scheduled,
    Running,
    Complete,
    Failed,
    Cancelled,
    Timeout,
    #[serde(other)]
    Unknown,
}

impl QueryStatus {
    /// Complete, Failed and Cancelled end polling for a query. A backend
    /// `Timeout` does not: the query is still polled until the shared deadline.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueryStatus::Complete | QueryStatus::Failed | QueryStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueryStatus::Scheduled => "Scheduled",
            QueryStatus::Running => "Running",
            QueryStatus::Complete => "Complete",
            QueryStatus::Failed => "Failed",
            QueryStatus::Cancelled => "Cancelled",
            QueryStatus::Timeout => "Timeout",
            QueryStatus::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStats {
    #[serde(default)]
    pub records_scanned: Option<f64>,
    #[serde(default)]
    pub records_matched: Option<f64>,
    #[serde(default)]
    pub bytes_scanned: Option<f64>,
}

/// Latest known result set and status of one sub-query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollFrame {
    pub ref_id: String,
    pub status: QueryStatus,
    #[serde(default)]
    pub stats: QueryStats,
    #[serde(default)]
    pub records: Vec<Map<String, Value>>,
}

impl PollFrame {
    pub fn new(ref_id: impl Into<String>, status: QueryStatus) -> Self {
        Self {
            ref_id: ref_id.into(),
            status,
            stats: QueryStats::default(),
            records: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadingState {
    Loading,
    Done,
}

/// One emission of the result stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResponse {
    pub frames: Vec<PollFrame>,
    pub state: LoadingState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryError>,
}

impl AggregatedResponse {
    pub fn done(frames: Vec<PollFrame>) -> Self {
        Self {
            frames,
            state: LoadingState::Done,
            error: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == LoadingState::Done
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// The shared deadline passed before every sub-query finished.
    Timeout,
    /// Backend rejected or failed the work; never retried.
    Fatal,
    /// Caller input was rejected before any request.
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
#[serde(rename_all = "camelCase")]
pub struct QueryError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ref_ids: Vec<String>,
}

impl QueryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            ref_ids: Vec::new(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invalid, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn with_ref_ids(mut self, ref_ids: Vec<String>) -> Self {
        self.ref_ids = ref_ids;
        self
    }

    /// Folds `other` into `self`, keeping `self`'s kind.
    pub fn merge(mut self, other: QueryError) -> Self {
        self.message = format!("{}; {}", self.message, other.message);
        for ref_id in other.ref_ids {
            if !self.ref_ids.contains(&ref_id) {
                self.ref_ids.push(ref_id);
            }
        }
        self
    }
}
