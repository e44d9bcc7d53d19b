use async_trait::async_trait;
use serde_json::Value;

use super::types::{PollFrame, QueryError, RunningQuery, StartedQuery, SubQueryTask, TimeRange};

/// Transport-level failure of one remote operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    pub status: Option<u16>,
    /// Structured body, when the backend returned one. A failed start carries
    /// per-refId results here.
    pub payload: Option<Value>,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            payload: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

impl From<BackendError> for QueryError {
    fn from(err: BackendError) -> Self {
        match err.status {
            Some(status) => QueryError::fatal(format!("{} (status {status})", err.message)),
            None => QueryError::fatal(err.message),
        }
    }
}

/// The remote operations the coordination engine consumes.
#[async_trait]
pub trait LogsBackend: Send + Sync {
    /// Starts every task in one batch.
    async fn start_query(
        &self,
        range: &TimeRange,
        tasks: &[SubQueryTask],
    ) -> Result<Vec<StartedQuery>, BackendError>;

    /// Fetches the current frame of every listed query in one batch.
    async fn get_query_results(
        &self,
        queries: &[RunningQuery],
    ) -> Result<Vec<PollFrame>, BackendError>;

    /// Asks the backend to stop the listed queries. Callers treat this as fire-and-forget.
    async fn stop_query(&self, queries: &[RunningQuery]) -> Result<(), BackendError>;
}
