//! Coordination engine for long-running log queries: submission with
//! rate-limit retry, tick-scheduled polling, result aggregation and
//! cancellation.

mod backend;
mod deadline;
mod poller;
mod remote;
mod retry;
mod runner;
mod tasks;
#[cfg(test)]
mod testing;
mod ticker;
mod types;

pub use backend::{BackendError, LogsBackend};
pub use deadline::{parse_logs_timeout, Deadline, DeadlineCheck, DEFAULT_LOGS_TIMEOUT};
pub use remote::HttpLogsBackend;
pub use runner::{LogsQueryRunner, QueryItem, QueryStream, RunnerSettings};
pub use tasks::ref_id_for;
pub use types::{
    AggregatedResponse, ErrorKind, LoadingState, LogQuery, PollFrame, QueryError, QueryStats,
    QueryStatus, RunningQuery, TimeRange,
};
