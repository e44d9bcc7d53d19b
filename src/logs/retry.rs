use std::collections::HashSet;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backend::{BackendError, LogsBackend};
use super::deadline::DeadlineCheck;
use super::types::{
    QueryError, RunningQuery, StartResults, StartedQuery, SubQueryTask, TimeRange,
    RATE_LIMIT_ERROR,
};

const RETRY_BASE_DELAY_SECS: u64 = 1;
const RETRY_MAX_JITTER_MS: u64 = 100;
const RETRY_MAX_BACKOFF_SECS: u64 = 60 * 60;

/// Backoff between rate-limited submissions: `base * 2^n` plus a small uniform jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_jitter: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(RETRY_BASE_DELAY_SECS),
            max_jitter: Duration::from_millis(RETRY_MAX_JITTER_MS),
            max_backoff: Duration::from_secs(RETRY_MAX_BACKOFF_SECS),
        }
    }
}

impl RetryPolicy {
    fn exponential(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(self.max_backoff)
            .with_max_elapsed_time(None)
            .build()
    }

    fn jitter(&self) -> Duration {
        let max_ms = u32::try_from(self.max_jitter.as_millis()).unwrap_or(u32::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        let roll = getrandom::u32().unwrap_or(0);
        Duration::from_millis(u64::from(roll % (max_ms + 1)))
    }
}

/// Terminal result of a submission run.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Every accepted task, plus a non-fatal error when some never started.
    Accepted {
        started: Vec<StartedQuery>,
        error: Option<QueryError>,
    },
    /// The run is over. `started` holds tasks accepted in earlier attempts or
    /// in the failing reply itself; they still run remotely.
    Failed {
        error: QueryError,
        started: Vec<StartedQuery>,
    },
    /// The caller detached; these tasks were already accepted and still run remotely.
    Cancelled(Vec<StartedQuery>),
}

/// A failed batch split by what each refId did in that attempt.
#[derive(Debug, Default, PartialEq)]
struct BatchSplit {
    good: Vec<StartedQuery>,
    retryable: HashSet<String>,
    failed: Vec<(String, String)>,
}

impl BatchSplit {
    /// `None` when the payload is missing or unparseable.
    fn from_error(err: &BackendError, pending: &[SubQueryTask]) -> Option<Self> {
        let payload: StartResults = serde_json::from_value(err.payload.clone()?).ok()?;
        let mut split = BatchSplit::default();

        for task in pending {
            let Some(entry) = payload.results.get(&task.ref_id) else {
                split
                    .failed
                    .push((task.ref_id.clone(), "no result returned".to_string()));
                continue;
            };
            match (&entry.query_id, &entry.error) {
                (_, Some(error)) if error.contains(RATE_LIMIT_ERROR) => {
                    split.retryable.insert(task.ref_id.clone());
                }
                (Some(query_id), None) => split.good.push(StartedQuery {
                    ref_id: task.ref_id.clone(),
                    query_id: query_id.clone(),
                    region: entry.region.clone().unwrap_or_else(|| task.region.clone()),
                }),
                (_, Some(error)) => split.failed.push((task.ref_id.clone(), error.clone())),
                (None, None) => split
                    .failed
                    .push((task.ref_id.clone(), "no query id returned".to_string())),
            }
        }
        Some(split)
    }
}

/// Accumulator threaded through the retry loop.
#[derive(Debug)]
struct RetryState {
    retries: u32,
    pending: Vec<SubQueryTask>,
    collected: Vec<StartedQuery>,
    failed: Vec<(String, String)>,
}

impl RetryState {
    fn new(tasks: Vec<SubQueryTask>) -> Self {
        Self {
            retries: 0,
            pending: tasks,
            collected: Vec::new(),
            failed: Vec::new(),
        }
    }

    fn absorb(&mut self, split: BatchSplit) {
        self.collected.extend(split.good);
        self.failed.extend(split.failed);
        self.pending
            .retain(|task| split.retryable.contains(&task.ref_id));
    }

    fn accept(mut self, started: Vec<StartedQuery>) -> SubmitOutcome {
        self.collected.extend(started);
        let error = self.failed_error();
        SubmitOutcome::Accepted {
            started: self.collected,
            error,
        }
    }

    fn fail(self, error: QueryError) -> SubmitOutcome {
        SubmitOutcome::Failed {
            error,
            started: self.collected,
        }
    }

    fn degrade(self) -> SubmitOutcome {
        let timed_out: Vec<String> = self.pending.iter().map(|t| t.ref_id.clone()).collect();
        let mut error = QueryError::timeout(format!(
            "some queries timed out before they could be started: {}",
            timed_out.join(", ")
        ))
        .with_ref_ids(timed_out);
        if let Some(failed) = self.failed_error() {
            error = error.merge(failed);
        }
        SubmitOutcome::Accepted {
            started: self.collected,
            error: Some(error),
        }
    }

    fn failed_error(&self) -> Option<QueryError> {
        if self.failed.is_empty() {
            return None;
        }
        let details: Vec<String> = self
            .failed
            .iter()
            .map(|(ref_id, reason)| format!("{ref_id}: {reason}"))
            .collect();
        Some(
            QueryError::fatal(format!("some queries failed to start ({})", details.join("; ")))
                .with_ref_ids(self.failed.iter().map(|(r, _)| r.clone()).collect()),
        )
    }
}

/// Submits `tasks`, retrying only the rate-limited subset until every task
/// is accepted or `deadline` reports the budget is spent.
///
/// Tasks accepted in any attempt are kept and never resubmitted. A pending
/// backoff timer or start request is abandoned as soon as `cancel` fires.
pub async fn submit(
    backend: &dyn LogsBackend,
    range: &TimeRange,
    tasks: Vec<SubQueryTask>,
    deadline: &dyn DeadlineCheck,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> SubmitOutcome {
    let started_at = Instant::now();
    let mut backoff = policy.exponential();
    let mut state = RetryState::new(tasks);

    loop {
        debug!(
            retries = state.retries,
            tasks = state.pending.len(),
            "starting log queries"
        );
        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => return SubmitOutcome::Cancelled(state.collected),
            result = backend.start_query(range, &state.pending) => result,
        };

        let err = match attempt {
            Ok(started) => return state.accept(started),
            Err(err) => err,
        };

        let Some(split) = BatchSplit::from_error(&err, &state.pending) else {
            debug!(error = %err, "start failed without a per-query breakdown");
            return state.fail(err.into());
        };
        let retryable = !split.retryable.is_empty();
        state.absorb(split);
        if !retryable {
            debug!(
                error = %err,
                accepted = state.collected.len(),
                "start failed without a rate-limit rejection"
            );
            return state.fail(err.into());
        }

        if deadline.is_exceeded(state.retries, started_at) {
            if state.collected.is_empty() {
                return state.fail(err.into());
            }
            warn!(
                accepted = state.collected.len(),
                timed_out = state.pending.len(),
                "deadline reached while retrying rate-limited queries"
            );
            return state.degrade();
        }

        let delay = backoff.next_backoff().unwrap_or(policy.max_backoff) + policy.jitter();
        debug!(
            retries = state.retries,
            delay_ms = delay.as_millis() as u64,
            retrying = state.pending.len(),
            "rate limited, backing off"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return SubmitOutcome::Cancelled(state.collected),
            _ = sleep(delay) => {}
        }
        state.retries += 1;
    }
}

/// Stops queries accepted before the run ended early. Best-effort.
pub(crate) async fn stop_started(backend: &dyn LogsBackend, started: Vec<StartedQuery>) {
    if started.is_empty() {
        return;
    }
    let queries: Vec<_> = started
        .into_iter()
        .map(|s| RunningQuery {
            ref_id: s.ref_id,
            id: s.query_id,
            region: s.region,
            is_stats_query: false,
        })
        .collect();
    if let Err(err) = backend.stop_query(&queries).await {
        warn!(error = %err, "failed to stop queries accepted before the run ended");
    }
}
