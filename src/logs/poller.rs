use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::backend::LogsBackend;
use super::deadline::DeadlineCheck;
use super::ticker::{PollCadence, Ticker};
use super::types::{
    AggregatedResponse, LoadingState, PollFrame, QueryError, QueryStatus, RunningQuery,
    StartedQuery, SubQueryTask,
};

/// In-flight queries of one polling session, keyed by refId.
///
/// An entry exists exactly while its latest known frame is non-terminal.
#[derive(Debug, Default)]
pub struct Registry {
    running: BTreeMap<String, RunningQuery>,
}

impl Registry {
    pub fn new(tasks: &[SubQueryTask], started: Vec<StartedQuery>) -> Self {
        let running = started
            .into_iter()
            .map(|s| {
                let is_stats_query = tasks
                    .iter()
                    .any(|t| t.ref_id == s.ref_id && t.is_stats_query);
                let query = RunningQuery {
                    ref_id: s.ref_id.clone(),
                    id: s.query_id,
                    region: s.region,
                    is_stats_query,
                };
                (s.ref_id, query)
            })
            .collect();
        Self { running }
    }

    pub fn queries(&self) -> Vec<RunningQuery> {
        self.running.values().cloned().collect()
    }

    #[cfg(test)]
    pub fn ref_ids(&self) -> Vec<String> {
        self.running.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    fn retire(&mut self, ref_id: &str) {
        self.running.remove(ref_id);
    }

    fn drain(&mut self) -> Vec<RunningQuery> {
        std::mem::take(&mut self.running).into_values().collect()
    }
}

/// Counts consecutive ticks in which no query's records-scanned metric advanced.
///
/// Diagnostic only: the count is reported in timeout errors and never
/// shortens the deadline.
#[derive(Debug, Default)]
pub struct StallDetector {
    last_scanned: HashMap<String, f64>,
    stalled_ticks: u32,
}

impl StallDetector {
    pub fn observe(&mut self, frames: &[PollFrame]) -> u32 {
        self.stalled_ticks = self.stalled_ticks.saturating_add(1);
        for frame in frames {
            let Some(scanned) = frame.stats.records_scanned else {
                self.last_scanned.remove(&frame.ref_id);
                continue;
            };
            let previous = self.last_scanned.get(&frame.ref_id).copied().unwrap_or(0.0);
            if scanned > previous {
                self.stalled_ticks = 0;
            }
            self.last_scanned.insert(frame.ref_id.clone(), scanned);
        }
        self.stalled_ticks
    }

    #[cfg(test)]
    pub fn stalled_ticks(&self) -> u32 {
        self.stalled_ticks
    }
}

/// Merges per-tick frames into the caller-facing response.
#[derive(Debug)]
pub struct Aggregator {
    expected: Vec<String>,
    latest: HashMap<String, PollFrame>,
}

impl Aggregator {
    pub fn new(expected: Vec<String>) -> Self {
        Self {
            expected,
            latest: HashMap::new(),
        }
    }

    /// The latest frame per refId wins. Terminal refIds leave `registry`; once
    /// the deadline has passed every non-terminal frame is forced to Cancelled.
    pub fn aggregate(
        &mut self,
        frames: Vec<PollFrame>,
        stalled_ticks: u32,
        deadline_exceeded: bool,
        registry: &mut Registry,
    ) -> AggregatedResponse {
        for frame in frames {
            if !self.expected.contains(&frame.ref_id) {
                debug!(ref_id = %frame.ref_id, "ignoring frame for unknown query");
                continue;
            }
            if frame.status.is_terminal() {
                registry.retire(&frame.ref_id);
            }
            self.latest.insert(frame.ref_id.clone(), frame);
        }

        let error = deadline_exceeded.then(|| self.force_cancel(stalled_ticks));

        let frames: Vec<PollFrame> = self
            .expected
            .iter()
            .filter_map(|ref_id| self.latest.get(ref_id).cloned())
            .collect();
        let done = frames.len() == self.expected.len()
            && frames.iter().all(|frame| frame.status.is_terminal());

        AggregatedResponse {
            frames,
            state: if done {
                LoadingState::Done
            } else {
                LoadingState::Loading
            },
            error,
        }
    }

    fn force_cancel(&mut self, stalled_ticks: u32) -> QueryError {
        let mut unfinished = Vec::new();
        for ref_id in &self.expected {
            let frame = self
                .latest
                .entry(ref_id.clone())
                .or_insert_with(|| PollFrame::new(ref_id.clone(), QueryStatus::Scheduled));
            if !frame.status.is_terminal() {
                frame.status = QueryStatus::Cancelled;
                unfinished.push(ref_id.clone());
            }
        }
        QueryError::timeout(format!(
            "query hit the timeout before completing ({stalled_ticks} consecutive polls without progress); \
             partial results may be shown, raise logs_timeout to allow more time"
        ))
        .with_ref_ids(unfinished)
    }
}

/// Drives one polling session from the accepted queries to a terminal response.
///
/// The session exclusively owns its registry; a new invocation always starts
/// a fresh one.
pub struct PollSession {
    backend: Arc<dyn LogsBackend>,
    deadline: Arc<dyn DeadlineCheck>,
    registry: Registry,
    stall: StallDetector,
    aggregator: Aggregator,
    ticker: Ticker,
    started_at: Instant,
}

impl PollSession {
    pub fn new(
        backend: Arc<dyn LogsBackend>,
        deadline: Arc<dyn DeadlineCheck>,
        cadence: PollCadence,
        tasks: &[SubQueryTask],
        started: Vec<StartedQuery>,
    ) -> Self {
        let expected = started.iter().map(|s| s.ref_id.clone()).collect();
        Self {
            backend,
            deadline,
            registry: Registry::new(tasks, started),
            stall: StallDetector::default(),
            aggregator: Aggregator::new(expected),
            ticker: Ticker::new(cadence),
            started_at: Instant::now(),
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Waits for the next tick, issues one batched results request for every
    /// registered query and folds the reply into a response.
    ///
    /// Cancel-safe: the registry and aggregate only change after the reply
    /// has arrived, so dropping this mid-request leaves teardown accurate.
    pub async fn next_response(&mut self) -> Result<AggregatedResponse, QueryError> {
        let tick = self.ticker.tick().await;
        let queries = self.registry.queries();
        debug!(tick, queries = queries.len(), "polling query results");

        let frames = if queries.is_empty() {
            Vec::new()
        } else {
            self.backend.get_query_results(&queries).await?
        };

        let stalled_ticks = self.stall.observe(&frames);
        let attempt = u32::try_from(self.ticker.fired()).unwrap_or(u32::MAX);
        let deadline_exceeded = self.deadline.is_exceeded(attempt, self.started_at);
        if deadline_exceeded {
            warn!(
                stalled_ticks,
                unfinished = self.registry.len(),
                "deadline reached while polling, cancelling unfinished queries"
            );
        }

        Ok(self
            .aggregator
            .aggregate(frames, stalled_ticks, deadline_exceeded, &mut self.registry))
    }

    /// Teardown: one best-effort stop request for everything still registered.
    pub async fn shutdown(mut self) {
        let remaining = self.registry.drain();
        if remaining.is_empty() {
            return;
        }
        debug!(queries = remaining.len(), "stopping unfinished queries");
        if let Err(err) = self.backend.stop_query(&remaining).await {
            warn!(error = %err, "failed to stop unfinished queries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::backend::BackendError;
    use crate::logs::testing::{frame, scanned, started, task, ScriptedBackend};
    use crate::logs::types::ErrorKind;

    fn session(
        backend: &ScriptedBackend,
        refs: &[&str],
        deadline: Arc<dyn DeadlineCheck>,
    ) -> PollSession {
        let tasks: Vec<SubQueryTask> = refs.iter().map(|r| task(r)).collect();
        let accepted = tasks.iter().map(started).collect();
        PollSession::new(
            Arc::new(backend.clone()),
            deadline,
            PollCadence::default(),
            &tasks,
            accepted,
        )
    }

    fn never() -> Arc<dyn DeadlineCheck> {
        Arc::new(|_: u32, _: Instant| false)
    }

    #[test]
    fn registry_marks_stats_queries() {
        let mut stats = task("A");
        stats.is_stats_query = true;
        let tasks = vec![stats, task("B")];
        let registry = Registry::new(&tasks, tasks.iter().map(started).collect());
        let queries = registry.queries();
        assert!(queries[0].is_stats_query);
        assert!(!queries[1].is_stats_query);
        assert_eq!(queries[0].id, "qid-A");
    }

    #[test]
    fn stall_counter_resets_on_any_progress() {
        let mut stall = StallDetector::default();
        assert_eq!(stall.observe(&[scanned("A", QueryStatus::Running, 10.0)]), 0);
        assert_eq!(stall.observe(&[scanned("A", QueryStatus::Running, 10.0)]), 1);
        assert_eq!(stall.observe(&[scanned("A", QueryStatus::Running, 10.0)]), 2);
        assert_eq!(
            stall.observe(&[
                scanned("A", QueryStatus::Running, 10.0),
                scanned("B", QueryStatus::Running, 1.0),
            ]),
            0
        );
        assert_eq!(stall.observe(&[frame("A", QueryStatus::Running)]), 1);
        assert_eq!(stall.stalled_ticks(), 1);
    }

    #[test]
    fn stall_counter_counts_zero_progress_from_start() {
        let mut stall = StallDetector::default();
        for expected in 1..=5 {
            assert_eq!(stall.observe(&[scanned("A", QueryStatus::Running, 0.0)]), expected);
        }
    }

    #[test]
    fn aggregator_keeps_latest_frame_and_retires_terminal() {
        let tasks = vec![task("A"), task("B")];
        let mut registry = Registry::new(&tasks, tasks.iter().map(started).collect());
        let mut aggregator = Aggregator::new(vec!["A".into(), "B".into()]);

        let first = aggregator.aggregate(
            vec![frame("A", QueryStatus::Complete), frame("B", QueryStatus::Running)],
            0,
            false,
            &mut registry,
        );
        assert_eq!(first.state, LoadingState::Loading);
        assert_eq!(registry.ref_ids(), vec!["B".to_string()]);

        let second =
            aggregator.aggregate(vec![frame("B", QueryStatus::Failed)], 0, false, &mut registry);
        assert_eq!(second.state, LoadingState::Done);
        assert!(registry.is_empty());
        let statuses: Vec<QueryStatus> = second.frames.iter().map(|f| f.status).collect();
        assert_eq!(statuses, vec![QueryStatus::Complete, QueryStatus::Failed]);
        assert!(second.error.is_none());
    }

    #[test]
    fn aggregator_waits_for_missing_frames() {
        let tasks = vec![task("A"), task("B")];
        let mut registry = Registry::new(&tasks, tasks.iter().map(started).collect());
        let mut aggregator = Aggregator::new(vec!["A".into(), "B".into()]);

        let response =
            aggregator.aggregate(vec![frame("A", QueryStatus::Complete)], 0, false, &mut registry);
        assert_eq!(response.state, LoadingState::Loading);
        assert_eq!(response.frames.len(), 1);
    }

    #[test]
    fn deadline_forces_cancelled_and_keeps_registry() {
        let tasks = vec![task("A"), task("B")];
        let mut registry = Registry::new(&tasks, tasks.iter().map(started).collect());
        let mut aggregator = Aggregator::new(vec!["A".into(), "B".into()]);

        let response = aggregator.aggregate(
            vec![frame("A", QueryStatus::Complete), frame("B", QueryStatus::Running)],
            4,
            true,
            &mut registry,
        );

        assert_eq!(response.state, LoadingState::Done);
        assert_eq!(response.frames[1].status, QueryStatus::Cancelled);
        let error = response.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Timeout);
        assert_eq!(error.ref_ids, vec!["B".to_string()]);
        assert!(error.message.contains("4 consecutive polls"));
        // Forced locally, so the backend query still needs a stop.
        assert_eq!(registry.ref_ids(), vec!["B".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_only_registered_queries() {
        let backend = ScriptedBackend::new();
        backend
            .push_poll(Ok(vec![
                frame("A", QueryStatus::Complete),
                frame("B", QueryStatus::Running),
            ]))
            .push_poll(Ok(vec![frame("B", QueryStatus::Complete)]));
        let mut session = session(&backend, &["A", "B"], never());

        let first = session.next_response().await.unwrap();
        assert!(!first.is_done());
        let second = session.next_response().await.unwrap();
        assert!(second.is_done());
        assert_eq!(second.frames.len(), 2);

        assert_eq!(
            backend.poll_calls(),
            vec![vec!["A".to_string(), "B".to_string()], vec!["B".to_string()]]
        );
        session.shutdown().await;
        assert!(backend.stop_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_failure_is_fatal() {
        let backend = ScriptedBackend::new();
        backend.push_poll(Err(BackendError::new("throttled").with_status(503)));
        let mut session = session(&backend, &["A"], never());

        let err = session.next_response().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Fatal);
        assert_eq!(session.registry().ref_ids(), vec!["A".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_remaining_and_swallows_failure() {
        let backend = ScriptedBackend::new();
        backend.fail_stop();
        let mut session = session(&backend, &["A", "B"], never());
        backend.push_poll(Ok(vec![frame("A", QueryStatus::Complete)]));
        session.next_response().await.unwrap();

        session.shutdown().await;
        assert_eq!(backend.stop_calls(), vec![vec!["B".to_string()]]);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_polls_reach_timeout_error() {
        let backend = ScriptedBackend::new();
        for _ in 0..5 {
            backend.push_poll(Ok(vec![scanned("A", QueryStatus::Running, 0.0)]));
        }
        let deadline: Arc<dyn DeadlineCheck> = Arc::new(|tick: u32, _: Instant| tick >= 5);
        let mut session = session(&backend, &["A"], deadline);

        let mut last = None;
        for _ in 0..5 {
            last = Some(session.next_response().await.unwrap());
        }
        let last = last.unwrap();
        assert!(last.is_done());
        assert_eq!(session.stall.stalled_ticks(), 5);
        assert!(last.error.unwrap().message.contains("5 consecutive polls"));
    }
}
