//! Scripted in-memory backend shared by the engine's unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

use super::backend::{BackendError, LogsBackend};
use super::types::{
    PollFrame, QueryStats, QueryStatus, RunningQuery, StartedQuery, SubQueryTask, TimeRange,
    RATE_LIMIT_ERROR,
};

pub type StartReply = Result<Vec<StartedQuery>, BackendError>;
pub type PollReply = Result<Vec<PollFrame>, BackendError>;

#[derive(Default)]
struct Script {
    starts: VecDeque<StartReply>,
    polls: VecDeque<PollReply>,
    start_calls: Vec<Vec<String>>,
    poll_calls: Vec<Vec<String>>,
    stop_calls: Vec<Vec<String>>,
    fail_stop: bool,
    poll_gate: Option<Arc<Notify>>,
}

/// Replays queued replies in order and records every call's refIds.
///
/// With an empty start queue every task is accepted; with an empty poll queue
/// every polled query reports `Running`.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    script: Arc<Mutex<Script>>,
    stopped: Arc<Notify>,
    polled: Arc<Notify>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_start(&self, reply: StartReply) -> &Self {
        self.lock().starts.push_back(reply);
        self
    }

    pub fn push_poll(&self, reply: PollReply) -> &Self {
        self.lock().polls.push_back(reply);
        self
    }

    pub fn fail_stop(&self) -> &Self {
        self.lock().fail_stop = true;
        self
    }

    /// Results requests are recorded and then hang until the caller goes away.
    pub fn block_polls(&self) -> &Self {
        self.lock().poll_gate = Some(Arc::new(Notify::new()));
        self
    }

    pub fn start_calls(&self) -> Vec<Vec<String>> {
        self.lock().start_calls.clone()
    }

    pub fn poll_calls(&self) -> Vec<Vec<String>> {
        self.lock().poll_calls.clone()
    }

    pub fn stop_calls(&self) -> Vec<Vec<String>> {
        self.lock().stop_calls.clone()
    }

    pub async fn wait_for_stop(&self) {
        let notified = self.stopped.notified();
        if !self.lock().stop_calls.is_empty() {
            return;
        }
        notified.await;
    }

    pub async fn wait_for_poll(&self) {
        let notified = self.polled.notified();
        if !self.lock().poll_calls.is_empty() {
            return;
        }
        notified.await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|err| err.into_inner())
    }
}

#[async_trait]
impl LogsBackend for ScriptedBackend {
    async fn start_query(
        &self,
        _range: &TimeRange,
        tasks: &[SubQueryTask],
    ) -> Result<Vec<StartedQuery>, BackendError> {
        let mut script = self.lock();
        script
            .start_calls
            .push(tasks.iter().map(|t| t.ref_id.clone()).collect());
        script
            .starts
            .pop_front()
            .unwrap_or_else(|| Ok(tasks.iter().map(started).collect()))
    }

    async fn get_query_results(
        &self,
        queries: &[RunningQuery],
    ) -> Result<Vec<PollFrame>, BackendError> {
        let gate = {
            let mut script = self.lock();
            script
                .poll_calls
                .push(queries.iter().map(|q| q.ref_id.clone()).collect());
            script.poll_gate.clone()
        };
        self.polled.notify_waiters();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.lock().polls.pop_front().unwrap_or_else(|| {
            Ok(queries
                .iter()
                .map(|q| PollFrame::new(q.ref_id.clone(), QueryStatus::Running))
                .collect())
        })
    }

    async fn stop_query(&self, queries: &[RunningQuery]) -> Result<(), BackendError> {
        let fail = {
            let mut script = self.lock();
            script
                .stop_calls
                .push(queries.iter().map(|q| q.ref_id.clone()).collect());
            script.fail_stop
        };
        self.stopped.notify_waiters();
        if fail {
            return Err(BackendError::new("stop failed").with_status(500));
        }
        Ok(())
    }
}

pub fn task(ref_id: &str) -> SubQueryTask {
    SubQueryTask {
        ref_id: ref_id.to_string(),
        query_string: "fields @message".to_string(),
        region: "us-east-2".to_string(),
        log_group_names: vec!["/aws/lambda/app".to_string()],
        is_stats_query: false,
    }
}

pub fn started(task: &SubQueryTask) -> StartedQuery {
    StartedQuery {
        ref_id: task.ref_id.clone(),
        query_id: format!("qid-{}", task.ref_id),
        region: task.region.clone(),
    }
}

pub fn frame(ref_id: &str, status: QueryStatus) -> PollFrame {
    PollFrame::new(ref_id, status)
}

pub fn scanned(ref_id: &str, status: QueryStatus, records: f64) -> PollFrame {
    PollFrame {
        stats: QueryStats {
            records_scanned: Some(records),
            ..QueryStats::default()
        },
        ..PollFrame::new(ref_id, status)
    }
}

/// A failed start where `accepted` got query ids and `limited` hit the rate limit.
pub fn rate_limited(accepted: &[&str], limited: &[&str]) -> BackendError {
    let mut results = serde_json::Map::new();
    for ref_id in accepted {
        results.insert(
            ref_id.to_string(),
            json!({"queryId": format!("qid-{ref_id}"), "region": "us-east-2"}),
        );
    }
    for ref_id in limited {
        results.insert(
            ref_id.to_string(),
            json!({"error": format!("{RATE_LIMIT_ERROR}: too many concurrent queries")}),
        );
    }
    BackendError::new("some queries failed to start")
        .with_status(400)
        .with_payload(json!({ "results": results }))
}
