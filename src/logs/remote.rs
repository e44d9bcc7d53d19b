use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::backend::{BackendError, LogsBackend};
use super::types::{PollFrame, RunningQuery, StartResults, StartedQuery, SubQueryTask, TimeRange};
use crate::http::ApiClient;

const START_PATH: &str = "/logs/start";
const RESULTS_PATH: &str = "/logs/results";
const STOP_PATH: &str = "/logs/stop";

#[derive(Serialize)]
struct StartRequest<'a> {
    #[serde(flatten)]
    range: &'a TimeRange,
    queries: &'a [SubQueryTask],
}

#[derive(Serialize)]
struct QueriesRequest<'a> {
    queries: &'a [RunningQuery],
}

#[derive(Deserialize)]
struct ResultsResponse {
    #[serde(default)]
    frames: Vec<PollFrame>,
}

/// [`LogsBackend`] over the log query service's JSON API.
pub struct HttpLogsBackend {
    client: ApiClient,
}

impl HttpLogsBackend {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LogsBackend for HttpLogsBackend {
    async fn start_query(
        &self,
        range: &TimeRange,
        tasks: &[SubQueryTask],
    ) -> Result<Vec<StartedQuery>, BackendError> {
        let reply: StartResults = self
            .client
            .post(START_PATH, &StartRequest { range, queries: tasks })
            .await?;
        started_from_results(reply, tasks)
    }

    async fn get_query_results(
        &self,
        queries: &[RunningQuery],
    ) -> Result<Vec<PollFrame>, BackendError> {
        let reply: ResultsResponse = self
            .client
            .post(RESULTS_PATH, &QueriesRequest { queries })
            .await?;
        Ok(reply.frames)
    }

    async fn stop_query(&self, queries: &[RunningQuery]) -> Result<(), BackendError> {
        let _: Value = self
            .client
            .post(STOP_PATH, &QueriesRequest { queries })
            .await?;
        Ok(())
    }
}

/// A 2xx reply can still reject some refIds. Any rejection turns the whole
/// batch into an error carrying the reply as payload, so the retrier sees the
/// same shape as for a non-2xx failure.
fn started_from_results(
    reply: StartResults,
    tasks: &[SubQueryTask],
) -> Result<Vec<StartedQuery>, BackendError> {
    let mut started = Vec::with_capacity(tasks.len());
    for task in tasks {
        let accepted = reply
            .results
            .get(&task.ref_id)
            .filter(|result| result.error.is_none())
            .and_then(|result| {
                let query_id = result.query_id.clone()?;
                Some(StartedQuery {
                    ref_id: task.ref_id.clone(),
                    query_id,
                    region: result.region.clone().unwrap_or_else(|| task.region.clone()),
                })
            });
        match accepted {
            Some(query) => started.push(query),
            None => {
                let payload = serde_json::to_value(&reply).unwrap_or(Value::Null);
                return Err(
                    BackendError::new("some queries failed to start").with_payload(payload)
                );
            }
        }
    }
    Ok(started)
}
