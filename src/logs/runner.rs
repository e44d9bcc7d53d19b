use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use super::backend::LogsBackend;
use super::deadline::{parse_logs_timeout, Deadline, DeadlineCheck, DEFAULT_LOGS_TIMEOUT};
use super::poller::PollSession;
use super::retry::{stop_started, submit, RetryPolicy, SubmitOutcome};
use super::tasks::build_tasks;
use super::ticker::PollCadence;
use super::types::{AggregatedResponse, LogQuery, QueryError, TimeRange};

const RESPONSE_BUFFER: usize = 16;

pub type QueryItem = Result<AggregatedResponse, QueryError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerSettings {
    pub timeout: Duration,
    pub cadence: PollCadence,
    pub retry: RetryPolicy,
    pub default_region: String,
}

impl RunnerSettings {
    pub fn new(default_region: impl Into<String>) -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            cadence: PollCadence::default(),
            retry: RetryPolicy::default(),
            default_region: default_region.into(),
        }
    }

    /// Applies a `logs_timeout` string, falling back to the 30 minute default.
    pub fn with_logs_timeout(mut self, logs_timeout: Option<&str>) -> anyhow::Result<Self> {
        self.timeout = parse_logs_timeout(logs_timeout.unwrap_or(DEFAULT_LOGS_TIMEOUT))?;
        Ok(self)
    }
}

/// Runs batches of log queries and exposes each as an incrementally updating stream.
#[derive(Clone)]
pub struct LogsQueryRunner {
    backend: Arc<dyn LogsBackend>,
    settings: RunnerSettings,
}

impl LogsQueryRunner {
    pub fn new(backend: Arc<dyn LogsBackend>, settings: RunnerSettings) -> Self {
        Self { backend, settings }
    }

    /// Starts `queries` with a deadline of now plus the configured timeout.
    /// Must be called inside a tokio runtime.
    pub fn run(&self, range: TimeRange, queries: Vec<LogQuery>) -> QueryStream {
        let deadline = Deadline::after(self.settings.timeout);
        debug!(budget = ?deadline.remaining(), queries = queries.len(), "starting log query run");
        self.run_with_deadline(range, queries, Arc::new(deadline))
    }

    /// Like [`run`](Self::run) with a caller-supplied deadline shared by the
    /// submission and polling phases.
    pub fn run_with_deadline(
        &self,
        range: TimeRange,
        queries: Vec<LogQuery>,
        deadline: Arc<dyn DeadlineCheck>,
    ) -> QueryStream {
        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        let cancel = CancellationToken::new();
        let run = QueryRun {
            backend: Arc::clone(&self.backend),
            settings: self.settings.clone(),
            deadline,
            tx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(run.drive(range, queries));
        QueryStream {
            rx,
            cancel: cancel.clone(),
            handle: Some(handle),
            _cancel_on_drop: cancel.drop_guard(),
        }
    }
}

/// Ordered responses of one run, ending after exactly one terminal item: a
/// `Done` response or an `Err`.
///
/// Dropping the stream detaches the caller: pending timers and requests are
/// abandoned and queries still running remotely are stopped.
pub struct QueryStream {
    rx: mpsc::Receiver<QueryItem>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    _cancel_on_drop: DropGuard,
}

impl QueryStream {
    /// Detaches and waits until cleanup, including the stop request, has run.
    pub async fn cancel(mut self) {
        self.cancel.cancel();
        self.rx.close();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "query driver ended abnormally");
            }
        }
    }
}

impl Stream for QueryStream {
    type Item = QueryItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Everything the spawned driver owns for one run.
struct QueryRun {
    backend: Arc<dyn LogsBackend>,
    settings: RunnerSettings,
    deadline: Arc<dyn DeadlineCheck>,
    tx: mpsc::Sender<QueryItem>,
    cancel: CancellationToken,
}

impl QueryRun {
    async fn drive(self, range: TimeRange, queries: Vec<LogQuery>) {
        let tasks = match build_tasks(&queries, &self.settings.default_region) {
            Ok(tasks) => tasks,
            Err(err) => {
                self.emit(Err(err)).await;
                return;
            }
        };
        if tasks.is_empty() {
            self.emit(Ok(AggregatedResponse::done(Vec::new()))).await;
            return;
        }
        if let Err(err) = range.validate() {
            self.emit(Err(err)).await;
            return;
        }

        let outcome = submit(
            self.backend.as_ref(),
            &range,
            tasks.clone(),
            self.deadline.as_ref(),
            &self.settings.retry,
            &self.cancel,
        )
        .await;

        let (started, mut submit_error) = match outcome {
            SubmitOutcome::Accepted { started, error } => (started, error),
            SubmitOutcome::Failed { error, started } => {
                stop_started(self.backend.as_ref(), started).await;
                self.emit(Err(error)).await;
                return;
            }
            SubmitOutcome::Cancelled(started) => {
                debug!(accepted = started.len(), "detached during submission");
                stop_started(self.backend.as_ref(), started).await;
                return;
            }
        };

        let mut session = PollSession::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.deadline),
            self.settings.cadence,
            &tasks,
            started,
        );

        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                item = session.next_response() => item,
            };
            let item = attach_submit_error(item, submit_error.take());
            let terminal = !matches!(&item, Ok(response) if !response.is_done());
            if !self.emit(item).await || terminal {
                break;
            }
        }

        session.shutdown().await;
    }

    /// Returns false once the caller has detached.
    async fn emit(&self, item: QueryItem) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }
}

/// A partial-submission error rides on the first poll emission so it is never dropped.
fn attach_submit_error(item: QueryItem, submit_error: Option<QueryError>) -> QueryItem {
    let Some(submit_error) = submit_error else {
        return item;
    };
    match item {
        Ok(mut response) => {
            response.error = Some(match response.error.take() {
                Some(poll_error) => poll_error.merge(submit_error),
                None => submit_error,
            });
            Ok(response)
        }
        Err(poll_error) => Err(poll_error.merge(submit_error)),
    }
}
