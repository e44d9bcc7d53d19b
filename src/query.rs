use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use dialoguer::console::style;
use futures_util::StreamExt;
use serde_json::Value;
use tracing::debug;

use crate::args::BaseArgs;
use crate::config;
use crate::http::ApiClient;
use crate::logs::{
    ref_id_for, AggregatedResponse, ErrorKind, HttpLogsBackend, LogQuery, LogsQueryRunner,
    PollFrame, RunnerSettings, TimeRange,
};
use crate::ui::{
    apply_column_padding, header, print_command_status, print_with_pager, styled_table, truncate,
    CommandStatus, Progress,
};
use crate::utils::pluralize;

const DEFAULT_SINCE: &str = "1h";
const HIDDEN_FIELDS: &[&str] = &["@ptr"];
const MAX_CELL_CHARS: usize = 120;

#[derive(Debug, Clone, Args)]
pub struct QueryArgs {
    /// Query expressions; each runs as its own sub-query (refIds A, B, C, ...)
    #[arg(required = true, value_name = "EXPR")]
    expressions: Vec<String>,

    /// Log group to search (repeatable)
    #[arg(long = "log-group", short = 'g', value_name = "GROUP")]
    log_groups: Vec<String>,

    /// Stats grouping; marks the queries as stats queries (repeatable)
    #[arg(long = "stats-group", value_name = "FIELD")]
    stats_groups: Vec<String>,

    /// Relative window ending now, e.g. 15m or 2h [default: 1h]
    #[arg(long, conflicts_with_all = ["from", "to"])]
    since: Option<String>,

    /// Window start (RFC 3339)
    #[arg(long, requires = "to")]
    from: Option<DateTime<Utc>>,

    /// Window end (RFC 3339)
    #[arg(long, requires = "from")]
    to: Option<DateTime<Utc>>,

    /// Overall time budget, e.g. 30m (or via LOGQ_TIMEOUT)
    #[arg(long, env = "LOGQ_TIMEOUT")]
    timeout: Option<String>,

    /// Maximum rows printed per query
    #[arg(long, default_value_t = 100)]
    limit: usize,
}

impl QueryArgs {
    fn time_range(&self) -> Result<TimeRange> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            return Ok(TimeRange::new(from, to));
        }
        let since = self.since.as_deref().unwrap_or(DEFAULT_SINCE);
        let window = humantime::parse_duration(since.trim())
            .with_context(|| format!("invalid --since '{since}'"))?;
        Ok(TimeRange::last(window))
    }

    fn log_queries(&self) -> Vec<LogQuery> {
        self.expressions
            .iter()
            .enumerate()
            .map(|(index, expression)| LogQuery {
                ref_id: ref_id_for(index),
                expression: expression.clone(),
                log_group_names: self.log_groups.clone(),
                region: None,
                stats_groups: self.stats_groups.clone(),
            })
            .collect()
    }
}

pub async fn run(base: BaseArgs, args: QueryArgs) -> Result<()> {
    let resolved = config::resolve(&base, args.timeout.as_deref())?;
    let settings = RunnerSettings::new(&resolved.region)
        .with_logs_timeout(Some(resolved.logs_timeout.as_str()))?;
    let range = args.time_range()?;
    let client = ApiClient::new(&resolved.api_url, resolved.api_key.clone())?;
    debug!(
        api_url = client.base_url(),
        region = %resolved.region,
        timeout = ?settings.timeout,
        "running log queries"
    );

    let runner = LogsQueryRunner::new(Arc::new(HttpLogsBackend::new(client)), settings);
    let mut stream = runner.run(range, args.log_queries());
    let progress = Progress::start("Starting queries...", base.json);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut last: Option<AggregatedResponse> = None;
    loop {
        let next = tokio::select! {
            item = stream.next() => Some(item),
            _ = &mut ctrl_c => None,
        };
        let Some(item) = next else {
            progress.finish();
            print_command_status(CommandStatus::Warning, "Interrupted, stopping queries...");
            stream.cancel().await;
            bail!("query interrupted");
        };
        match item {
            Some(Ok(response)) => {
                progress.update(progress_message(&response));
                last = Some(response);
            }
            Some(Err(err)) => {
                progress.finish();
                let refs = if err.ref_ids.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", err.ref_ids.join(", "))
                };
                return Err(anyhow::Error::new(err)).context(format!("log query failed{refs}"));
            }
            None => break,
        }
    }
    progress.finish();

    let Some(response) = last else {
        bail!("query ended without a response");
    };

    if base.json {
        println!("{}", serde_json::to_string(&response)?);
    } else {
        print_with_pager(&render_response(&response, args.limit)?)?;
    }

    if let Some(error) = &response.error {
        let status = match error.kind {
            ErrorKind::Timeout => CommandStatus::Warning,
            ErrorKind::Fatal | ErrorKind::Invalid => CommandStatus::Error,
        };
        print_command_status(status, &error.message);
    }
    Ok(())
}

fn progress_message(response: &AggregatedResponse) -> String {
    let finished = response
        .frames
        .iter()
        .filter(|frame| frame.status.is_terminal())
        .count();
    let scanned: f64 = response
        .frames
        .iter()
        .filter_map(|frame| frame.stats.records_scanned)
        .sum();
    format!(
        "{finished}/{} {} finished, {} records scanned",
        response.frames.len(),
        pluralize(response.frames.len(), "query", Some("queries")),
        format_count(scanned)
    )
}

fn render_response(response: &AggregatedResponse, limit: usize) -> Result<String> {
    let mut output = String::new();
    for (index, frame) in response.frames.iter().enumerate() {
        if index > 0 {
            writeln!(output)?;
        }
        writeln!(output, "{}", frame_summary(frame))?;
        if frame.records.is_empty() {
            continue;
        }
        writeln!(output)?;
        write!(output, "{}", records_table(frame, limit))?;
        writeln!(output)?;
        if frame.records.len() > limit {
            writeln!(
                output,
                "{}",
                style(format!(
                    "... {} more {} not shown (raise --limit)",
                    frame.records.len() - limit,
                    pluralize(frame.records.len() - limit, "row", None)
                ))
                .dim()
            )?;
        }
    }
    Ok(output.trim_end().to_string())
}

fn frame_summary(frame: &PollFrame) -> String {
    let status = match frame.status.as_str() {
        s @ "Complete" => style(s).green(),
        s @ ("Failed" | "Cancelled") => style(s).red(),
        s => style(s).yellow(),
    };
    let mut summary = format!("{} {status}", style(&frame.ref_id).bold());
    if let Some(scanned) = frame.stats.records_scanned {
        let _ = write!(summary, "  {} scanned", format_count(scanned));
    }
    if let Some(matched) = frame.stats.records_matched {
        let _ = write!(summary, ", {} matched", format_count(matched));
    }
    let _ = write!(
        summary,
        ", {} {}",
        frame.records.len(),
        pluralize(frame.records.len(), "row", None)
    );
    summary
}

fn record_columns(frame: &PollFrame) -> Vec<&str> {
    let columns: BTreeSet<&str> = frame
        .records
        .iter()
        .flat_map(|record| record.keys().map(String::as_str))
        .filter(|key| !HIDDEN_FIELDS.contains(key))
        .collect();
    columns.into_iter().collect()
}

fn records_table(frame: &PollFrame, limit: usize) -> comfy_table::Table {
    let columns = record_columns(frame);
    let mut table = styled_table();
    table.set_header(columns.iter().map(|c| header(c)).collect::<Vec<_>>());
    apply_column_padding(&mut table, (0, 2));

    for record in frame.records.iter().take(limit) {
        let row: Vec<String> = columns
            .iter()
            .map(|column| match record.get(*column) {
                Some(Value::String(s)) => truncate(s, MAX_CELL_CHARS),
                Some(Value::Null) | None => "-".to_string(),
                Some(other) => truncate(&other.to_string(), MAX_CELL_CHARS),
            })
            .collect();
        table.add_row(row);
    }
    table
}

/// `1234567.0` renders as `1,234,567`.
fn format_count(value: f64) -> String {
    let whole = value.max(0.0).round() as u64;
    let digits = whole.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
