use anyhow::{Context, Result};
use clap::Args;

use crate::args::BaseArgs;
use crate::config;
use crate::http::ApiClient;
use crate::logs::{ref_id_for, HttpLogsBackend, LogsBackend, RunningQuery};
use crate::ui::{print_command_status, with_spinner, CommandStatus};
use crate::utils::pluralize;

#[derive(Debug, Clone, Args)]
pub struct StopArgs {
    /// Backend query ids to stop
    #[arg(required = true, value_name = "QUERY_ID")]
    query_ids: Vec<String>,
}

fn running_queries(query_ids: &[String], region: &str) -> Vec<RunningQuery> {
    query_ids
        .iter()
        .enumerate()
        .map(|(index, id)| RunningQuery {
            ref_id: ref_id_for(index),
            id: id.trim().to_string(),
            region: region.to_string(),
            is_stats_query: false,
        })
        .collect()
}

pub async fn run(base: BaseArgs, args: StopArgs) -> Result<()> {
    let resolved = config::resolve(&base, None)?;
    let client = ApiClient::new(&resolved.api_url, resolved.api_key.clone())?;
    let backend = HttpLogsBackend::new(client);
    let queries = running_queries(&args.query_ids, &resolved.region);

    with_spinner("Stopping queries...", backend.stop_query(&queries))
        .await
        .context("failed to stop queries")?;

    if base.json {
        println!("{}", serde_json::to_string(&queries)?);
    } else {
        print_command_status(
            CommandStatus::Success,
            &format!(
                "Requested stop for {} {} in {}",
                queries.len(),
                pluralize(queries.len(), "query", Some("queries")),
                resolved.region
            ),
        );
    }
    Ok(())
}
