use std::collections::HashSet;

use super::types::{LogQuery, QueryError, SubQueryTask};

const DEFAULT_REGION_ALIAS: &str = "default";

/// Builds one task per caller query.
///
/// Every query needs at least one log group. Log group identifiers are
/// trimmed and deduplicated because the backend rejects overlapping
/// selections; `None`, empty and `"default"` regions resolve to
/// `default_region`.
pub fn build_tasks(
    queries: &[LogQuery],
    default_region: &str,
) -> Result<Vec<SubQueryTask>, QueryError> {
    let mut seen_refs = HashSet::new();
    let mut tasks = Vec::with_capacity(queries.len());

    for query in queries {
        if !seen_refs.insert(query.ref_id.as_str()) {
            return Err(QueryError::invalid(format!(
                "duplicate refId '{}'",
                query.ref_id
            ))
            .with_ref_ids(vec![query.ref_id.clone()]));
        }

        let log_group_names = dedupe_log_groups(&query.log_group_names);
        if log_group_names.is_empty() {
            return Err(QueryError::invalid("log group is required")
                .with_ref_ids(vec![query.ref_id.clone()]));
        }

        tasks.push(SubQueryTask {
            ref_id: query.ref_id.clone(),
            query_string: query.expression.clone(),
            region: resolve_region(query.region.as_deref(), default_region),
            log_group_names,
            is_stats_query: !query.stats_groups.is_empty(),
        });
    }

    Ok(tasks)
}

fn dedupe_log_groups(names: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .filter(|name| seen.insert(*name))
        .map(str::to_string)
        .collect()
}

fn resolve_region(region: Option<&str>, default_region: &str) -> String {
    match region.map(str::trim) {
        None | Some("") | Some(DEFAULT_REGION_ALIAS) => default_region.to_string(),
        Some(region) => region.to_string(),
    }
}

/// RefIds `A`..`Z`, then `AA`, `AB`, ... for the query at `index`.
pub fn ref_id_for(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}
