use std::fmt;
use std::path::Path;

use anyhow::Result;
use serde_json::{json, Map, Value};

use super::{Config, DEFAULT_REGION, KNOWN_KEYS};
use crate::args::BaseArgs;
use crate::logs::DEFAULT_LOGS_TIMEOUT;
use crate::ui::{apply_column_padding, header, styled_table};

/// Read by `logq query --timeout` when the flag is absent.
const TIMEOUT_ENV_VAR: &str = "LOGQ_TIMEOUT";

/// Where an effective setting came from, highest precedence first.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    /// A global flag or its `LOGQ_*` env fallback.
    Override,
    Env(&'static str),
    File(String),
    Default,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Override => f.write_str("flag/env"),
            Source::Env(var) => f.write_str(var),
            Source::File(path) => f.write_str(path),
            Source::Default => f.write_str("default"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Setting {
    key: &'static str,
    value: Option<String>,
    source: Option<Source>,
}

pub fn run(base: BaseArgs, global: bool, local: bool) -> Result<()> {
    let output = if global || local {
        let config = if global {
            super::load_global()?
        } else {
            super::local_path()
                .map(|p| super::load_file(&p))
                .unwrap_or_default()
        };
        format_file(&config, base.json)?
    } else {
        let layers = config_layers();
        let timeout_env = std::env::var(TIMEOUT_ENV_VAR).ok();
        let settings = effective_settings(&base, timeout_env.as_deref(), &layers);
        format_settings(&settings, base.json)?
    };

    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

/// Config files that exist, local before global.
fn config_layers() -> Vec<(String, Config)> {
    let mut layers = Vec::new();
    if let Some(path) = super::local_path() {
        layers.push((display_path(&path), super::load_file(&path)));
    }
    if let Ok(path) = super::global_path() {
        layers.push((display_path(&path), super::load_file(&path)));
    }
    layers
}

fn display_path(path: &Path) -> String {
    std::env::current_dir()
        .ok()
        .and_then(|cwd| pathdiff::diff_paths(path, cwd))
        .filter(|relative| !relative.starts_with(".."))
        .unwrap_or_else(|| path.to_path_buf())
        .display()
        .to_string()
}

/// Resolves every known key the way `logq query` does: flags and env, then
/// config files in order, then built-in defaults.
fn effective_settings(
    base: &BaseArgs,
    timeout_env: Option<&str>,
    layers: &[(String, Config)],
) -> Vec<Setting> {
    KNOWN_KEYS
        .iter()
        .map(|&key| {
            let (value, source) = match override_for(base, timeout_env, key) {
                Some(found) => found,
                None => match from_files(layers, key) {
                    Some(found) => found,
                    None => return default_for(key),
                },
            };
            Setting {
                key,
                value: Some(value),
                source: Some(source),
            }
        })
        .collect()
}

fn override_for(base: &BaseArgs, timeout_env: Option<&str>, key: &str) -> Option<(String, Source)> {
    let (value, source) = match key {
        "api_url" => (base.api_url.as_deref(), Source::Override),
        "region" => (base.region.as_deref(), Source::Override),
        "logs_timeout" => (timeout_env, Source::Env(TIMEOUT_ENV_VAR)),
        _ => (None, Source::Override),
    };
    value
        .filter(|v| !v.trim().is_empty())
        .map(|v| (v.to_string(), source))
}

fn from_files(layers: &[(String, Config)], key: &str) -> Option<(String, Source)> {
    layers.iter().find_map(|(path, config)| {
        config
            .get_field(key)
            .map(|value| (value.to_string(), Source::File(path.clone())))
    })
}

fn default_for(key: &'static str) -> Setting {
    let value = match key {
        "region" => Some(DEFAULT_REGION),
        "logs_timeout" => Some(DEFAULT_LOGS_TIMEOUT),
        _ => None,
    };
    Setting {
        key,
        value: value.map(str::to_string),
        source: value.map(|_| Source::Default),
    }
}

fn format_settings(settings: &[Setting], json: bool) -> Result<String> {
    if json {
        let map: Map<String, Value> = settings
            .iter()
            .map(|s| {
                let entry = json!({
                    "value": s.value,
                    "source": s.source.as_ref().map(ToString::to_string),
                });
                (s.key.to_string(), entry)
            })
            .collect();
        return Ok(serde_json::to_string(&map)?);
    }

    let mut table = styled_table();
    table.set_header(vec![header("Key"), header("Value"), header("Source")]);
    apply_column_padding(&mut table, (0, 3));
    for setting in settings {
        table.add_row(vec![
            setting.key.to_string(),
            setting.value.clone().unwrap_or_else(|| "(unset)".to_string()),
            setting
                .source
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "-".to_string()),
        ]);
    }
    Ok(table.to_string())
}

/// Keys set in a single file, in the order of `KNOWN_KEYS`.
fn format_file(config: &Config, json: bool) -> Result<String> {
    let fields = config.non_empty_fields();
    if json {
        let map: Map<String, Value> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        return Ok(serde_json::to_string(&map)?);
    }
    Ok(fields
        .iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> BaseArgs {
        BaseArgs {
            json: false,
            api_url: None,
            api_key: None,
            region: None,
            env_file: None,
        }
    }

    fn layers() -> Vec<(String, Config)> {
        vec![
            (
                ".logq/config.json".to_string(),
                Config {
                    logs_timeout: Some("45m".into()),
                    ..Default::default()
                },
            ),
            (
                "/home/me/.config/logq/config.json".to_string(),
                Config {
                    api_url: Some("https://logs.example.com".into()),
                    region: Some("us-west-2".into()),
                    logs_timeout: Some("10m".into()),
                    ..Default::default()
                },
            ),
        ]
    }

    fn lookup<'a>(settings: &'a [Setting], key: &str) -> &'a Setting {
        settings.iter().find(|s| s.key == key).unwrap()
    }

    #[test]
    fn nearest_file_wins_per_key() {
        let settings = effective_settings(&base_args(), None, &layers());

        let timeout = lookup(&settings, "logs_timeout");
        assert_eq!(timeout.value.as_deref(), Some("45m"));
        assert_eq!(timeout.source, Some(Source::File(".logq/config.json".into())));

        let region = lookup(&settings, "region");
        assert_eq!(region.value.as_deref(), Some("us-west-2"));
        assert_eq!(
            region.source,
            Some(Source::File("/home/me/.config/logq/config.json".into()))
        );
    }

    #[test]
    fn flags_and_env_beat_files() {
        let base = BaseArgs {
            region: Some("ap-south-1".into()),
            ..base_args()
        };
        let settings = effective_settings(&base, Some("5m"), &layers());

        assert_eq!(lookup(&settings, "region").source, Some(Source::Override));
        assert_eq!(lookup(&settings, "region").value.as_deref(), Some("ap-south-1"));
        assert_eq!(
            lookup(&settings, "logs_timeout").source,
            Some(Source::Env(TIMEOUT_ENV_VAR))
        );
        assert_eq!(
            lookup(&settings, "api_url").value.as_deref(),
            Some("https://logs.example.com")
        );
    }

    #[test]
    fn defaults_fill_gaps_and_api_url_stays_unset() {
        let settings = effective_settings(&base_args(), None, &[]);

        assert_eq!(lookup(&settings, "region").value.as_deref(), Some(DEFAULT_REGION));
        assert_eq!(lookup(&settings, "region").source, Some(Source::Default));
        assert_eq!(
            lookup(&settings, "logs_timeout").value.as_deref(),
            Some(DEFAULT_LOGS_TIMEOUT)
        );
        let api_url = lookup(&settings, "api_url");
        assert_eq!(api_url.value, None);
        assert_eq!(api_url.source, None);
    }

    #[test]
    fn blank_region_flag_falls_through() {
        let base = BaseArgs {
            region: Some("  ".into()),
            ..base_args()
        };
        let settings = effective_settings(&base, None, &[]);
        assert_eq!(lookup(&settings, "region").source, Some(Source::Default));
    }

    #[test]
    fn settings_render_as_table_and_json() {
        let settings = effective_settings(&base_args(), None, &layers());

        let text = format_settings(&settings, false).unwrap();
        assert!(text.contains("logs_timeout"));
        assert!(text.contains(".logq/config.json"));
        assert!(!text.contains('|'));

        let parsed: Value = serde_json::from_str(&format_settings(&settings, true).unwrap()).unwrap();
        assert_eq!(parsed["logs_timeout"]["value"], "45m");
        assert_eq!(parsed["logs_timeout"]["source"], ".logq/config.json");
        assert_eq!(parsed["region"]["value"], "us-west-2");

        let unset = effective_settings(&base_args(), None, &[]);
        let parsed: Value = serde_json::from_str(&format_settings(&unset, true).unwrap()).unwrap();
        assert!(parsed["api_url"]["value"].is_null());
        assert_eq!(parsed["region"]["source"], "default");
    }

    #[test]
    fn single_file_lists_only_its_keys() {
        let config = Config {
            region: Some("eu-west-1".into()),
            ..Default::default()
        };
        assert_eq!(format_file(&config, false).unwrap(), "region: eu-west-1");
        assert_eq!(
            format_file(&config, true).unwrap(),
            r#"{"region":"eu-west-1"}"#
        );
        assert_eq!(format_file(&Config::default(), false).unwrap(), "");
    }
}
