use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Subcommand};
use std::{
    env, fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::args::BaseArgs;
use crate::logs::{parse_logs_timeout, DEFAULT_LOGS_TIMEOUT};
use crate::ui::{print_command_status, CommandStatus};

mod get;
mod list;
mod set;

const CONFIG_DIR_NAME: &str = "logq";
const LOCAL_DIR_NAME: &str = ".logq";
const CONFIG_FILE_NAME: &str = "config.json";

pub const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub api_url: Option<String>,
    pub region: Option<String>,
    pub logs_timeout: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub const KNOWN_KEYS: &[&str] = &["api_url", "region", "logs_timeout"];

impl Config {
    pub fn get_field(&self, key: &str) -> Option<&str> {
        match key {
            "api_url" => self.api_url.as_deref(),
            "region" => self.region.as_deref(),
            "logs_timeout" => self.logs_timeout.as_deref(),
            _ => None,
        }
    }

    pub fn set_field(&mut self, key: &str, value: String) -> bool {
        match key {
            "api_url" => self.api_url = Some(value),
            "region" => self.region = Some(value),
            "logs_timeout" => self.logs_timeout = Some(value),
            _ => return false,
        }
        true
    }

    pub fn unset_field(&mut self, key: &str) -> bool {
        match key {
            "api_url" => self.api_url = None,
            "region" => self.region = None,
            "logs_timeout" => self.logs_timeout = None,
            _ => return false,
        }
        true
    }

    pub fn non_empty_fields(&self) -> Vec<(&str, &str)> {
        KNOWN_KEYS
            .iter()
            .filter_map(|&key| self.get_field(key).map(|v| (key, v)))
            .collect()
    }

    fn merge(&self, other: &Config) -> Config {
        let mut extra = self.extra.clone();
        extra.extend(other.extra.clone());
        Config {
            api_url: other.api_url.clone().or_else(|| self.api_url.clone()),
            region: other.region.clone().or_else(|| self.region.clone()),
            logs_timeout: other
                .logs_timeout
                .clone()
                .or_else(|| self.logs_timeout.clone()),
            extra,
        }
    }
}

/// Connection and engine settings after applying flags, env, local and
/// global config, in that order of precedence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub api_url: String,
    pub api_key: Option<String>,
    pub region: String,
    pub logs_timeout: String,
}

pub fn resolve(base: &BaseArgs, timeout: Option<&str>) -> Result<Resolved> {
    resolve_with(&load()?, base, timeout)
}

fn resolve_with(config: &Config, base: &BaseArgs, timeout: Option<&str>) -> Result<Resolved> {
    let api_url = base
        .api_url
        .clone()
        .or_else(|| config.api_url.clone())
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| {
            anyhow!("no API URL configured. Pass --api-url, set LOGQ_API_URL, or run `logq config set api_url <URL>`")
        })?;
    let region = base
        .region
        .clone()
        .or_else(|| config.region.clone())
        .filter(|region| !region.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_REGION.to_string());
    let logs_timeout = timeout
        .map(str::to_string)
        .or_else(|| config.logs_timeout.clone())
        .unwrap_or_else(|| DEFAULT_LOGS_TIMEOUT.to_string());

    Ok(Resolved {
        api_url,
        api_key: base.api_key.clone(),
        region,
        logs_timeout,
    })
}

pub fn global_config_dir() -> Result<PathBuf> {
    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg).join(CONFIG_DIR_NAME));
    }
    dirs::home_dir()
        .map(|path| path.join(".config").join(CONFIG_DIR_NAME))
        .ok_or_else(|| anyhow!("$HOME not configured."))
}

pub fn global_path() -> Result<PathBuf> {
    Ok(global_config_dir()?.join(CONFIG_FILE_NAME))
}

pub fn load_file(path: &Path) -> Config {
    let file_contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Config::default(),
        Err(e) => {
            print_command_status(
                CommandStatus::Warning,
                &format!("could not read {}: {e}", path.display()),
            );
            return Config::default();
        }
    };

    let config: Config = match serde_json::from_str(&file_contents) {
        Ok(c) => c,
        Err(e) => {
            print_command_status(
                CommandStatus::Warning,
                &format!("could not parse {}: {e}", path.display()),
            );
            return Config::default();
        }
    };

    for key in config.extra.keys() {
        print_command_status(
            CommandStatus::Warning,
            &format!("unknown config key {} in {}", key, path.display()),
        );
    }
    debug!(path = %path.display(), "loaded config");

    config
}

pub fn load_global() -> Result<Config> {
    Ok(load_file(&global_path()?))
}

pub fn load() -> Result<Config> {
    let global = load_global().unwrap_or_default();
    let local = match local_path() {
        Some(p) => load_file(&p),
        None => Config::default(),
    };
    Ok(global.merge(&local))
}

pub fn save_file(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(config)?;
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)
        .with_context(|| format!("failed to write {}", temp_path.display()))?;
    file.write_all(json.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    fs::rename(&temp_path, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;

    Ok(())
}

pub fn find_local_config_dir() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    find_local_config_dir_from(cwd, dirs::home_dir().as_deref())
}

fn find_local_config_dir_from(mut current_dir: PathBuf, home: Option<&Path>) -> Option<PathBuf> {
    loop {
        if current_dir.join(LOCAL_DIR_NAME).is_dir() {
            return Some(current_dir.join(LOCAL_DIR_NAME));
        }
        if current_dir.join(".git").exists() {
            return None;
        }
        if Some(current_dir.as_path()) == home {
            return None;
        }
        if !current_dir.pop() {
            return None;
        }
    }
}

pub fn local_path() -> Option<PathBuf> {
    find_local_config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// Resolve which config file to write based on --global/--local flags.
///
/// Without a flag the nearest local config wins, then the global one.
/// `--local` creates `.logq/` in the working directory when none exists.
pub fn resolve_write_path(global: bool, local: bool) -> Result<PathBuf> {
    if global {
        return global_path();
    }
    if let Some(path) = local_path() {
        return Ok(path);
    }
    if local {
        let cwd = std::env::current_dir().context("failed to read current directory")?;
        return Ok(cwd.join(LOCAL_DIR_NAME).join(CONFIG_FILE_NAME));
    }
    global_path()
}

// --- CLI commands ---

#[derive(Debug, Clone, Args)]
pub struct ScopeArgs {
    /// Apply to global config (~/.config/logq/config.json)
    #[arg(long, short = 'g', conflicts_with = "local")]
    global: bool,

    /// Apply to local config (.logq/config.json)
    #[arg(long, short = 'l')]
    local: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommands>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommands {
    /// Show effective settings and where each comes from (--global/--local: that file only)
    List {
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Get a config value
    Get {
        /// Config key (api_url, region, logs_timeout)
        key: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Set a config value
    Set {
        /// Config key (api_url, region, logs_timeout)
        key: String,
        /// Value to set
        value: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Remove a config value
    Unset {
        /// Config key (api_url, region, logs_timeout)
        key: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
}

fn validate_key(key: &str) -> Result<()> {
    if !KNOWN_KEYS.contains(&key) {
        bail!(
            "Unknown config key: {key}\nValid keys: {}",
            KNOWN_KEYS.join(", ")
        );
    }
    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<()> {
    match key {
        "logs_timeout" => {
            parse_logs_timeout(value)?;
        }
        "api_url" => {
            reqwest::Url::parse(value.trim())
                .with_context(|| format!("invalid api_url '{value}'"))?;
        }
        "region" if value.trim().is_empty() => bail!("region must not be empty"),
        _ => {}
    }
    Ok(())
}

pub fn run(base: BaseArgs, args: ConfigArgs) -> Result<()> {
    match args.command {
        None => list::run(base, false, false),
        Some(ConfigCommands::List { scope }) => list::run(base, scope.global, scope.local),
        Some(ConfigCommands::Get { key, scope }) => {
            validate_key(&key)?;
            get::run(base, &key, scope.global, scope.local)
        }
        Some(ConfigCommands::Set { key, value, scope }) => {
            validate_key(&key)?;
            validate_value(&key, &value)?;
            set::run(&key, &value, scope.global, scope.local)
        }
        Some(ConfigCommands::Unset { key, scope }) => {
            validate_key(&key)?;
            set::unset(&key, scope.global, scope.local)
        }
    }
}
