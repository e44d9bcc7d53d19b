use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

const ENV_FILE_FLAG: &str = "--env-file";
const ENV_FILE_VAR: &str = "LOGQ_ENV_FILE";
/// Selects the `.env.<profile>` files.
const PROFILE_VAR: &str = "LOGQ_ENV";
const DEFAULT_PROFILE: &str = "development";

/// Env files consulted before clap parses the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EnvFiles {
    /// `--env-file` or `LOGQ_ENV_FILE`. Must exist.
    Explicit(PathBuf),
    /// The optional `.env` family for a profile.
    Profile(String),
}

impl EnvFiles {
    fn detect(args: &[OsString]) -> Self {
        if let Some(path) = env_file_arg(args) {
            return EnvFiles::Explicit(path);
        }
        if let Some(path) = std::env::var_os(ENV_FILE_VAR).filter(|v| !v.is_empty()) {
            return EnvFiles::Explicit(PathBuf::from(path));
        }
        EnvFiles::Profile(
            std::env::var(PROFILE_VAR).unwrap_or_else(|_| DEFAULT_PROFILE.to_string()),
        )
    }

    /// Paths from lowest to highest precedence.
    fn paths(&self, cwd: &Path) -> Vec<PathBuf> {
        match self {
            EnvFiles::Explicit(path) => vec![cwd.join(path)],
            EnvFiles::Profile(profile) => {
                let mut names = vec![".env".to_string(), format!(".env.{profile}")];
                if profile != "test" {
                    names.push(".env.local".to_string());
                }
                names.push(format!(".env.{profile}.local"));
                names.into_iter().map(|name| cwd.join(name)).collect()
            }
        }
    }
}

/// Exports env file values into the process before argument parsing so clap's
/// `env = "LOGQ_*"` fallbacks see them.
pub fn bootstrap_from_args(args: &[OsString]) -> Result<()> {
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let files = EnvFiles::detect(args);
    let vars = read_env_files(&files, &cwd, |key| std::env::var_os(key).is_some())?;
    for (key, value) in vars {
        std::env::set_var(key, value);
    }
    Ok(())
}

/// Later files override earlier ones; keys for which `is_set` holds are skipped.
fn read_env_files(
    files: &EnvFiles,
    cwd: &Path,
    is_set: impl Fn(&str) -> bool,
) -> Result<BTreeMap<String, String>> {
    let required = matches!(files, EnvFiles::Explicit(_));
    let mut vars = BTreeMap::new();

    for path in files.paths(cwd) {
        if !required && !path.exists() {
            continue;
        }
        let entries = dotenvy::from_path_iter(&path)
            .with_context(|| format!("failed to read env file {}", path.display()))?;
        let mut loaded = 0usize;
        for entry in entries {
            let (key, value) =
                entry.with_context(|| format!("failed to parse env file {}", path.display()))?;
            if is_set(&key) {
                continue;
            }
            vars.insert(key, value);
            loaded += 1;
        }
        debug!(path = %path.display(), loaded, "loaded env file");
    }
    Ok(vars)
}

/// The last `--env-file` value before any `--`.
fn env_file_arg(args: &[OsString]) -> Option<PathBuf> {
    let mut found = None;
    let mut rest = args.iter().skip(1);
    while let Some(arg) = rest.next() {
        let Some(arg) = arg.to_str() else {
            continue;
        };
        if arg == "--" {
            break;
        }
        if arg == ENV_FILE_FLAG {
            if let Some(value) = rest.next() {
                found = Some(PathBuf::from(value));
            }
        } else if let Some(value) = arg
            .strip_prefix(ENV_FILE_FLAG)
            .and_then(|tail| tail.strip_prefix('='))
        {
            found = Some(PathBuf::from(value));
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn os_args(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn env_file_flag_in_both_forms() {
        let args = os_args(&["logq", "query", "--env-file", "prod.env", "fields @message"]);
        assert_eq!(env_file_arg(&args), Some(PathBuf::from("prod.env")));

        let args = os_args(&["logq", "--env-file=ci.env", "stop"]);
        assert_eq!(env_file_arg(&args), Some(PathBuf::from("ci.env")));

        let args = os_args(&["logq", "--env-file=a.env", "--env-file", "b.env"]);
        assert_eq!(env_file_arg(&args), Some(PathBuf::from("b.env")));
    }

    #[test]
    fn env_file_flag_after_double_dash_is_an_expression() {
        let args = os_args(&["logq", "query", "--", "--env-file", "x.env"]);
        assert_eq!(env_file_arg(&args), None);

        let args = os_args(&["logq", "query", "--env-file-ish"]);
        assert_eq!(env_file_arg(&args), None);
    }

    #[test]
    fn flag_selects_explicit_file() {
        let args = os_args(&["logq", "--env-file", "conf/.env", "config"]);
        assert_eq!(
            EnvFiles::detect(&args),
            EnvFiles::Explicit(PathBuf::from("conf/.env"))
        );
    }

    #[test]
    fn explicit_paths_resolve_against_cwd() {
        let cwd = Path::new("/work");
        let relative = EnvFiles::Explicit(PathBuf::from("conf/.env"));
        assert_eq!(relative.paths(cwd), vec![PathBuf::from("/work/conf/.env")]);

        let absolute = EnvFiles::Explicit(PathBuf::from("/etc/logq.env"));
        assert_eq!(absolute.paths(cwd), vec![PathBuf::from("/etc/logq.env")]);
    }

    #[test]
    fn profile_files_in_precedence_order() {
        let cwd = Path::new("/work");
        let names = |profile: &str| -> Vec<String> {
            EnvFiles::Profile(profile.to_string())
                .paths(cwd)
                .iter()
                .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
                .collect()
        };
        assert_eq!(
            names("staging"),
            vec![".env", ".env.staging", ".env.local", ".env.staging.local"]
        );
        assert_eq!(names("test"), vec![".env", ".env.test", ".env.test.local"]);
    }

    #[test]
    fn later_files_win_and_set_vars_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(".env"),
            "LOGQ_API_URL=http://base\nLOGQ_REGION=us-west-2\nHOME=/nowhere\n",
        )
        .unwrap();
        fs::write(dir.path().join(".env.local"), "LOGQ_API_URL=http://local\n").unwrap();

        let files = EnvFiles::Profile(DEFAULT_PROFILE.to_string());
        let vars = read_env_files(&files, dir.path(), |key| key == "HOME").unwrap();

        assert_eq!(vars.get("LOGQ_API_URL").map(String::as_str), Some("http://local"));
        assert_eq!(vars.get("LOGQ_REGION").map(String::as_str), Some("us-west-2"));
        assert!(!vars.contains_key("HOME"));
    }

    #[test]
    fn missing_profile_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let files = EnvFiles::Profile("production".to_string());
        assert!(read_env_files(&files, dir.path(), |_| false).unwrap().is_empty());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let files = EnvFiles::Explicit(PathBuf::from("nope.env"));
        let err = read_env_files(&files, dir.path(), |_| false).unwrap_err();
        assert!(err.to_string().contains("nope.env"));
    }
}
