use std::path::PathBuf;

use clap::Args;

#[derive(Debug, Clone, Args)]
pub struct BaseArgs {
    /// Output as JSON
    #[arg(short = 'j', long, global = true)]
    pub json: bool,

    /// Override the log query service URL (or via LOGQ_API_URL)
    #[arg(
        long,
        env = "LOGQ_API_URL",
        hide_env_values = true,
        global = true
    )]
    pub api_url: Option<String>,

    /// Override the API key (or via LOGQ_API_KEY)
    #[arg(
        long,
        env = "LOGQ_API_KEY",
        hide_env_values = true,
        global = true
    )]
    pub api_key: Option<String>,

    /// Default region for queries that do not name one (or via LOGQ_REGION)
    #[arg(short = 'r', long, env = "LOGQ_REGION", global = true)]
    pub region: Option<String>,

    /// Path to a .env file to load before running commands.
    #[arg(long, env = "LOGQ_ENV_FILE", hide_env_values = true)]
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct CLIArgs<T: Args> {
    #[command(flatten)]
    pub base: BaseArgs,

    #[command(flatten)]
    pub args: T,
}
