use anyhow::Result;
use std::process;

use crate::args::BaseArgs;

/// Prints the value for `key`; exits with status 1 when it is unset.
pub fn run(base: BaseArgs, key: &str, global: bool, local: bool) -> Result<()> {
    let cfg = if global {
        super::load_global()?
    } else if local {
        super::local_path()
            .map(|p| super::load_file(&p))
            .unwrap_or_default()
    } else {
        super::load()?
    };

    let Some(value) = cfg.get_field(key) else {
        process::exit(1);
    };
    if base.json {
        println!("{}", serde_json::to_string(value)?);
    } else {
        println!("{value}");
    }
    Ok(())
}
