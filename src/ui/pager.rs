use std::io::{self, IsTerminal, Write};
use std::process::{Command, Stdio};

use dialoguer::console::Term;

const DEFAULT_PAGER: &str = "less -R";

/// Prints `output`, piping it through `$PAGER` when it would not fit the terminal.
pub fn print_with_pager(output: &str) -> io::Result<()> {
    if !io::stdout().is_terminal() || fits_terminal(output) {
        println!("{output}");
        return Ok(());
    }

    let pager = std::env::var("PAGER")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_PAGER.into());
    let mut parts = pager.split_whitespace();
    let cmd = parts.next().unwrap_or("less");

    let Ok(mut child) = Command::new(cmd).args(parts).stdin(Stdio::piped()).spawn() else {
        println!("{output}");
        return Ok(());
    };
    if let Some(mut stdin) = child.stdin.take() {
        // The user may quit the pager before reading everything.
        let _ = writeln!(stdin, "{output}");
    }
    child.wait()?;
    Ok(())
}

fn fits_terminal(output: &str) -> bool {
    let (rows, _) = Term::stdout().size();
    output.lines().count() < usize::from(rows)
}
