use dialoguer::console::{style, StyledObject};

pub enum CommandStatus {
    Success,
    Error,
    Warning,
}

fn indicator(status: &CommandStatus) -> StyledObject<&'static str> {
    match status {
        CommandStatus::Success => style("✓").green(),
        CommandStatus::Error => style("✗").red(),
        CommandStatus::Warning => style("!").yellow(),
    }
}

/// Status lines go to stderr so stdout stays pipeable.
pub fn print_command_status(status: CommandStatus, message: &str) {
    eprintln!("{} {message}", indicator(&status));
}
