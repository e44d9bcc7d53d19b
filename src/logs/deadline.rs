use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::time::Instant;

pub const DEFAULT_LOGS_TIMEOUT: &str = "30m";

/// Decides, at each decision point, whether the shared wall-clock budget is spent.
///
/// `attempt` is the retry count during submission and the tick count during
/// polling; `started` is when the calling phase began. Checks are cooperative:
/// they only happen after a batch response arrives.
pub trait DeadlineCheck: Send + Sync {
    fn is_exceeded(&self, attempt: u32, started: Instant) -> bool;
}

impl<F> DeadlineCheck for F
where
    F: Fn(u32, Instant) -> bool + Send + Sync,
{
    fn is_exceeded(&self, attempt: u32, started: Instant) -> bool {
        self(attempt, started)
    }
}

/// A fixed instant computed once from the original request's start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        let now = Instant::now();
        let at = now.checked_add(timeout).unwrap_or(now + Duration::from_secs(86_400 * 365));
        Self { at }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

impl DeadlineCheck for Deadline {
    fn is_exceeded(&self, _attempt: u32, _started: Instant) -> bool {
        Instant::now() >= self.at
    }
}

/// Parses a `logs_timeout` value such as `30m`, `1h 30m` or `45s`.
pub fn parse_logs_timeout(value: &str) -> Result<Duration> {
    let trimmed = value.trim();
    let timeout = humantime::parse_duration(trimmed)
        .with_context(|| format!("invalid logs_timeout '{trimmed}'"))?;
    if timeout.is_zero() {
        bail!("invalid logs_timeout '{trimmed}': must be greater than zero");
    }
    Ok(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_timeout() {
        assert_eq!(
            parse_logs_timeout(DEFAULT_LOGS_TIMEOUT).unwrap(),
            Duration::from_secs(30 * 60)
        );
    }

    #[test]
    fn parses_compound_and_padded_values() {
        assert_eq!(
            parse_logs_timeout(" 1h 30m ").unwrap(),
            Duration::from_secs(90 * 60)
        );
        assert_eq!(parse_logs_timeout("45s").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn rejects_garbage_and_zero() {
        let err = parse_logs_timeout("soon").unwrap_err();
        assert!(err.to_string().contains("invalid logs_timeout 'soon'"));

        let err = parse_logs_timeout("0s").unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires_after_timeout() {
        let deadline = Deadline::after(Duration::from_secs(5));
        let started = Instant::now();
        assert!(!deadline.is_exceeded(0, started));
        assert_eq!(deadline.remaining(), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!deadline.is_exceeded(3, started));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(deadline.is_exceeded(0, started));
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[test]
    fn closures_act_as_deadlines() {
        let third_attempt = |attempt: u32, _started: Instant| attempt >= 3;
        let started = Instant::now();
        assert!(!third_attempt.is_exceeded(2, started));
        assert!(third_attempt.is_exceeded(3, started));
    }
}
