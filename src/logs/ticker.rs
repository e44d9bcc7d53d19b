use std::time::Duration;

use tokio::time::sleep;

/// Poll pacing: delay before tick `i` is `min(start + i * step, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollCadence {
    pub start: Duration,
    pub end: Duration,
    pub step: Duration,
}

impl Default for PollCadence {
    fn default() -> Self {
        Self {
            start: Duration::from_millis(100),
            end: Duration::from_millis(1000),
            step: Duration::from_millis(300),
        }
    }
}

impl PollCadence {
    pub fn delay_before(&self, tick: u64) -> Duration {
        let factor = u32::try_from(tick).unwrap_or(u32::MAX);
        self.start
            .saturating_add(self.step.saturating_mul(factor))
            .min(self.end)
    }
}

/// Unbounded sequence of increasing tick counters, ramping from the fast start
/// interval up to the ceiling and holding there.
#[derive(Debug)]
pub struct Ticker {
    cadence: PollCadence,
    next: u64,
}

impl Ticker {
    pub fn new(cadence: PollCadence) -> Self {
        Self { cadence, next: 0 }
    }

    /// Waits out the delay for the next tick and returns its counter.
    pub async fn tick(&mut self) -> u64 {
        let tick = self.next;
        sleep(self.cadence.delay_before(tick)).await;
        self.next += 1;
        tick
    }

    /// Number of ticks that have fired so far.
    pub fn fired(&self) -> u64 {
        self.next
    }

    #[cfg(test)]
    pub fn upcoming_delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (self.next..).map(|tick| self.cadence.delay_before(tick))
    }
}
