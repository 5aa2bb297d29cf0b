use std::time::Duration;

/// Bounded retry schedule. Attempt `n` (0-indexed) waits `delays[n]` measured
/// from the start of the retry run; once the schedule is exhausted no further
/// attempt is made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    delays: Vec<Duration>,
}

impl BackoffPolicy {
    pub fn from_schedule(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn from_secs(secs: &[u64]) -> Self {
        Self::from_schedule(secs.iter().copied().map(Duration::from_secs).collect())
    }

    /// Delay before `attempt`, or None when the schedule is exhausted
    pub fn delay(&self, attempt: usize) -> Option<Duration> {
        self.delays.get(attempt).copied()
    }

    pub fn attempts(&self) -> usize {
        self.delays.len()
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_secs(&crate::licensing::config::REACTIVATION_SCHEDULE_SECS)
    }
}
