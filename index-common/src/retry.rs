use std::time::Duration;

/// Bounded exponential backoff for retrying a collaborator call within a
/// single processing attempt. This is distinct from queue-level retries,
/// which are operator-initiated and accounted on the job record.
#[derive(Copy, Clone, Debug)]
pub struct BackoffPolicy {
    /// Total number of attempts, including the first one.
    max_attempts: u32,
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval after the first failed attempt.
    initial_interval: Duration,
    /// The maximum possible backoff between attempts.
    maximum_interval: Option<Duration>,
}

impl BackoffPolicy {
    pub fn new(
        max_attempts: u32,
        backoff_coefficient: u32,
        initial_interval: Duration,
        maximum_interval: Option<Duration>,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// How long to wait after the failed attempt with the given zero-based
    /// index.
    pub fn interval_after(&self, attempt: u32) -> Duration {
        let candidate_interval = self.initial_interval * self.backoff_coefficient.pow(attempt);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for BackoffPolicy {
    /// 3 attempts, waiting 2 s then 4 s, capped at 10 s.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_coefficient: 2,
            initial_interval: Duration::from_secs(2),
            maximum_interval: Some(Duration::from_secs(10)),
        }
    }
}
