use std::time::Duration;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Backoff for consecutive unexpected closes: attempt `n` waits `base_delay * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
        }
    }

    /// Delay before the next attempt, given how many attempts were already
    /// scheduled since the last successful open. `None` once the ceiling is hit.
    pub fn next_delay(&self, attempts_so_far: u32) -> Option<Duration> {
        if attempts_so_far >= self.max_attempts {
            return None;
        }
        Some(self.base_delay.saturating_mul(attempts_so_far + 1))
    }
}
