//! Retry delay strategies

use std::time::Duration;

const CONTROLLED_STEPS_MS: [u64; 6] = [1, 10, 50, 100, 500, 1000];

/// Delay between dispatch attempts
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Backoff {
    /// 1, 10, 50, 100, 500 ms then a steady 1 s
    #[default]
    Controlled,
    /// `base * 2^(attempt-1)`, capped at `max`
    Exponential { base: Duration, max: Duration },
    Fixed(Duration),
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Backoff::Controlled => {
                let idx = ((attempt - 1) as usize).min(CONTROLLED_STEPS_MS.len() - 1);
                Duration::from_millis(CONTROLLED_STEPS_MS[idx])
            }
            Backoff::Exponential { base, max } => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                base.checked_mul(factor).unwrap_or(*max).min(*max)
            }
            Backoff::Fixed(d) => *d,
        }
    }

    /// Delay capped so it never outlives the operation's deadline
    pub fn delay_within(&self, attempt: u32, remaining: Duration) -> Duration {
        self.delay(attempt).min(remaining)
    }
}
