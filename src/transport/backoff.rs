use std::time::Duration;

/// Doubling reconnect delay bounded by `[min, max]`.
///
/// The first failure after a reset waits `min`; every further consecutive
/// failure doubles the previous delay until it reaches `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            current: None,
        }
    }

    /// Records a failure and returns how long to wait before retrying.
    pub fn failure(&mut self) -> Duration {
        let next = match self.current {
            None => self.min,
            Some(delay) => delay.saturating_mul(2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    /// Called after a fully successful connect and login.
    pub fn reset(&mut self) {
        self.current = None;
    }
}
