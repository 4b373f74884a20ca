use std::time::Duration;

/// Capped exponential backoff shared by the accept loop and the dialer.
#[derive(Clone, Debug)]
pub(crate) struct Backoff {
    first: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// The first call to [`next`](Self::next) returns `first`, each later call doubles the previous
    /// delay up to `max`.
    pub(crate) fn new(first: Duration, max: Duration) -> Self {
        Backoff {
            first: first.min(max),
            max,
            current: Duration::ZERO,
        }
    }

    pub(crate) fn next(&mut self) -> Duration {
        self.current = if self.current.is_zero() {
            self.first
        } else {
            self.current.saturating_mul(2).min(self.max)
        };
        self.current
    }

    pub(crate) fn reset(&mut self) {
        self.current = Duration::ZERO;
    }
}
