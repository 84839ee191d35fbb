use std::time::{Duration, Instant};

/// Fixed-window rate limiter remembering only the last accepted action.
///
/// Guards against double submission (sends) and collapses bursts of
/// triggers (pulls).
#[derive(Debug, Clone)]
pub struct Throttle {
    window: Duration,
    last_action_at: Option<Instant>,
}

impl Throttle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_action_at: None,
        }
    }

    /// True when an action at `now` falls inside the window of the last one.
    pub fn should_throttle(&self, now: Instant) -> bool {
        match self.last_action_at {
            Some(last) => now.saturating_duration_since(last) < self.window,
            None => false,
        }
    }

    /// Record an action at `now` unless it is throttled.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if self.should_throttle(now) {
            return false;
        }
        self.last_action_at = Some(now);
        true
    }

    /// Record an action unconditionally.
    pub fn record(&mut self, now: Instant) {
        self.last_action_at = Some(now);
    }

    pub fn last_action_at(&self) -> Option<Instant> {
        self.last_action_at
    }
}
