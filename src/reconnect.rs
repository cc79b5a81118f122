//! Reconnect state machine for the note source probe.
//!
//! `Disconnected -> Connecting -> Connected -> Disconnected`, with a retry
//! delay that doubles on every consecutive failure up to a ceiling.

use std::time::Duration;

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
}

#[derive(Debug, Clone)]
pub struct Reconnector {
    state: ReconnectState,
    failures: u32,
    initial: Duration,
    max: Duration,
}

impl Reconnector {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            state: ReconnectState::Disconnected,
            failures: 0,
            initial,
            max: max.max(initial),
        }
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ReconnectState::Connected
    }

    /// Mark the start of a probe. Already connected sources stay connected.
    pub fn begin_attempt(&mut self) {
        if self.state != ReconnectState::Connected {
            self.state = ReconnectState::Connecting {
                attempt: self.failures + 1,
            };
        }
    }

    pub fn on_success(&mut self) {
        if self.state != ReconnectState::Connected {
            info!(after_failures = self.failures, "note source reachable");
        }
        self.state = ReconnectState::Connected;
        self.failures = 0;
    }

    /// Record a failed probe and return how long to wait before the next one.
    pub fn on_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.state = ReconnectState::Disconnected;
        let delay = self.delay_for(self.failures);
        warn!(failures = self.failures, ?delay, "note source unreachable, retrying");
        delay
    }

    /// Delay after the `failures`-th consecutive failure.
    fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }
}
