//! Registry configuration.

use std::time::Duration;

use crate::engine::DEFAULT_LOOP_INTERVAL;

/// Default cadence of the registry-wide scheduler tick.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Default number of selection rounds `get_job` makes before giving up.
pub const DEFAULT_DISPATCH_ATTEMPTS: usize = 10;

/// Default capacity of the event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Tuning for a [`HandlerRegistry`](crate::HandlerRegistry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Pause between scheduler ticks.
    pub tick_interval: Duration,
    /// Pause between control-loop iterations of each engine.
    pub loop_interval: Duration,
    pub dispatch_attempts: usize,
    pub event_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            loop_interval: DEFAULT_LOOP_INTERVAL,
            dispatch_attempts: DEFAULT_DISPATCH_ATTEMPTS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl RegistryConfig {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_loop_interval(mut self, interval: Duration) -> Self {
        self.loop_interval = interval;
        self
    }

    /// Set the dispatch retry bound. Clamped to at least one attempt.
    pub fn with_dispatch_attempts(mut self, attempts: usize) -> Self {
        self.dispatch_attempts = attempts.max(1);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}
