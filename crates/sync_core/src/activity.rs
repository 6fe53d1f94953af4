//! Activity classification driving the location cadence.

use std::time::Duration;

use tokio::time::Instant;

/// No qualifying input for this long demotes `Active` to `Normal`.
pub const IDLE_DEMOTION_AFTER: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActivityLevel {
    Background,
    Normal,
    Active,
}

impl ActivityLevel {
    pub fn cadence(self) -> Duration {
        match self {
            Self::Active => Duration::from_secs(60),
            Self::Normal => Duration::from_secs(3 * 60),
            Self::Background => Duration::from_secs(10 * 60),
        }
    }

    /// Every n-th tick forces a fresh location read.
    pub fn fresh_read_every(self) -> u64 {
        match self {
            Self::Active => 2,
            Self::Normal | Self::Background => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivitySignals {
    pub foreground: bool,
    pub map_engaged: bool,
    pub recent_input: bool,
}

/// The single transition rule. Hidden is always `Background`; an engaged map
/// or recent input is `Active`; anything else in the foreground is `Normal`.
pub fn resolve_level(signals: ActivitySignals) -> ActivityLevel {
    if !signals.foreground {
        ActivityLevel::Background
    } else if signals.map_engaged || signals.recent_input {
        ActivityLevel::Active
    } else {
        ActivityLevel::Normal
    }
}

/// Turns raw visibility/input/map events into [`ActivitySignals`].
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    foreground: bool,
    map_engaged: bool,
    last_input: Option<Instant>,
    idle_after: Duration,
}

impl ActivityTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            foreground: true,
            map_engaged: false,
            last_input: Some(now),
            idle_after: IDLE_DEMOTION_AFTER,
        }
    }

    pub fn with_idle_after(mut self, idle_after: Duration) -> Self {
        self.idle_after = idle_after;
        self
    }

    /// Becoming visible counts as input.
    pub fn set_foreground(&mut self, foreground: bool, now: Instant) {
        if foreground && !self.foreground {
            self.last_input = Some(now);
        }
        self.foreground = foreground;
    }

    pub fn set_map_engaged(&mut self, engaged: bool) {
        self.map_engaged = engaged;
    }

    /// Input can only come from a visible app, so it also marks it foregrounded.
    pub fn record_input(&mut self, now: Instant) {
        self.foreground = true;
        self.last_input = Some(now);
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground
    }

    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        self.last_input.map(|last| now.saturating_duration_since(last))
    }

    pub fn signals(&self, now: Instant) -> ActivitySignals {
        let recent_input = self
            .idle_for(now)
            .is_some_and(|idle| idle < self.idle_after);
        ActivitySignals {
            foreground: self.foreground,
            map_engaged: self.map_engaged,
            recent_input,
        }
    }

    pub fn level(&self, now: Instant) -> ActivityLevel {
        resolve_level(self.signals(now))
    }
}

#[cfg(test)]
#[path = "tests/activity_tests.rs"]
mod tests;
