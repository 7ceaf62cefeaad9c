//! Debounced escalating trigger
//!
//! Counts consecutive positive observations and fires once the count reaches
//! a threshold, no more often than a cooldown allows. The count at firing time
//! maps to a [`Severity`] tier.
//!
//! The same object gates video submission (threshold 1, re-armed by the
//! cooldown alone) and vital-sign alerting (threshold 3, re-armed only after
//! a negative observation resets the run).

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimum run length for each tier above `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breakpoints {
    pub medium: u32,
    pub high: u32,
    pub critical: u32,
}

impl Default for Breakpoints {
    fn default() -> Self {
        Self {
            medium: 5,
            high: 7,
            critical: 10,
        }
    }
}

impl Breakpoints {
    pub fn severity(&self, count: u32) -> Severity {
        if count >= self.critical {
            Severity::Critical
        } else if count >= self.high {
            Severity::High
        } else if count >= self.medium {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// When a trigger that has fired may fire again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rearm {
    /// As soon as the cooldown has elapsed, even mid-run.
    AfterCooldown,
    /// Only after a negative observation has reset the run.
    AfterReset,
}

#[derive(Debug, Clone, Copy)]
pub struct TriggerConfig {
    pub threshold: u32,
    pub cooldown: Duration,
    pub rearm: Rearm,
    pub breakpoints: Breakpoints,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            cooldown: Duration::from_secs(100),
            rearm: Rearm::AfterReset,
            breakpoints: Breakpoints::default(),
        }
    }
}

impl TriggerConfig {
    /// A plain rate gate: every call is a candidate, at most one per interval.
    pub fn throttle(interval: Duration) -> Self {
        Self {
            threshold: 1,
            cooldown: interval,
            rearm: Rearm::AfterCooldown,
            breakpoints: Breakpoints::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DebouncedTrigger {
    config: TriggerConfig,
    count: u32,
    last_fired: Option<Instant>,
    armed: bool,
}

impl DebouncedTrigger {
    pub fn new(config: TriggerConfig) -> Self {
        Self {
            config,
            count: 0,
            last_fired: None,
            armed: true,
        }
    }

    /// Feed one observation. Returns the severity when the trigger fires.
    pub fn observe(&mut self, positive: bool, at: Instant) -> Option<Severity> {
        if !positive {
            self.count = 0;
            self.armed = true;
            return None;
        }

        self.count = self.count.saturating_add(1);
        if self.count < self.config.threshold {
            return None;
        }

        // strictly more than the cooldown since the previous firing
        let cooled = match self.last_fired {
            Some(last) => at.saturating_duration_since(last) > self.config.cooldown,
            None => true,
        };
        let rearmed = match self.config.rearm {
            Rearm::AfterCooldown => true,
            Rearm::AfterReset => self.armed,
        };

        if !(cooled && rearmed) {
            return None;
        }

        self.last_fired = Some(at);
        self.armed = false;
        Some(self.config.breakpoints.severity(self.count))
    }

    /// Current run of consecutive positive observations.
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn last_fired(&self) -> Option<Instant> {
        self.last_fired
    }
}
