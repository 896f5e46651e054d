//! Accumulated timing counters for the controller's internal phases.
//!
//! The original design used process-global timer singletons; here the
//! counters live in an explicit context owned by the controller, so two
//! learners in one process never share state.

use std::collections::BTreeMap;
use std::time::Duration;

/// Per-phase call count and accumulated wall time.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerStat {
    pub calls: u64,
    pub total: Duration,
}

impl TimerStat {
    /// Mean duration per call, or zero if never called.
    pub fn mean(&self) -> Duration {
        if self.calls == 0 {
            Duration::ZERO
        } else {
            self.total / self.calls as u32
        }
    }
}

/// A set of named timing counters.
#[derive(Debug, Clone, Default)]
pub struct Timers {
    stats: BTreeMap<&'static str, TimerStat>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call of `name` taking `elapsed`.
    pub fn add(&mut self, name: &'static str, elapsed: Duration) {
        let stat = self.stats.entry(name).or_default();
        stat.calls += 1;
        stat.total += elapsed;
    }

    /// Look up a counter by name.
    pub fn get(&self, name: &str) -> Option<TimerStat> {
        self.stats.get(name).copied()
    }

    /// Iterate over all counters in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, TimerStat)> + '_ {
        self.stats.iter().map(|(name, stat)| (*name, *stat))
    }
}

impl std::fmt::Display for Timers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:<16} {:>8} {:>14} {:>14}", "phase", "calls", "total", "mean")?;
        for (name, stat) in self.iter() {
            writeln!(
                f,
                "{:<16} {:>8} {:>12.3?} {:>12.3?}",
                name,
                stat.calls,
                stat.total,
                stat.mean()
            )?;
        }
        Ok(())
    }
}
