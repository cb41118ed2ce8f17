//! Named, nestable phase timers
//!
//! Timers belong to a single runner. When the collection is disabled,
//! [`TimerCollection::record`] returns an inert guard and nothing is measured.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Aggregate statistics of one timer
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimerStats {
    /// Number of recorded intervals
    pub count: u64,

    /// Mean interval length in seconds
    pub mean_s: f64,

    /// Sum of all intervals in seconds
    pub total_s: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct TimerAccumulator {
    count: u64,
    total: Duration,
}

/// Collection of named timers
#[derive(Debug, Default)]
pub struct TimerCollection {
    enabled: bool,
    timers: RefCell<BTreeMap<String, TimerAccumulator>>,
}

impl TimerCollection {
    /// Create a disabled collection
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Drop every recorded interval
    pub fn reset(&mut self) {
        self.timers.get_mut().clear();
    }

    /// Start timing `name`; the interval is recorded when the guard drops
    pub fn record<'a>(&'a self, name: &'a str) -> TimerGuard<'a> {
        TimerGuard {
            active: self.enabled.then(|| (self, name, Instant::now())),
        }
    }

    fn finish(&self, name: &str, elapsed: Duration) {
        let mut timers = self.timers.borrow_mut();
        let entry = timers.entry(name.to_string()).or_default();
        entry.count += 1;
        entry.total += elapsed;
    }

    /// Aggregate statistics per timer name
    pub fn stats(&self) -> BTreeMap<String, TimerStats> {
        self.timers
            .borrow()
            .iter()
            .map(|(name, acc)| {
                let total_s = acc.total.as_secs_f64();
                let mean_s = if acc.count == 0 {
                    0.0
                } else {
                    total_s / acc.count as f64
                };
                (
                    name.clone(),
                    TimerStats {
                        count: acc.count,
                        mean_s,
                        total_s,
                    },
                )
            })
            .collect()
    }
}

/// RAII guard returned by [`TimerCollection::record`]
#[must_use = "the interval is recorded when the guard is dropped"]
pub struct TimerGuard<'a> {
    active: Option<(&'a TimerCollection, &'a str, Instant)>,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        if let Some((timers, name, start)) = self.active.take() {
            timers.finish(name, start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_timers_record_nothing() {
        let timers = TimerCollection::new();
        {
            let _t = timers.record("train_epoch");
        }
        assert!(timers.stats().is_empty());
    }

    #[test]
    fn test_nested_timers() {
        let mut timers = TimerCollection::new();
        timers.enable();
        {
            let _epoch = timers.record("train_epoch");
            for _ in 0..3 {
                let _batch = timers.record("batch");
                let _fwd = timers.record("fwd");
            }
        }

        let stats = timers.stats();
        assert_eq!(stats["train_epoch"].count, 1);
        assert_eq!(stats["batch"].count, 3);
        assert_eq!(stats["fwd"].count, 3);
        assert!(stats["train_epoch"].total_s >= stats["batch"].total_s);
        assert!((stats["batch"].mean_s * 3.0 - stats["batch"].total_s).abs() < 1e-9);
    }

    #[test]
    fn test_reset() {
        let mut timers = TimerCollection::new();
        timers.enable();
        drop(timers.record("validation"));
        assert_eq!(timers.stats().len(), 1);
        timers.reset();
        assert!(timers.stats().is_empty());
    }
}
