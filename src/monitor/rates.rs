//! Rate derivation for cumulative I/O counters
//!
//! Proxmox reports disk and network I/O as monotonically increasing byte
//! counters. The tracker keeps the previous sample per resource and turns
//! each new sample into bytes-per-second rates. A counter that goes
//! backwards (guest restart, migration) yields zero for that window and the
//! new value becomes the baseline.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Entries not updated for this long are evicted
const STALE_AFTER: Duration = Duration::from_secs(3600);

/// How often the stale sweep runs, at most
const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// One observation of a guest's cumulative I/O counters
#[derive(Debug, Clone, Copy)]
pub struct IoSample {
    pub disk_read: u64,
    pub disk_write: u64,
    pub net_in: u64,
    pub net_out: u64,
    pub timestamp: DateTime<Utc>,
}

/// Derived rates in bytes per second
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoRates {
    pub disk_read: u64,
    pub disk_write: u64,
    pub net_in: u64,
    pub net_out: u64,
}

#[derive(Default)]
struct TrackerInner {
    previous: HashMap<String, IoSample>,
    last_sweep: Option<DateTime<Utc>>,
}

/// Per-resource rate tracker
#[derive(Default)]
pub struct RateTracker {
    inner: Mutex<TrackerInner>,
}

impl RateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive rates for `resource_id` from the previous sample, then store
    /// the current one. First observation and non-positive deltas yield
    /// zeros.
    pub fn calculate_rates(&self, resource_id: &str, current: IoSample) -> IoRates {
        let mut inner = self.inner.lock().expect("rate tracker lock poisoned");

        let rates = match inner.previous.get(resource_id) {
            Some(previous) => {
                let elapsed = (current.timestamp - previous.timestamp).num_milliseconds() as f64
                    / 1000.0;
                if elapsed <= 0.0 {
                    IoRates::default()
                } else {
                    IoRates {
                        disk_read: counter_rate(previous.disk_read, current.disk_read, elapsed),
                        disk_write: counter_rate(previous.disk_write, current.disk_write, elapsed),
                        net_in: counter_rate(previous.net_in, current.net_in, elapsed),
                        net_out: counter_rate(previous.net_out, current.net_out, elapsed),
                    }
                }
            }
            None => IoRates::default(),
        };

        inner.previous.insert(resource_id.to_string(), current);
        Self::maybe_sweep(&mut inner, current.timestamp);

        rates
    }

    fn maybe_sweep(inner: &mut TrackerInner, now: DateTime<Utc>) {
        let sweep_interval = chrono::Duration::seconds(SWEEP_INTERVAL.as_secs() as i64);
        let sweep_due = inner.last_sweep.is_none_or(|at| now - at >= sweep_interval);
        if !sweep_due {
            return;
        }
        inner.last_sweep = Some(now);

        let cutoff = now - chrono::Duration::seconds(STALE_AFTER.as_secs() as i64);
        inner.previous.retain(|_, sample| sample.timestamp > cutoff);
    }

    #[cfg(test)]
    fn tracked_count(&self) -> usize {
        self.inner.lock().unwrap().previous.len()
    }
}

/// Rate between two counter values; zero when the counter went backwards
fn counter_rate(previous: u64, current: u64, elapsed_secs: f64) -> u64 {
    if current <= previous {
        return 0;
    }
    (((current - previous) as f64) / elapsed_secs) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const MIB: u64 = 1024 * 1024;

    fn sample(disk_read: u64, at_secs: i64) -> IoSample {
        IoSample {
            disk_read,
            disk_write: 0,
            net_in: 0,
            net_out: 0,
            timestamp: Utc.timestamp_opt(at_secs, 0).unwrap(),
        }
    }

    #[test]
    fn first_sample_yields_zero() {
        let tracker = RateTracker::new();
        let rates = tracker.calculate_rates("guest-1", sample(10 * MIB, 0));
        assert_eq!(rates, IoRates::default());
    }

    #[test]
    fn rate_is_delta_over_elapsed_seconds() {
        let tracker = RateTracker::new();
        tracker.calculate_rates("guest-1", sample(10 * MIB, 0));
        let rates = tracker.calculate_rates("guest-1", sample(15 * MIB, 5));
        assert_eq!(rates.disk_read, MIB);
    }

    #[test]
    fn counter_reset_yields_zero_then_new_baseline() {
        let tracker = RateTracker::new();
        tracker.calculate_rates("guest-1", sample(10 * MIB, 0));
        tracker.calculate_rates("guest-1", sample(15 * MIB, 5));

        // Counter dropped: zero for this window
        let rates = tracker.calculate_rates("guest-1", sample(12 * MIB, 10));
        assert_eq!(rates.disk_read, 0);

        // The reset value is the new baseline
        let rates = tracker.calculate_rates("guest-1", sample(12 * MIB + 5 * MIB, 15));
        assert_eq!(rates.disk_read, MIB);
    }

    #[test]
    fn non_positive_elapsed_yields_zero() {
        let tracker = RateTracker::new();
        tracker.calculate_rates("guest-1", sample(10 * MIB, 100));
        let rates = tracker.calculate_rates("guest-1", sample(20 * MIB, 100));
        assert_eq!(rates.disk_read, 0);

        let rates = tracker.calculate_rates("guest-1", sample(30 * MIB, 50));
        assert_eq!(rates.disk_read, 0);
    }

    #[test]
    fn resources_are_tracked_independently() {
        let tracker = RateTracker::new();
        tracker.calculate_rates("guest-1", sample(10 * MIB, 0));
        let rates = tracker.calculate_rates("guest-2", sample(99 * MIB, 5));
        assert_eq!(rates, IoRates::default());
    }

    #[test]
    fn stale_entries_are_evicted() {
        let tracker = RateTracker::new();
        tracker.calculate_rates("old-guest", sample(MIB, 0));
        assert_eq!(tracker.tracked_count(), 1);

        // Two hours later a different guest reports; the sweep drops the
        // entry that has not been updated within the staleness window.
        tracker.calculate_rates("new-guest", sample(MIB, 7200));
        assert_eq!(tracker.tracked_count(), 1);
    }
}
