//! Jobsets: fair-share accounting groups.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

/// A named group of builds sharing one fair-share account.
///
/// Execution seconds of finished steps accumulate here; the dispatcher
/// prefers steps from the jobset with the lowest `seconds / shares` ratio,
/// so bursty past usage decays as it ages out of the window.
pub struct Jobset {
    seconds: AtomicI64,
    shares: AtomicU32,
    /// Step start time to total duration started then, for pruning.
    steps: Mutex<BTreeMap<i64, i64>>,
}

impl Jobset {
    pub fn new(shares: u32) -> Self {
        Self {
            seconds: AtomicI64::new(0),
            shares: AtomicU32::new(shares.max(1)),
            steps: Mutex::new(BTreeMap::new()),
        }
    }

    /// The fair-share key: accumulated seconds per share.
    pub fn share_used(&self) -> f64 {
        self.seconds.load(Ordering::Relaxed) as f64 / self.shares.load(Ordering::Relaxed) as f64
    }

    pub fn set_shares(&self, shares: u32) {
        self.shares.store(shares.max(1), Ordering::Relaxed);
    }

    pub fn shares(&self) -> u32 {
        self.shares.load(Ordering::Relaxed)
    }

    pub fn seconds(&self) -> i64 {
        self.seconds.load(Ordering::Relaxed)
    }

    /// Charge a finished step to this jobset and drop entries that have
    /// aged out of the scheduling window.
    pub fn add_step(&self, now: DateTime<Utc>, start_time: i64, duration: i64, window: i64) {
        {
            let mut steps = self.steps.lock();
            *steps.entry(start_time).or_insert(0) += duration;
        }
        self.seconds.fetch_add(duration, Ordering::Relaxed);
        self.prune_steps(now, window);
    }

    pub fn prune_steps(&self, now: DateTime<Utc>, window: i64) {
        let horizon = now.timestamp() - window;
        let mut steps = self.steps.lock();
        while let Some((&start, &duration)) = steps.first_key_value() {
            if start >= horizon {
                break;
            }
            steps.remove(&start);
            self.seconds.fetch_sub(duration, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: i64 = 24 * 60 * 60;

    #[test]
    fn share_used_divides_by_shares() {
        let jobset = Jobset::new(3);
        let now = Utc::now();
        jobset.add_step(now, now.timestamp(), 90, WINDOW);
        assert_eq!(jobset.seconds(), 90);
        assert!((jobset.share_used() - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_shares_is_clamped() {
        let jobset = Jobset::new(0);
        assert_eq!(jobset.shares(), 1);
        jobset.set_shares(0);
        assert_eq!(jobset.shares(), 1);
    }

    #[test]
    fn old_entries_are_pruned() {
        let jobset = Jobset::new(1);
        let now = Utc::now();
        let old_start = now.timestamp() - WINDOW - 100;
        jobset.add_step(now, old_start, 500, WINDOW);
        jobset.add_step(now, now.timestamp(), 60, WINDOW);
        // The old entry was charged and then pruned again.
        assert_eq!(jobset.seconds(), 60);
    }

    #[test]
    fn same_start_time_accumulates() {
        let jobset = Jobset::new(1);
        let now = Utc::now();
        let start = now.timestamp();
        jobset.add_step(now, start, 10, WINDOW);
        jobset.add_step(now, start, 20, WINDOW);
        assert_eq!(jobset.seconds(), 30);
    }
}
