//! Suite Collector
//!
//! Greedy longest-first scheduler. Suites are handed out by estimated duration
//! (from the timing store), then by test count, then by name, so the longest
//! work starts first and short suites fill the gaps at the end of a run.

use crate::timings::TimingStore;
use fxhash::{FxHashMap, FxHashSet};
use paratest_core::SuiteInfo;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};

#[derive(Debug, Clone)]
struct Pending {
    estimate: f64,
    test_count: usize,
    name: String,
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.estimate
            .total_cmp(&other.estimate)
            .then(self.test_count.cmp(&other.test_count))
            // max-heap: the smaller name must compare greater
            .then_with(|| other.name.cmp(&self.name))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

/// Priority queue of undispatched suites plus completion tracking
#[derive(Debug)]
pub struct Collector {
    queue: BinaryHeap<Pending>,
    estimates: FxHashMap<String, f64>,
    completed: FxHashSet<String>,
    total_estimate: f64,
    completed_estimate: f64,
}

impl Collector {
    /// Build the queue for `suites`, estimating each from `run`'s history.
    pub fn build(
        timings: &mut TimingStore,
        run: &str,
        suites: &BTreeMap<String, SuiteInfo>,
    ) -> Self {
        let mut queue = BinaryHeap::with_capacity(suites.len());
        let mut estimates = FxHashMap::default();
        let mut total_estimate = 0.0;

        for (name, info) in suites {
            let estimate = timings.fetch(run, name);
            total_estimate += estimate;
            estimates.insert(name.clone(), estimate);
            queue.push(Pending {
                estimate,
                test_count: info.test_count,
                name: name.clone(),
            });
        }

        tracing::debug!(
            suites = suites.len(),
            total_estimate,
            "schedule built"
        );

        Self {
            queue,
            estimates,
            completed: FxHashSet::default(),
            total_estimate,
            completed_estimate: 0.0,
        }
    }

    /// Next suite to dispatch, or `None` when the queue is empty
    pub fn next(&mut self) -> Option<String> {
        self.queue.pop().map(|p| p.name)
    }

    /// Record that `suite` has produced its result. Returns false for an
    /// unknown or already-completed suite.
    pub fn mark_complete(&mut self, suite: &str) -> bool {
        let Some(&estimate) = self.estimates.get(suite) else {
            return false;
        };
        if !self.completed.insert(suite.to_string()) {
            return false;
        }
        self.completed_estimate += estimate;
        true
    }

    /// Completed share of the estimated work, 0–100; `None` when nothing has an estimate
    pub fn completion_percent(&self) -> Option<f64> {
        if self.total_estimate <= 0.0 {
            return None;
        }
        // Sums are taken in different orders and may not meet exactly
        if self.completed.len() == self.estimates.len() {
            return Some(100.0);
        }
        Some((self.completed_estimate / self.total_estimate * 100.0).min(100.0))
    }

    /// Suites not yet dispatched
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    /// Suites known to this schedule
    pub fn suite_count(&self) -> usize {
        self.estimates.len()
    }

    /// Suites whose result has been recorded
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Estimated duration of `suite` in seconds
    pub fn estimate(&self, suite: &str) -> Option<f64> {
        self.estimates.get(suite).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn universe(entries: &[(&str, usize)]) -> BTreeMap<String, SuiteInfo> {
        entries
            .iter()
            .map(|(name, tests)| (name.to_string(), SuiteInfo::with_tests(*tests)))
            .collect()
    }

    fn drain(collector: &mut Collector) -> Vec<String> {
        std::iter::from_fn(|| collector.next()).collect()
    }

    #[test]
    fn test_order_without_history_uses_test_count() {
        let mut timings = TimingStore::in_memory();
        let suites = universe(&[("A", 5), ("B", 1), ("C", 20)]);
        let mut collector = Collector::build(&mut timings, "run", &suites);

        assert_eq!(collector.suite_count(), 3);
        assert_eq!(drain(&mut collector), vec!["C", "A", "B"]);
        assert_eq!(collector.remaining(), 0);
        assert_eq!(collector.next(), None);
    }

    #[test]
    fn test_history_beats_test_count() {
        let mut timings = TimingStore::in_memory();
        timings.record("run", "B", Duration::from_secs(30));
        timings.record("run", "A", Duration::from_secs(5));
        timings.flush();

        let suites = universe(&[("A", 5), ("B", 1), ("C", 20)]);
        let mut collector = Collector::build(&mut timings, "run", &suites);

        assert_eq!(collector.estimate("B"), Some(30.0));
        assert_eq!(collector.estimate("C"), Some(0.0));
        assert_eq!(drain(&mut collector), vec!["B", "A", "C"]);
    }

    #[test]
    fn test_name_breaks_ties() {
        let mut timings = TimingStore::in_memory();
        let suites = universe(&[("Zeta", 2), ("Alpha", 2), ("Mid", 2)]);
        let mut collector = Collector::build(&mut timings, "run", &suites);
        assert_eq!(drain(&mut collector), vec!["Alpha", "Mid", "Zeta"]);
    }

    #[test]
    fn test_completion_unknown_without_estimates() {
        let mut timings = TimingStore::in_memory();
        let suites = universe(&[("A", 5), ("B", 1)]);
        let mut collector = Collector::build(&mut timings, "run", &suites);

        assert_eq!(collector.completion_percent(), None);
        collector.next();
        assert!(collector.mark_complete("A"));
        assert_eq!(collector.completion_percent(), None);
        assert_eq!(collector.completed_count(), 1);
    }

    #[test]
    fn test_completion_is_monotonic() {
        let mut timings = TimingStore::in_memory();
        for (suite, secs) in [("A", 6), ("B", 3), ("C", 1)] {
            timings.record("run", suite, Duration::from_secs(secs));
        }
        timings.flush();

        let suites = universe(&[("A", 1), ("B", 1), ("C", 1)]);
        let mut collector = Collector::build(&mut timings, "run", &suites);
        assert_eq!(collector.completion_percent(), Some(0.0));

        let mut last = 0.0;
        while let Some(suite) = collector.next() {
            assert!(collector.mark_complete(&suite));
            let pct = collector.completion_percent().unwrap();
            assert!(pct >= last);
            last = pct;
        }
        assert_eq!(last, 100.0);
    }

    #[test]
    fn test_completion_reaches_exactly_100_with_fractional_estimates() {
        let mut timings = TimingStore::in_memory();
        for (suite, millis) in [("A", 100), ("B", 200), ("C", 300)] {
            timings.record("run", suite, Duration::from_millis(millis));
        }
        timings.flush();

        let suites = universe(&[("A", 1), ("B", 1), ("C", 1)]);
        let mut collector = Collector::build(&mut timings, "run", &suites);

        let mut last = 0.0;
        while let Some(suite) = collector.next() {
            assert!(collector.mark_complete(&suite));
            let pct = collector.completion_percent().unwrap();
            assert!(pct >= last);
            last = pct;
        }
        assert_eq!(last, 100.0);
    }

    #[test]
    fn test_mark_complete_rejects_unknown_and_repeats() {
        let mut timings = TimingStore::in_memory();
        let suites = universe(&[("A", 1)]);
        let mut collector = Collector::build(&mut timings, "run", &suites);

        assert!(!collector.mark_complete("Nope"));
        assert!(collector.mark_complete("A"));
        assert!(!collector.mark_complete("A"));
    }
}
