//! Straggler Analysis
//!
//! Records which suites each worker ran and when the worker finished, then
//! looks for suites that ran alone on a worker and pushed the end of the run
//! out noticeably.
//!
//! Workers that ran two or more suites form the "multi" cohort. A worker that
//! ran exactly one suite is a straggler candidate. Candidates are examined in
//! finish order:
//!
//! - with a cohort: folded in when they finish less than [`BUNDLE_SECONDS`] or
//!   less than [`BUNDLE_FACTOR`] of the cohort's duration past it
//! - without a cohort: folded in (seeding the cohort) when their own duration
//!   is under [`LONE_SECONDS`]
//!
//! Whatever survives is reported. All times are seconds since the run started.

use fxhash::FxHashMap;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Suites shorter than this are not recorded
pub const SKIP_DURATION: f64 = 0.01;

/// Absolute extension (seconds) below which a lone suite is noise
pub const BUNDLE_SECONDS: f64 = 3.0;

/// Relative extension below which a lone suite is noise
pub const BUNDLE_FACTOR: f64 = 0.10;

/// Without a cohort, lone suites shorter than this are noise
pub const LONE_SECONDS: f64 = 10.0;

/// Closing advice appended when stragglers are reported
pub const SUGGESTION: &str =
    "Consider splitting or optimizing these suites to shorten the overall run.";

/// One worker's timeline
#[derive(Debug, Clone, Default)]
pub struct Entry {
    suites: Vec<(String, f64)>,
    finish_time: Option<f64>,
}

impl Entry {
    fn add(&mut self, suite: &str, duration: f64) {
        if duration >= SKIP_DURATION {
            self.suites.push((suite.to_string(), duration));
        }
    }

    /// Sum of recorded suite durations (a proxy for busy time)
    pub fn duration(&self) -> f64 {
        self.suites.iter().map(|(_, d)| d).sum()
    }

    /// Number of recorded suites
    pub fn suite_count(&self) -> usize {
        self.suites.len()
    }

    /// Seconds since run start at which the worker finished
    pub fn finish_time(&self) -> Option<f64> {
        self.finish_time
    }

    /// The suite of a single-suite worker
    pub fn single_suite(&self) -> Option<&str> {
        match self.suites.as_slice() {
            [(suite, _)] => Some(suite),
            _ => None,
        }
    }
}

/// A suite that ran alone and extended the run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Straggler {
    /// Suite name
    pub suite: String,
    /// Suite duration in seconds
    pub duration: f64,
    /// Finish time in seconds since run start
    pub finish: f64,
    /// Extension past the prior cumulative finish point, in percent
    pub extension_pct: Option<f64>,
    /// Extension past the cohort finish, in percent (from the second straggler on)
    pub total_pct: Option<f64>,
}

/// Derived straggler view, ordered by finish time
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SlowReport {
    /// Surviving stragglers
    pub stragglers: Vec<Straggler>,
}

impl SlowReport {
    /// Whether anything is worth reporting
    pub fn show(&self) -> bool {
        !self.stragglers.is_empty()
    }

    /// Report lines, followed by a suggestion when non-empty
    pub fn output(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.stragglers.iter().map(format_straggler).collect();
        if self.show() {
            lines.push(SUGGESTION.to_string());
        }
        lines
    }
}

fn format_straggler(straggler: &Straggler) -> String {
    let mut line = format!("{} took {:.2}s", straggler.suite, straggler.duration);
    match straggler.extension_pct {
        Some(pct) => line.push_str(&format!(" and extended the run by {}%", pct.round() as i64)),
        None => line.push_str(" and ran alone"),
    }
    if let Some(total) = straggler.total_pct {
        line.push_str(&format!(" (total {}%)", total.round() as i64));
    }
    line
}

/// Per-worker timelines for one run
#[derive(Debug)]
pub struct Stats {
    entries: FxHashMap<u32, Entry>,
    start: Instant,
}

impl Stats {
    /// Start recording; finish times are measured from now
    pub fn new() -> Self {
        Self {
            entries: FxHashMap::default(),
            start: Instant::now(),
        }
    }

    /// Record that `worker` spent `duration` on `suite`
    pub fn add(&mut self, worker: u32, suite: &str, duration: Duration) {
        self.entries
            .entry(worker)
            .or_default()
            .add(suite, duration.as_secs_f64());
    }

    /// Mark `worker` as finished now. Only the first call counts.
    pub fn finish(&mut self, worker: u32) {
        let now = self.start.elapsed().as_secs_f64();
        self.finish_at(worker, now);
    }

    /// Mark `worker` as finished at `seconds` since start. Only the first call counts.
    pub fn finish_at(&mut self, worker: u32, seconds: f64) {
        let entry = self.entries.entry(worker).or_default();
        if entry.finish_time.is_none() {
            entry.finish_time = Some(seconds);
        }
    }

    /// Timeline of one worker
    pub fn entry(&self, worker: u32) -> Option<&Entry> {
        self.entries.get(&worker)
    }

    /// Classify workers and compute the straggler view
    pub fn analyze(&self) -> SlowReport {
        let mut finished: Vec<(u32, &Entry, f64)> = self
            .entries
            .iter()
            .filter_map(|(&id, e)| e.finish_time.map(|t| (id, e, t)))
            .filter(|(_, e, _)| e.suite_count() > 0)
            .collect();
        finished.sort_by(|a, b| a.2.total_cmp(&b.2).then(a.0.cmp(&b.0)));

        let mut cohort: Option<f64> = finished
            .iter()
            .filter(|(_, e, _)| e.suite_count() >= 2)
            .map(|(_, _, t)| *t)
            .max_by(|a, b| a.total_cmp(b));

        let mut frontier = cohort.unwrap_or(0.0);
        let mut base: Option<f64> = None;
        let mut stragglers = Vec::new();

        for (_, entry, finish) in finished.iter().filter(|(_, e, _)| e.suite_count() == 1) {
            let finish = *finish;
            let duration = entry.duration();

            let bundled = match cohort {
                Some(cohort_finish) => {
                    let extension = finish - cohort_finish;
                    extension < BUNDLE_SECONDS || extension < cohort_finish * BUNDLE_FACTOR
                }
                None => duration < LONE_SECONDS,
            };

            if bundled {
                cohort = Some(cohort.map_or(finish, |c| c.max(finish)));
                frontier = frontier.max(finish);
                continue;
            }

            let prior = frontier;
            let origin = *base.get_or_insert(prior);
            let extension_pct = (prior > 0.0).then(|| (finish - prior) * 100.0 / prior);
            let total_pct = if stragglers.is_empty() || origin <= 0.0 {
                None
            } else {
                Some((finish - origin) * 100.0 / origin)
            };

            stragglers.push(Straggler {
                suite: entry.single_suite().unwrap_or_default().to_string(),
                duration,
                finish,
                extension_pct,
                total_pct,
            });
            frontier = frontier.max(finish);
        }

        SlowReport { stragglers }
    }

    /// Whether the analysis flags at least one straggler
    pub fn show(&self) -> bool {
        self.analyze().show()
    }

    /// Straggler report lines
    pub fn output(&self) -> Vec<String> {
        self.analyze().output()
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    /// Worker 1 and 2 form a cohort finishing at 100s.
    fn cohort_at_100() -> Stats {
        let mut stats = Stats::new();
        stats.add(1, "A", secs(60.0));
        stats.add(1, "B", secs(40.0));
        stats.finish_at(1, 100.0);
        stats.add(2, "C", secs(50.0));
        stats.add(2, "D", secs(45.0));
        stats.finish_at(2, 96.0);
        stats
    }

    #[test]
    fn test_straggler_extending_half_the_run() {
        let mut stats = cohort_at_100();
        stats.add(3, "Slow", secs(150.0));
        stats.finish_at(3, 150.0);

        let report = stats.analyze();
        assert!(report.show());
        assert_eq!(report.stragglers.len(), 1);
        assert_eq!(report.stragglers[0].suite, "Slow");
        assert_eq!(report.stragglers[0].extension_pct, Some(50.0));

        let lines = report.output();
        assert_eq!(lines[0], "Slow took 150.00s and extended the run by 50%");
        assert_eq!(lines[1], SUGGESTION);
    }

    #[test]
    fn test_lone_short_suite_folds_without_cohort() {
        let mut stats = Stats::new();
        stats.add(1, "Quick", secs(8.0));
        stats.finish_at(1, 8.0);

        assert!(!stats.show());
        assert!(stats.output().is_empty());
    }

    #[test]
    fn test_small_absolute_extension_is_bundled() {
        let mut stats = cohort_at_100();
        // 2.5s past a 100s cohort: under 3s
        stats.add(3, "Close", secs(102.5));
        stats.finish_at(3, 102.5);
        assert!(!stats.show());
    }

    #[test]
    fn test_small_relative_extension_is_bundled() {
        let mut stats = cohort_at_100();
        // 8s past: over 3s, but under 10% of 100s
        stats.add(3, "Close", secs(108.0));
        stats.finish_at(3, 108.0);
        assert!(!stats.show());
    }

    #[test]
    fn test_running_total_for_multiple_stragglers() {
        let mut stats = cohort_at_100();
        stats.add(3, "First", secs(150.0));
        stats.finish_at(3, 150.0);
        stats.add(4, "Second", secs(180.0));
        stats.finish_at(4, 180.0);

        let lines = stats.output();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "First took 150.00s and extended the run by 50%");
        assert_eq!(
            lines[1],
            "Second took 180.00s and extended the run by 20% (total 80%)"
        );
    }

    #[test]
    fn test_bundled_single_extends_cohort() {
        let mut stats = cohort_at_100();
        stats.add(3, "Near", secs(109.0));
        stats.finish_at(3, 109.0);
        // 10.5s past the grown cohort (109s) is still under 10.9s
        stats.add(4, "Later", secs(119.5));
        stats.finish_at(4, 119.5);
        assert!(!stats.show());
    }

    #[test]
    fn test_long_lone_suite_without_cohort() {
        let mut stats = Stats::new();
        stats.add(1, "Huge", secs(30.0));
        stats.finish_at(1, 30.0);

        let report = stats.analyze();
        assert!(report.show());
        assert_eq!(report.stragglers[0].extension_pct, None);
        assert_eq!(report.output()[0], "Huge took 30.00s and ran alone");
    }

    #[test]
    fn test_finish_first_call_wins() {
        let mut stats = Stats::new();
        stats.add(1, "A", secs(1.0));
        stats.finish_at(1, 5.0);
        stats.finish_at(1, 9.0);
        stats.finish(1);
        assert_eq!(stats.entry(1).unwrap().finish_time(), Some(5.0));
    }

    #[test]
    fn test_tiny_suites_not_recorded() {
        let mut stats = Stats::new();
        stats.add(1, "Tiny", Duration::from_millis(2));
        stats.add(1, "Real", secs(1.0));
        let entry = stats.entry(1).unwrap();
        assert_eq!(entry.suite_count(), 1);
        assert_eq!(entry.single_suite(), Some("Real"));
    }

    #[test]
    fn test_unfinished_workers_ignored() {
        let mut stats = cohort_at_100();
        stats.add(3, "Crashed", secs(500.0));
        assert!(!stats.show());
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let build = || {
            let mut stats = cohort_at_100();
            stats.add(5, "X", secs(140.0));
            stats.finish_at(5, 140.0);
            stats.add(6, "Y", secs(140.0));
            stats.finish_at(6, 140.0);
            stats
        };
        assert_eq!(build().output(), build().output());
        assert_eq!(build().analyze(), build().analyze());
    }
}
