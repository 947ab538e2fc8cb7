//! Report Data Structures

use chrono::{DateTime, Utc};
use paratest_ipc::{Fault, FaultKind, SuiteOutcome};
use paratest_stats::SlowReport;
use serde::Serialize;
use std::collections::BTreeMap;

/// Run-wide outcome, accumulated one suite at a time
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateResult {
    /// Tests executed across all suites
    pub test_count: u64,
    /// Assertions evaluated across all suites
    pub assertion_count: u64,
    /// Faults keyed by suite name
    pub faults: BTreeMap<String, Vec<Fault>>,
    /// Per-suite summaries in merge order
    pub suites: Vec<SuiteSummary>,
}

/// One merged suite
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuiteSummary {
    /// Suite name
    pub name: String,
    /// Tests executed
    pub test_count: u64,
    /// Assertions evaluated
    pub assertion_count: u64,
    /// Execution time inside the worker, in seconds
    pub duration_secs: f64,
    /// Whether every test passed
    pub passed: bool,
}

impl AggregateResult {
    /// Fold one suite outcome into the aggregate
    pub fn merge(&mut self, outcome: SuiteOutcome) {
        self.test_count += outcome.test_count;
        self.assertion_count += outcome.assertion_count;
        self.suites.push(SuiteSummary {
            name: outcome.suite.clone(),
            test_count: outcome.test_count,
            assertion_count: outcome.assertion_count,
            duration_secs: outcome.duration_nanos as f64 / 1e9,
            passed: outcome.passed(),
        });

        let passed = outcome.passed();
        let SuiteOutcome {
            suite,
            failures,
            errors,
            ..
        } = outcome;
        let faults = self.faults.entry(suite).or_default();
        if !passed {
            faults.extend(failures);
            faults.extend(errors);
        }
    }

    /// No suite recorded a fault
    pub fn success(&self) -> bool {
        self.faults.values().all(|f| f.is_empty())
    }

    /// All faults ordered by suite name
    pub fn ordered_faults(&self) -> impl Iterator<Item = &Fault> {
        self.faults.values().flatten()
    }

    /// Number of assertion failures
    pub fn failure_count(&self) -> usize {
        self.ordered_faults()
            .filter(|f| f.kind == FaultKind::Failure)
            .count()
    }

    /// Number of unexpected errors
    pub fn error_count(&self) -> usize {
        self.ordered_faults()
            .filter(|f| f.kind == FaultKind::Error)
            .count()
    }
}

/// Complete run report
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub meta: ReportMeta,
    pub summary: ReportSummary,
    /// Suites in the order they were handed to workers
    pub dispatch_order: Vec<String>,
    pub results: AggregateResult,
    pub slow: SlowReport,
}

/// Report metadata
#[derive(Debug, Clone, Serialize)]
pub struct ReportMeta {
    pub schema_version: u32,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    /// Run name from the request record
    pub run: String,
    /// Worker cap used for the run
    pub workers: usize,
}

/// Headline numbers
#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub suites: usize,
    pub tests: u64,
    pub assertions: u64,
    pub failures: usize,
    pub errors: usize,
    pub elapsed_secs: f64,
    pub success: bool,
}

impl Report {
    /// Assemble a report from the pieces a run produces
    pub fn build(
        run: &str,
        workers: usize,
        elapsed_secs: f64,
        dispatch_order: Vec<String>,
        results: AggregateResult,
        slow: SlowReport,
        run_succeeded: bool,
    ) -> Self {
        let summary = ReportSummary {
            suites: results.suites.len(),
            tests: results.test_count,
            assertions: results.assertion_count,
            failures: results.failure_count(),
            errors: results.error_count(),
            elapsed_secs,
            success: run_succeeded && results.success(),
        };

        Report {
            meta: ReportMeta {
                schema_version: crate::SCHEMA_VERSION,
                version: env!("CARGO_PKG_VERSION").to_string(),
                timestamp: Utc::now(),
                run: run.to_string(),
                workers,
            },
            summary,
            dispatch_order,
            results,
            slow,
        }
    }
}
