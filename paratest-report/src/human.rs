//! Human Output
//!
//! Terminal summary in the classic test-runner shape: timing line, numbered
//! faults, counts, then any slow suites worth a look.

use crate::report::Report;
use paratest_ipc::{Fault, FaultKind};

/// Format a report for terminal display
pub fn format_human_output(report: &Report) -> String {
    let mut output = String::new();
    let summary = &report.summary;

    let (tests_per_sec, assertions_per_sec) = if summary.elapsed_secs > 0.0 {
        (
            summary.tests as f64 / summary.elapsed_secs,
            summary.assertions as f64 / summary.elapsed_secs,
        )
    } else {
        (0.0, 0.0)
    };

    output.push_str(&format!(
        "\nFinished tests in {:.6}s, {:.4} tests/s, {:.4} assertions/s.\n",
        summary.elapsed_secs, tests_per_sec, assertions_per_sec
    ));

    for (index, fault) in report.results.ordered_faults().enumerate() {
        output.push_str(&format!("\n{:3}) {}\n", index + 1, describe_fault(fault)));
    }

    output.push_str(&format!(
        "\n{} tests, {} assertions, {} failures, {} errors\n",
        summary.tests, summary.assertions, summary.failures, summary.errors
    ));

    if report.slow.show() {
        output.push_str("\nSlow suites:\n");
        for line in report.slow.output() {
            output.push_str(&format!("  {}\n", line));
        }
    }

    output
}

fn describe_fault(fault: &Fault) -> String {
    let label = match fault.kind {
        FaultKind::Failure => "Failure",
        FaultKind::Error => "Error",
    };
    let location = if fault.test.is_empty() {
        fault.suite.clone()
    } else {
        format!("{}#{}", fault.suite, fault.test)
    };

    let mut text = format!("{}:\n{}: {}", label, location, fault.message);
    if let Some(backtrace) = &fault.backtrace {
        for line in backtrace.lines().take(8) {
            text.push_str("\n    ");
            text.push_str(line.trim());
        }
    }
    text
}
