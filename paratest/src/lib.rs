#![warn(missing_docs)]
//! # paratest
//!
//! Parallel test-suite runner for large, fixed batches of independent suites.
//!
//! - **Process Isolation**: every worker is a separate process with its own
//!   database; a crashing worker aborts the run with a clear report
//! - **Timing-Fed Scheduling**: suites start longest-first, estimated from the
//!   last ten recorded durations
//! - **Straggler Report**: suites that ran alone at the end of a run are named,
//!   with how much they extended it
//!
//! ## Quick Start
//!
//! ```ignore
//! use paratest::prelude::*;
//!
//! fn charges_tax(ctx: &mut TestContext) {
//!     ctx.assert_eq(7, 3 + 4);
//! }
//!
//! fn refunds(ctx: &mut TestContext) {
//!     ctx.assert(true, "refund issued");
//! }
//!
//! paratest::suite!("Billing" => [charges_tax, refunds]);
//!
//! fn main() -> anyhow::Result<std::process::ExitCode> {
//!     paratest::run()
//! }
//! ```

// Re-export core types
pub use paratest_core::{
    AssertionFailure, CoreCountProbe, NoProvisioning, ProvisionError, Registry, SchemaProvisioner,
    SuiteDef, SuiteDiscovery, SuiteExecutor, SuiteInfo, TestCase, TestContext, run_suite,
};

// Re-export wire types
pub use paratest_ipc::{Fault, FaultKind, RunOption, RunRequest, SuiteOutcome};

// Re-export reporting
pub use paratest_report::{AggregateResult, OutputFormat, Report};
pub use paratest_stats::{SlowReport, Stats, Straggler};

/// Run the paratest CLI harness.
///
/// Call this from your harness binary's `main()`:
/// ```ignore
/// fn main() -> anyhow::Result<std::process::ExitCode> {
///     paratest::run()
/// }
/// ```
pub use paratest_cli::{Harness, run};

/// Internal re-exports for macro use
#[doc(hidden)]
pub mod internal {
    pub use inventory;
}

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{Harness, SchemaProvisioner, TestContext, suite};
}

/// Register a suite: a unique name and the test functions it runs, in order.
///
/// ```ignore
/// paratest::suite!("Billing" => [charges_tax, refunds]);
/// ```
#[macro_export]
macro_rules! suite {
    ($name:expr => [$($test:ident),* $(,)?]) => {
        $crate::internal::inventory::submit! {
            $crate::SuiteDef {
                name: $name,
                tests: &[$($crate::TestCase { name: stringify!($test), func: $test }),*],
                file: file!(),
                module_path: module_path!(),
            }
        }
    };
}
