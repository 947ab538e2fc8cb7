//! Suite Planner
//!
//! Selects the suite universe for a run from the registered suites.
//!
//! Selection options:
//! - Requested source files
//! - `require` options naming module path prefixes
//! - Regex pattern matching on suite name
//!
//! With no files and no requires, every registered suite is selected.

use paratest_core::SuiteInfo;
use paratest_ipc::RunRequest;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;

/// Suites selected for one run, keyed (and so sorted) by name
pub struct SuitePlan {
    /// Selected suites
    pub suites: BTreeMap<String, SuiteInfo>,
}

impl SuitePlan {
    /// Number of selected suites
    pub fn len(&self) -> usize {
        self.suites.len()
    }

    /// Whether nothing was selected
    pub fn is_empty(&self) -> bool {
        self.suites.is_empty()
    }

    /// Total number of tests across selected suites
    pub fn test_count(&self) -> usize {
        self.suites.values().map(|s| s.test_count).sum()
    }
}

/// Build the suite plan for `request` from every discovered suite.
pub fn build_plan(
    discovered: BTreeMap<String, SuiteInfo>,
    request: &RunRequest,
    filter: Option<&Regex>,
) -> SuitePlan {
    let requires: Vec<&str> = request.requires().collect();
    let files = &request.files;

    let suites = discovered
        .into_iter()
        .filter(|(name, info)| {
            if !files.is_empty() || !requires.is_empty() {
                let by_file = files.iter().any(|f| same_file(&info.file, f));
                let by_require = requires.iter().any(|r| module_matches(&info.module_path, r));
                if !by_file && !by_require {
                    return false;
                }
            }

            if let Some(re) = filter {
                if !re.is_match(name) {
                    return false;
                }
            }

            true
        })
        .collect();

    SuitePlan { suites }
}

/// `registered` is as `file!()` recorded it; `requested` may be longer or shorter
fn same_file(registered: &str, requested: &str) -> bool {
    if registered.is_empty() {
        return false;
    }
    let registered = Path::new(registered);
    let requested = Path::new(requested);
    registered.ends_with(requested) || requested.ends_with(registered)
}

fn module_matches(module_path: &str, require: &str) -> bool {
    module_path == require
        || module_path
            .strip_prefix(require)
            .is_some_and(|rest| rest.starts_with("::"))
}
