//! Suite Execution
//!
//! Runs every test of a registered suite in the current process, catching
//! panics so that one broken test cannot take the worker down.

use crate::context::{AssertionFailure, TestContext};
use crate::{SuiteDef, SuiteDiscovery, SuiteExecutor, SuiteInfo, TestCase};
use paratest_ipc::{Fault, FaultKind, SuiteOutcome};
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Once;
use std::time::Instant;

thread_local! {
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
    static PANIC_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Chain a panic hook that records the backtrace at the panic site while a
/// test runs on this thread.
fn install_backtrace_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if CAPTURING.with(Cell::get) {
                let backtrace = Backtrace::force_capture();
                PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
            }
            previous(info);
        }));
    });
}

/// Run one test, returning the panic payload and its backtrace on failure.
fn run_test(
    test: &TestCase,
    ctx: &mut TestContext,
) -> Result<(), (Box<dyn std::any::Any + Send>, Option<Backtrace>)> {
    CAPTURING.with(|c| c.set(true));
    let result = catch_unwind(AssertUnwindSafe(|| (test.func)(ctx)));
    CAPTURING.with(|c| c.set(false));
    let backtrace = PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take());
    result.map_err(|panic| (panic, backtrace))
}

/// Execute all tests of `def` and summarize them.
pub fn run_suite(def: &SuiteDef) -> SuiteOutcome {
    install_backtrace_hook();
    let start = Instant::now();
    let mut outcome = SuiteOutcome::empty(def.name);

    for test in def.tests {
        let mut ctx = TestContext::new();
        let result = run_test(test, &mut ctx);

        outcome.test_count += 1;
        outcome.assertion_count += ctx.assertions();

        let Err((panic, backtrace)) = result else {
            continue;
        };

        match panic.downcast::<AssertionFailure>() {
            Ok(failure) => outcome.failures.push(Fault {
                kind: FaultKind::Failure,
                suite: def.name.to_string(),
                test: test.name.to_string(),
                message: failure.message,
                backtrace: None,
            }),
            Err(panic) => {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                let backtrace = backtrace.map(|b| b.to_string());

                outcome.errors.push(Fault {
                    kind: FaultKind::Error,
                    suite: def.name.to_string(),
                    test: test.name.to_string(),
                    message,
                    backtrace,
                });
            }
        }
    }

    outcome.duration_nanos = start.elapsed().as_nanos() as u64;
    outcome
}

/// Suites registered in this binary through `inventory`
#[derive(Debug, Clone, Copy, Default)]
pub struct Registry;

impl Registry {
    /// All registered suites, in registration order
    pub fn suites() -> impl Iterator<Item = &'static SuiteDef> {
        inventory::iter::<SuiteDef>.into_iter()
    }

    /// Look up a suite by name
    pub fn find(name: &str) -> Option<&'static SuiteDef> {
        Self::suites().find(|s| s.name == name)
    }
}

impl SuiteDiscovery for Registry {
    fn enumerate(&self) -> BTreeMap<String, SuiteInfo> {
        let mut suites = BTreeMap::new();
        for def in Self::suites() {
            if suites.contains_key(def.name) {
                tracing::warn!(suite = def.name, file = def.file, "duplicate suite name ignored");
                continue;
            }
            suites.insert(def.name.to_string(), SuiteInfo::from(def));
        }
        suites
    }
}

impl SuiteExecutor for Registry {
    fn run(&self, suite: &str) -> SuiteOutcome {
        match Self::find(suite) {
            Some(def) => run_suite(def),
            None => SuiteOutcome {
                errors: vec![Fault {
                    kind: FaultKind::Error,
                    suite: suite.to_string(),
                    test: String::new(),
                    message: format!("Suite not found: {}", suite),
                    backtrace: None,
                }],
                ..SuiteOutcome::empty(suite)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passes(ctx: &mut TestContext) {
        ctx.assert(true, "fine");
        ctx.assert_eq(1, 1);
    }

    fn fails(ctx: &mut TestContext) {
        ctx.assert(false, "nope");
    }

    fn errors(_ctx: &mut TestContext) {
        panic!("database went away");
    }

    #[inline(never)]
    fn connection_dropped_mid_query(_ctx: &mut TestContext) {
        panic!("connection reset");
    }

    static BROKEN: SuiteDef = SuiteDef {
        name: "Broken",
        tests: &[TestCase {
            name: "connection_dropped_mid_query",
            func: connection_dropped_mid_query,
        }],
        file: file!(),
        module_path: module_path!(),
    };

    static MIXED: SuiteDef = SuiteDef {
        name: "Mixed",
        tests: &[
            TestCase {
                name: "passes",
                func: passes,
            },
            TestCase {
                name: "fails",
                func: fails,
            },
            TestCase {
                name: "errors",
                func: errors,
            },
        ],
        file: file!(),
        module_path: module_path!(),
    };

    #[test]
    fn test_run_suite_classifies_faults() {
        let outcome = run_suite(&MIXED);
        assert_eq!(outcome.suite, "Mixed");
        assert_eq!(outcome.test_count, 3);
        assert_eq!(outcome.assertion_count, 3);

        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].test, "fails");
        assert!(outcome.failures[0].message.starts_with("nope"));

        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].test, "errors");
        assert_eq!(outcome.errors[0].message, "database went away");
        assert!(!outcome.passed());
    }

    #[test]
    fn test_error_backtrace_points_at_panic_site() {
        let outcome = run_suite(&BROKEN);
        assert_eq!(outcome.errors.len(), 1);
        let backtrace = outcome.errors[0].backtrace.as_deref().unwrap();
        assert!(
            backtrace.contains("connection_dropped_mid_query"),
            "backtrace: {}",
            backtrace
        );
    }

    #[test]
    fn test_failures_carry_no_backtrace() {
        let outcome = run_suite(&MIXED);
        assert!(outcome.failures[0].backtrace.is_none());
        assert!(outcome.errors[0].backtrace.is_some());
    }

    #[test]
    fn test_unknown_suite_is_an_error() {
        let outcome = Registry.run("NoSuchSuite");
        assert_eq!(outcome.test_count, 0);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].message.contains("NoSuchSuite"));
    }
}
