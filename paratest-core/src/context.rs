//! Test Context
//!
//! Handed to every test function. Counts assertions and turns a failed
//! assertion into an [`AssertionFailure`] panic, which the executor reports as
//! a failure rather than an error.

use std::fmt::Debug;
use std::panic::Location;

/// Panic payload raised by a failed assertion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionFailure {
    /// What went wrong, including the caller location
    pub message: String,
}

/// Per-test assertion tracker
#[derive(Debug, Default)]
pub struct TestContext {
    assertions: u64,
}

impl TestContext {
    /// Fresh context with no assertions counted
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of assertions evaluated so far
    pub fn assertions(&self) -> u64 {
        self.assertions
    }

    /// Count a passing assertion without checking anything
    pub fn pass(&mut self) {
        self.assertions += 1;
    }

    /// Assert that `condition` holds
    #[track_caller]
    pub fn assert(&mut self, condition: bool, message: impl Into<String>) {
        self.assertions += 1;
        if !condition {
            raise(message.into(), Location::caller());
        }
    }

    /// Assert that two values are equal
    #[track_caller]
    pub fn assert_eq<T: PartialEq + Debug>(&mut self, expected: T, actual: T) {
        self.assertions += 1;
        if expected != actual {
            raise(
                format!("expected {:?}, got {:?}", expected, actual),
                Location::caller(),
            );
        }
    }

    /// Assert that two values differ
    #[track_caller]
    pub fn assert_ne<T: PartialEq + Debug>(&mut self, unexpected: T, actual: T) {
        self.assertions += 1;
        if unexpected == actual {
            raise(
                format!("expected anything but {:?}", unexpected),
                Location::caller(),
            );
        }
    }

    /// Fail the test unconditionally
    #[track_caller]
    pub fn fail(&mut self, message: impl Into<String>) -> ! {
        self.assertions += 1;
        raise(message.into(), Location::caller())
    }
}

fn raise(message: String, location: &Location<'_>) -> ! {
    std::panic::panic_any(AssertionFailure {
        message: format!("{} ({}:{})", message, location.file(), location.line()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    #[test]
    fn test_counts_assertions() {
        let mut ctx = TestContext::new();
        ctx.assert(true, "always");
        ctx.assert_eq(2, 1 + 1);
        ctx.assert_ne("a", "b");
        ctx.pass();
        assert_eq!(ctx.assertions(), 4);
    }

    #[test]
    fn test_failed_assertion_payload() {
        let mut ctx = TestContext::new();
        let result = catch_unwind(AssertUnwindSafe(|| ctx.assert_eq(3, 4)));
        let payload = result.unwrap_err();
        let failure = payload.downcast_ref::<AssertionFailure>().unwrap();
        assert!(failure.message.starts_with("expected 3, got 4"));
        assert!(failure.message.contains("context.rs"));
        assert_eq!(ctx.assertions(), 1);
    }
}
