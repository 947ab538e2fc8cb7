#![warn(missing_docs)]
//! paratest Run Statistics
//!
//! Per-worker timelines collected during a run and the post-run straggler
//! (critical path) analysis built from them.

mod straggler;

pub use straggler::{
    BUNDLE_FACTOR, BUNDLE_SECONDS, Entry, LONE_SECONDS, SKIP_DURATION, SUGGESTION, SlowReport,
    Stats, Straggler,
};
