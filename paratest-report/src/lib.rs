#![warn(missing_docs)]
//! paratest Report - Run Results and Output
//!
//! Accumulates suite outcomes into a run-wide result and renders it:
//! - Human (terminal summary with numbered faults and slow suites)
//! - JSON (machine-readable)

mod human;
mod json;
mod report;

pub use human::format_human_output;
pub use json::generate_json_report;
pub use report::{AggregateResult, Report, ReportMeta, ReportSummary, SuiteSummary};

/// Version of the JSON report layout
pub const SCHEMA_VERSION: u32 = 1;

/// Output format selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable terminal output
    #[default]
    Human,
    /// JSON with full schema
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "human" | "text" => Ok(OutputFormat::Human),
            other => Err(format!("Unknown output format: {}", other)),
        }
    }
}
