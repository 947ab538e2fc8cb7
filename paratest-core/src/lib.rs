#![warn(missing_docs)]
//! paratest Core - Worker Runtime
//!
//! This crate provides the execution environment inside a worker process:
//! - `SuiteDef` registration through `inventory`
//! - `TestContext` assertion tracking
//! - The suite executor, which turns panics into plain-data faults
//! - `WorkerMain`, the loop that serves suites to the orchestrator
//! - Collaborator traits for provisioning, discovery and core counting

mod collaborators;
mod context;
mod executor;
mod worker;

pub use collaborators::{
    CoreCountProbe, NoProvisioning, ProvisionError, SchemaProvisioner, SuiteDiscovery,
    SuiteExecutor, SuiteInfo, SystemCores, default_worker_count,
};
pub use context::{AssertionFailure, TestContext};
pub use executor::{Registry, run_suite};
pub use worker::{WorkerError, WorkerExit, WorkerMain, shutdown_requested};

/// A single test inside a suite
#[derive(Debug, Clone, Copy)]
pub struct TestCase {
    /// Test name
    pub name: &'static str,
    /// Test body
    pub func: fn(&mut TestContext),
}

/// Suite definition registered via `paratest::suite!`
#[derive(Debug, Clone)]
pub struct SuiteDef {
    /// Unique suite name
    pub name: &'static str,
    /// Tests, run in order
    pub tests: &'static [TestCase],
    /// Source file path
    pub file: &'static str,
    /// Module path
    pub module_path: &'static str,
}

impl From<&SuiteDef> for SuiteInfo {
    fn from(def: &SuiteDef) -> Self {
        SuiteInfo {
            test_count: def.tests.len(),
            file: def.file.to_string(),
            module_path: def.module_path.to_string(),
        }
    }
}

// Collect all registered suites
inventory::collect!(SuiteDef);

/// Anchor to prevent LTO from stripping inventory entries
#[used]
#[doc(hidden)]
pub static REGISTRY_ANCHOR: fn() = || {
    for _ in inventory::iter::<SuiteDef> {}
};
