//! External Collaborators
//!
//! Interfaces the orchestration engine consumes but does not implement in
//! full: database provisioning, suite discovery and execution, core counting.

use paratest_ipc::SuiteOutcome;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while preparing databases
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Schema provisioning failed: {0}")]
    Failed(String),

    #[error("I/O error during provisioning: {0}")]
    Io(#[from] std::io::Error),
}

/// Prepares the isolated, migrated databases a run needs.
///
/// Implementations must be idempotent: loading a database whose schema digest
/// is already current is a no-op.
pub trait SchemaProvisioner: Send + Sync {
    /// Ensure the main database exists. Returns `true` when it had to be loaded.
    fn load_main(&self) -> Result<bool, ProvisionError>;

    /// Ensure worker `worker` has its own numbered database.
    fn load_for_worker(&self, worker: u32) -> Result<(), ProvisionError>;
}

/// Provisioner for suites that need no database
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProvisioning;

impl SchemaProvisioner for NoProvisioning {
    fn load_main(&self) -> Result<bool, ProvisionError> {
        Ok(false)
    }

    fn load_for_worker(&self, _worker: u32) -> Result<(), ProvisionError> {
        Ok(())
    }
}

/// What the scheduler needs to know about a discovered suite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteInfo {
    /// Number of tests in the suite
    pub test_count: usize,
    /// Source file the suite was registered from
    pub file: String,
    /// Module path the suite was registered from
    pub module_path: String,
}

impl SuiteInfo {
    /// Info for a suite with `test_count` tests and no source location
    pub fn with_tests(test_count: usize) -> Self {
        Self {
            test_count,
            file: String::new(),
            module_path: String::new(),
        }
    }
}

/// Enumerates runnable suites
pub trait SuiteDiscovery {
    /// Every suite by unique name
    fn enumerate(&self) -> BTreeMap<String, SuiteInfo>;
}

/// Executes one suite synchronously
pub trait SuiteExecutor {
    /// Run `suite` to completion
    fn run(&self, suite: &str) -> SuiteOutcome;
}

/// Reports how many cores the host offers
pub trait CoreCountProbe {
    /// Number of usable cores (at least 1)
    fn count(&self) -> usize;
}

/// Core count from the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCores;

impl CoreCountProbe for SystemCores {
    fn count(&self) -> usize {
        std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1)
    }
}

/// Default worker cap for a host with `cores` cores.
///
/// Hosts with more than four cores keep one back for the database server.
pub fn default_worker_count(cores: usize) -> usize {
    if cores > 4 { cores - 1 } else { cores.max(1) }
}
