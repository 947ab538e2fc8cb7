#![warn(missing_docs)]
//! paratest CLI Library
//!
//! This module provides the orchestrator and the command-line entry point for
//! test harness binaries. Register suites with `paratest::suite!` and call
//! `paratest::run()` from `main`; the same binary re-executes itself as each
//! worker process.
//!
//! # Example
//!
//! ```ignore
//! use paratest::prelude::*;
//!
//! fn adds(ctx: &mut TestContext) {
//!     ctx.assert_eq(2 + 2, 4);
//! }
//!
//! paratest::suite!("Arithmetic" => [adds]);
//!
//! fn main() -> anyhow::Result<std::process::ExitCode> {
//!     paratest::run()
//! }
//! ```

mod collector;
mod config;
mod host;
mod orchestrator;
mod planner;
mod timings;
mod worker;

pub use collector::Collector;
pub use config::*;
pub use host::{HOST_FLAG, Host};
pub use orchestrator::{Orchestrator, OrchestratorError, RunOutcome, RunPhase, RunSettings};
pub use planner::{SuitePlan, build_plan};
pub use timings::{FileBackend, KEEP, MemoryBackend, TimingBackend, TimingError, TimingStore};
pub use worker::{Assignment, WORKER_FLAG, WorkerHandle, WorkerState};

use clap::{Parser, Subcommand};
use paratest_core::{
    CoreCountProbe, NoProvisioning, Registry, SchemaProvisioner, SuiteDiscovery, SystemCores,
    WorkerMain, default_worker_count,
};
use paratest_ipc::{RunOption, RunRequest};
use paratest_report::{OutputFormat, Report, format_human_output, generate_json_report};
use regex::Regex;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

/// paratest CLI arguments
#[derive(Parser, Debug)]
#[command(name = "paratest")]
#[command(author, version, about = "paratest - parallel test-suite runner")]
pub struct Cli {
    /// Optional subcommand (List, Run, Init); defaults to Run
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Filter suites by regex pattern on their name
    #[arg(default_value = ".*")]
    pub filter: String,

    /// Run name; timing history is kept per name
    #[arg(long)]
    pub name: Option<String>,

    /// Maximum number of worker processes
    #[arg(long, short = 'j')]
    pub workers: Option<usize>,

    /// Only run suites whose module path is (or is inside) this module
    #[arg(long, value_name = "MODULE")]
    pub require: Vec<String>,

    /// Only run suites registered from this source file
    #[arg(long = "file", value_name = "PATH")]
    pub files: Vec<String>,

    /// Output format: human, json
    #[arg(long)]
    pub format: Option<String>,

    /// Output file (stdout if not specified)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Timing history file
    #[arg(long)]
    pub timings: Option<PathBuf>,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Internal: Run as worker process N (used by the orchestrator)
    #[arg(long = "paratest-worker", hide = true, value_name = "N")]
    pub paratest_worker: Option<u32>,

    /// Internal: Serve run requests over an inherited channel
    #[arg(long = "paratest-host", hide = true)]
    pub paratest_host: bool,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the suites a run would execute
    List,
    /// Run suites (default)
    Run,
    /// Write a default paratest.toml to the current directory
    Init,
}

/// Harness entry point with pluggable collaborators
pub struct Harness {
    provisioner: Box<dyn SchemaProvisioner>,
    cores: Box<dyn CoreCountProbe>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    /// Harness with no database provisioning and the system core count
    pub fn new() -> Self {
        Self {
            provisioner: Box::new(NoProvisioning),
            cores: Box::new(SystemCores),
        }
    }

    /// Use `provisioner` to prepare databases for the run and each worker
    pub fn provisioner(mut self, provisioner: impl SchemaProvisioner + 'static) -> Self {
        self.provisioner = Box::new(provisioner);
        self
    }

    /// Use `cores` to size the default worker pool
    pub fn cores(mut self, cores: impl CoreCountProbe + 'static) -> Self {
        self.cores = Box::new(cores);
        self
    }

    /// Parse the command line and run.
    pub fn run(self) -> anyhow::Result<ExitCode> {
        self.run_with_cli(Cli::parse())
    }

    /// Run with pre-parsed arguments.
    pub fn run_with_cli(self, cli: Cli) -> anyhow::Result<ExitCode> {
        init_logging(cli.verbose);

        // Worker mode first: nothing else about the command line applies
        if let Some(number) = cli.paratest_worker {
            return self.run_worker_mode(number);
        }

        // Discover paratest.toml, then layer env and CLI flags over it
        let mut config = ParatestConfig::discover().unwrap_or_default();
        config.apply_env();

        if cli.paratest_host {
            return self.run_host_mode(&cli, &config);
        }

        match cli.command {
            Some(Commands::List) => {
                list_suites(&cli, &config)?;
                Ok(ExitCode::SUCCESS)
            }
            Some(Commands::Init) => {
                init_config()?;
                Ok(ExitCode::SUCCESS)
            }
            Some(Commands::Run) | None => {
                let context = RunContext::resolve(&cli, &config, self.cores.as_ref())?;
                let request = build_request(&cli, &config);
                let filter = compile_filter(&cli.filter)?;
                let success = context.execute(&request, filter.as_ref(), self.provisioner.as_ref())?;
                Ok(if success {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                })
            }
        }
    }

    /// Run as a worker process (IPC mode)
    fn run_worker_mode(self, number: u32) -> anyhow::Result<ExitCode> {
        let mut worker = WorkerMain::from_env(number)?;
        worker
            .run(&Registry, self.provisioner.as_ref())
            .map_err(|e| anyhow::anyhow!("Worker {} error: {}", number, e))?;
        Ok(ExitCode::SUCCESS)
    }

    /// Serve run requests until the caller shuts us down
    fn run_host_mode(self, cli: &Cli, config: &ParatestConfig) -> anyhow::Result<ExitCode> {
        let context = RunContext::resolve(cli, config, self.cores.as_ref())?;
        let filter = compile_filter(&cli.filter)?;
        let provisioner = self.provisioner.as_ref();

        let runs = Host::from_env()?.serve(|request| {
            match context.execute(request, filter.as_ref(), provisioner) {
                Ok(success) => success,
                Err(e) => {
                    tracing::error!(run = %request.name, error = %e, "run failed");
                    false
                }
            }
        })?;

        tracing::debug!(runs, "host exiting");
        Ok(ExitCode::SUCCESS)
    }
}

/// Run the paratest CLI with the default harness.
/// This is the main entry point for harness binaries.
pub fn run() -> anyhow::Result<ExitCode> {
    Harness::new().run()
}

fn init_logging(verbose: bool) {
    let filter = if verbose { "paratest=debug" } else { "paratest=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    // A second init (embedders, tests) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn compile_filter(pattern: &str) -> anyhow::Result<Option<Regex>> {
    if pattern == ".*" {
        return Ok(None);
    }
    let re = Regex::new(pattern)
        .map_err(|e| anyhow::anyhow!("Invalid filter {:?}: {}", pattern, e))?;
    Ok(Some(re))
}

/// Turn `--name`, `--require` and `--file` into a run request
fn build_request(cli: &Cli, config: &ParatestConfig) -> RunRequest {
    RunRequest {
        name: cli
            .name
            .clone()
            .unwrap_or_else(|| config.runner.name.clone()),
        options: cli.require.iter().map(RunOption::require).collect(),
        files: cli.files.clone(),
    }
}

/// Settings resolved from CLI > env > paratest.toml > defaults
struct RunContext {
    max_workers: usize,
    program: PathBuf,
    progress: bool,
    format: OutputFormat,
    output: Option<PathBuf>,
    timings_path: PathBuf,
    timings_prefix: String,
}

impl RunContext {
    fn resolve(
        cli: &Cli,
        config: &ParatestConfig,
        cores: &dyn CoreCountProbe,
    ) -> anyhow::Result<Self> {
        let max_workers = cli
            .workers
            .or(config.runner.workers)
            .unwrap_or_else(|| default_worker_count(cores.count()))
            .max(1);

        let format_name = cli.format.as_deref().unwrap_or(&config.output.format);
        let format: OutputFormat = format_name.parse().map_err(|e: String| anyhow::anyhow!(e))?;

        Ok(Self {
            max_workers,
            program: std::env::current_exe()?,
            progress: config.runner.progress && !cli.no_progress,
            format,
            output: cli.output.clone(),
            timings_path: cli
                .timings
                .clone()
                .unwrap_or_else(|| config.timings.path.clone()),
            timings_prefix: config.timings.prefix.clone(),
        })
    }

    /// Plan, run and report one request. Returns whether the run succeeded.
    fn execute(
        &self,
        request: &RunRequest,
        filter: Option<&Regex>,
        provisioner: &dyn SchemaProvisioner,
    ) -> anyhow::Result<bool> {
        let plan = build_plan(Registry.enumerate(), request, filter);
        if plan.is_empty() {
            eprintln!("No suites found.");
        } else {
            eprintln!(
                "Running {} suites ({} tests) on up to {} worker(s)...",
                plan.len(),
                plan.test_count(),
                self.max_workers.min(plan.len())
            );
        }

        let backend = FileBackend::new(&self.timings_path);
        tracing::debug!(path = %backend.path().display(), "timing history");
        let mut timings = TimingStore::new(Box::new(backend), self.timings_prefix.clone());

        let settings = RunSettings {
            name: request.name.clone(),
            max_workers: self.max_workers,
            program: self.program.clone(),
            progress: self.progress,
        };
        let mut orchestrator = Orchestrator::new(settings, &mut timings, provisioner);
        let outcome = orchestrator.run(&plan.suites);
        let success = outcome.success();

        let report = Report::build(
            &request.name,
            outcome.workers,
            outcome.elapsed.as_secs_f64(),
            outcome.dispatch_order,
            outcome.results,
            outcome.slow,
            outcome.error.is_none(),
        );

        let output = match self.format {
            OutputFormat::Json => generate_json_report(&report)?,
            OutputFormat::Human => format_human_output(&report),
        };

        if let Some(ref path) = self.output {
            let mut file = std::fs::File::create(path)?;
            file.write_all(output.as_bytes())?;
            eprintln!("Report written to: {}", path.display());
        } else {
            print!("{}", output);
            std::io::stdout().flush()?;
        }

        if let Some(error) = outcome.error {
            eprintln!("\nRun aborted: {}", error);
        }

        Ok(success)
    }
}

fn list_suites(cli: &Cli, config: &ParatestConfig) -> anyhow::Result<()> {
    let request = build_request(cli, config);
    let filter = compile_filter(&cli.filter)?;
    let plan = build_plan(Registry.enumerate(), &request, filter.as_ref());

    println!("paratest Plan:");
    for (name, info) in &plan.suites {
        if info.file.is_empty() {
            println!("├── {} ({} tests)", name, info.test_count);
        } else {
            println!("├── {} ({} tests, {})", name, info.test_count, info.file);
        }
    }
    println!("{} suites, {} tests found.", plan.len(), plan.test_count());
    Ok(())
}

fn init_config() -> anyhow::Result<()> {
    let path = PathBuf::from(CONFIG_FILE);
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    std::fs::write(&path, ParatestConfig::default_toml())?;
    println!("Wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Cores(usize);

    impl CoreCountProbe for Cores {
        fn count(&self) -> usize {
            self.0
        }
    }

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("paratest").chain(args.iter().copied()))
    }

    #[test]
    fn test_cli_defaults() {
        let cli = parse(&[]);
        assert!(cli.command.is_none());
        assert_eq!(cli.filter, ".*");
        assert!(cli.paratest_worker.is_none());
        assert!(!cli.paratest_host);
    }

    #[test]
    fn test_cli_worker_flag() {
        let cli = parse(&["--paratest-worker", "3"]);
        assert_eq!(cli.paratest_worker, Some(3));
    }

    #[test]
    fn test_request_from_flags() {
        let cli = parse(&[
            "--name",
            "nightly",
            "--require",
            "app::billing",
            "--file",
            "tests/users.rs",
        ]);
        let request = build_request(&cli, &ParatestConfig::default());
        assert_eq!(request.name, "nightly");
        assert_eq!(request.requires().collect::<Vec<_>>(), vec!["app::billing"]);
        assert_eq!(request.files, vec!["tests/users.rs".to_string()]);
    }

    #[test]
    fn test_request_name_from_config() {
        let mut config = ParatestConfig::default();
        config.runner.name = "from-file".to_string();
        let request = build_request(&parse(&[]), &config);
        assert_eq!(request.name, "from-file");
    }

    #[test]
    fn test_worker_precedence() {
        let mut config = ParatestConfig::default();

        let context = RunContext::resolve(&parse(&[]), &config, &Cores(8)).unwrap();
        assert_eq!(context.max_workers, 7);

        config.runner.workers = Some(3);
        let context = RunContext::resolve(&parse(&[]), &config, &Cores(8)).unwrap();
        assert_eq!(context.max_workers, 3);

        let context = RunContext::resolve(&parse(&["--workers", "5"]), &config, &Cores(8)).unwrap();
        assert_eq!(context.max_workers, 5);
    }

    #[test]
    fn test_format_and_progress_resolution() {
        let config = ParatestConfig::default();
        let cli = parse(&["--format", "json", "--no-progress", "--timings", "t.json"]);
        let context = RunContext::resolve(&cli, &config, &Cores(2)).unwrap();
        assert_eq!(context.format, OutputFormat::Json);
        assert!(!context.progress);
        assert_eq!(context.timings_path, PathBuf::from("t.json"));

        let bad = parse(&["--format", "xml"]);
        assert!(RunContext::resolve(&bad, &config, &Cores(2)).is_err());
    }

    #[test]
    fn test_invalid_filter_is_an_error() {
        assert!(compile_filter("(").is_err());
        assert!(compile_filter(".*").unwrap().is_none());
        assert!(compile_filter("^A$").unwrap().is_some());
    }
}
