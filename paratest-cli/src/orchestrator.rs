//! Orchestrator
//!
//! Runs one batch of suites across a pool of worker processes.
//!
//! ```text
//! preparing ─► running ─► draining ─► reporting ─► done
//! ```
//!
//! The loop is single-threaded. Its only suspension point is `poll(2)` over
//! the channels of all live workers; each readable worker is drained and its
//! messages dispatched in order. Workers are launched lazily: the next one is
//! spawned when the previous one reports `Started`.

use crate::collector::Collector;
use crate::timings::TimingStore;
use crate::worker::{WorkerHandle, WorkerState};
use indicatif::{ProgressBar, ProgressStyle};
use paratest_core::{ProvisionError, SchemaProvisioner, SuiteInfo};
use paratest_ipc::{ChannelError, PROTOCOL_VERSION, WorkerMessage};
use paratest_report::AggregateResult;
use paratest_stats::{SlowReport, Stats};
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Upper bound on one wait, so exited workers are noticed without traffic
const POLL_INTERVAL_MS: i32 = 500;

/// Errors that abort a run
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Worker {worker} protocol error: expected {expected}, got {got}")]
    Protocol {
        worker: u32,
        expected: String,
        got: String,
    },

    #[error("Worker {worker} (pid {pid}) crashed: {detail}")]
    WorkerCrashed { worker: u32, pid: u32, detail: String },

    #[error(transparent)]
    Provisioning(#[from] ProvisionError),

    #[error("Failed to launch worker {worker}: {source}")]
    Launch {
        worker: u32,
        #[source]
        source: ChannelError,
    },

    #[error("Channel to worker {worker} failed: {source}")]
    Channel {
        worker: u32,
        #[source]
        source: ChannelError,
    },

    #[error("Failed to wait for workers: {0}")]
    Poll(#[source] std::io::Error),
}

/// Run lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Preparing,
    Running,
    Draining,
    Reporting,
    Done,
}

/// Settings for one run
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Run name; timing history is keyed by it
    pub name: String,
    /// Configured worker maximum
    pub max_workers: usize,
    /// Harness binary re-executed for each worker
    pub program: PathBuf,
    /// Show a progress bar on an interactive terminal
    pub progress: bool,
}

/// Everything a finished run produced
#[derive(Debug)]
pub struct RunOutcome {
    pub results: AggregateResult,
    pub slow: SlowReport,
    /// Suites in the order they were handed out
    pub dispatch_order: Vec<String>,
    pub elapsed: Duration,
    /// Pool cap actually used
    pub workers: usize,
    /// Why the run loop stopped early, if it did
    pub error: Option<OrchestratorError>,
}

impl RunOutcome {
    /// No run-loop error and no recorded faults
    pub fn success(&self) -> bool {
        self.error.is_none() && self.results.success()
    }
}

/// Mutable state of one run
pub(crate) struct Run {
    collector: Collector,
    workers: BTreeMap<u32, WorkerHandle>,
    draining: Vec<WorkerHandle>,
    cap: usize,
    next_number: u32,
    results: AggregateResult,
    stats: Stats,
    dispatch_order: Vec<String>,
    progress: ProgressBar,
}

impl Run {
    fn update_progress(&self) {
        self.progress
            .set_position(self.collector.completed_count() as u64);
        match self.collector.completion_percent() {
            Some(pct) => self.progress.set_message(format!("{:.0}% of estimated time", pct)),
            None => self.progress.set_message("no timing history"),
        }
    }

    /// Stop every live worker and wait for the ones already finishing.
    fn teardown(&mut self) {
        for (number, mut worker) in std::mem::take(&mut self.workers) {
            tracing::debug!(worker = number, pid = worker.pid(), "killing worker");
            worker.shutdown();
            worker.close();
            worker.terminate();
        }
        for worker in &mut self.draining {
            worker.reap();
        }
        self.draining.clear();
    }
}

fn progress_bar(enabled: bool, suites: usize) -> ProgressBar {
    if !enabled || !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(suites as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

/// What a worker in `state` may legally send next
fn expected_in(state: WorkerState) -> &'static str {
    match state {
        WorkerState::Spawning => "started",
        WorkerState::Idle => "ready",
        WorkerState::Running => "result or ready",
        WorkerState::Finishing => "finished",
        WorkerState::Closed => "nothing",
    }
}

/// Live workers with something to read. An interrupted wait reports none.
fn wait_readable(workers: &BTreeMap<u32, WorkerHandle>) -> Result<Vec<u32>, OrchestratorError> {
    let mut numbers = Vec::with_capacity(workers.len());
    let mut fds = Vec::with_capacity(workers.len());
    for (number, worker) in workers {
        if let Some(fd) = worker.fd() {
            numbers.push(*number);
            fds.push(libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            });
        }
    }

    if fds.is_empty() {
        std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS as u64));
        return Ok(Vec::new());
    }

    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_INTERVAL_MS) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(Vec::new());
        }
        return Err(OrchestratorError::Poll(err));
    }

    Ok(numbers
        .into_iter()
        .zip(fds)
        .filter(|(_, pollfd)| pollfd.revents != 0)
        .map(|(number, _)| number)
        .collect())
}

/// Drives one run over a worker pool
pub struct Orchestrator<'a> {
    settings: RunSettings,
    timings: &'a mut TimingStore,
    provisioner: &'a dyn SchemaProvisioner,
    phase: RunPhase,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        settings: RunSettings,
        timings: &'a mut TimingStore,
        provisioner: &'a dyn SchemaProvisioner,
    ) -> Self {
        Self {
            settings,
            timings,
            provisioner,
            phase: RunPhase::Preparing,
        }
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn enter(&mut self, phase: RunPhase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "run phase");
        self.phase = phase;
    }

    /// Run every suite in `suites` to completion.
    ///
    /// Always returns an outcome; a run-loop failure is carried in
    /// [`RunOutcome::error`] alongside whatever results were gathered.
    pub fn run(&mut self, suites: &BTreeMap<String, SuiteInfo>) -> RunOutcome {
        let start = Instant::now();
        self.enter(RunPhase::Preparing);

        let mut run = match self.prepare(suites) {
            Ok(run) => run,
            Err(e) => {
                tracing::error!(error = %e, "run aborted before launching workers");
                self.enter(RunPhase::Done);
                return RunOutcome {
                    results: AggregateResult::default(),
                    slow: SlowReport::default(),
                    dispatch_order: Vec::new(),
                    elapsed: start.elapsed(),
                    workers: 0,
                    error: Some(e),
                };
            }
        };

        self.enter(RunPhase::Running);
        let error = self.drive(&mut run).err();
        if let Some(e) = &error {
            tracing::error!(error = %e, "run aborted");
        }

        self.enter(RunPhase::Draining);
        run.teardown();
        self.timings.flush();

        self.enter(RunPhase::Reporting);
        run.progress.finish_and_clear();
        let slow = run.stats.analyze();

        self.enter(RunPhase::Done);
        RunOutcome {
            results: run.results,
            slow,
            dispatch_order: run.dispatch_order,
            elapsed: start.elapsed(),
            workers: run.cap,
            error,
        }
    }

    pub(crate) fn prepare(
        &mut self,
        suites: &BTreeMap<String, SuiteInfo>,
    ) -> Result<Run, OrchestratorError> {
        if self.provisioner.load_main()? {
            tracing::info!("main database loaded");
        }

        let collector = Collector::build(self.timings, &self.settings.name, suites);
        let cap = self.settings.max_workers.max(1).min(collector.remaining());
        tracing::info!(
            run = %self.settings.name,
            suites = collector.suite_count(),
            workers = cap,
            "starting run"
        );

        let progress = progress_bar(self.settings.progress, collector.suite_count());
        Ok(Run {
            collector,
            workers: BTreeMap::new(),
            draining: Vec::new(),
            cap,
            next_number: 0,
            results: AggregateResult::default(),
            stats: Stats::new(),
            dispatch_order: Vec::new(),
            progress,
        })
    }

    pub(crate) fn drive(&mut self, run: &mut Run) -> Result<(), OrchestratorError> {
        if run.cap == 0 {
            return Ok(());
        }
        self.launch_next(run)?;

        while !run.workers.is_empty() {
            for number in wait_readable(&run.workers)? {
                self.service(run, number)?;
            }
            self.reap_exited(run)?;
        }

        for worker in &mut run.draining {
            worker.reap();
        }
        run.draining.clear();
        Ok(())
    }

    pub(crate) fn launch_next(&mut self, run: &mut Run) -> Result<(), OrchestratorError> {
        run.next_number += 1;
        let number = run.next_number;
        let worker = WorkerHandle::launch(number, &self.settings.program)
            .map_err(|source| OrchestratorError::Launch { worker: number, source })?;
        run.workers.insert(number, worker);
        Ok(())
    }

    /// Grow the pool by one while the cap and the undispatched work allow it
    fn maybe_grow(&mut self, run: &mut Run) -> Result<(), OrchestratorError> {
        let live = run.workers.len();
        if live < run.cap && live < run.collector.remaining() {
            self.launch_next(run)?;
        }
        Ok(())
    }

    /// Drain one worker's channel and act on every message.
    fn service(&mut self, run: &mut Run, number: u32) -> Result<(), OrchestratorError> {
        let Some(worker) = run.workers.get_mut(&number) else {
            return Ok(());
        };
        let messages = worker
            .poll()
            .map_err(|source| OrchestratorError::Channel { worker: number, source })?;

        for message in messages {
            if self.dispatch(run, number, message)? {
                return Ok(());
            }
        }

        if run.workers.get(&number).is_some_and(|w| w.at_eof()) {
            return Err(crashed(run, number, "closed its channel without finishing"));
        }
        Ok(())
    }

    /// Act on one message. Returns true once the worker has left the pool.
    pub(crate) fn dispatch(
        &mut self,
        run: &mut Run,
        number: u32,
        message: WorkerMessage,
    ) -> Result<bool, OrchestratorError> {
        let Some(worker) = run.workers.get_mut(&number) else {
            return Ok(true);
        };
        let protocol = |expected: &str, got: &str| OrchestratorError::Protocol {
            worker: number,
            expected: expected.to_string(),
            got: got.to_string(),
        };

        match message {
            WorkerMessage::Started {
                protocol_version,
                worker: announced,
            } => {
                if worker.state() != WorkerState::Spawning {
                    return Err(protocol(expected_in(worker.state()), "started"));
                }
                if protocol_version != PROTOCOL_VERSION {
                    return Err(protocol(
                        &format!("protocol version {}", PROTOCOL_VERSION),
                        &format!("protocol version {}", protocol_version),
                    ));
                }
                if announced != number {
                    return Err(protocol(
                        &format!("worker {}", number),
                        &format!("worker {}", announced),
                    ));
                }
                worker.set_state(WorkerState::Idle);
                tracing::debug!(worker = number, pid = worker.pid(), "worker started");
                self.maybe_grow(run)?;
            }

            WorkerMessage::Ready => {
                match worker.state() {
                    WorkerState::Idle => {}
                    WorkerState::Running => {
                        let Some((assignment, elapsed)) = worker.take_assignment() else {
                            return Err(protocol("result", "ready"));
                        };
                        if !assignment.result_received {
                            return Err(protocol(
                                &format!("result for {}", assignment.suite),
                                "ready",
                            ));
                        }
                        self.timings
                            .record(&self.settings.name, &assignment.suite, elapsed);
                        run.stats.add(number, &assignment.suite, elapsed);
                    }
                    other => return Err(protocol(expected_in(other), "ready")),
                }

                let sent = match run.collector.next() {
                    Some(suite) => {
                        tracing::debug!(worker = number, suite = %suite, "assigning suite");
                        let sent = worker.assign(&suite);
                        run.dispatch_order.push(suite);
                        sent
                    }
                    None => {
                        run.stats.finish(number);
                        worker.finish()
                    }
                };
                sent.map_err(|source| OrchestratorError::Channel { worker: number, source })?;
            }

            WorkerMessage::Result(outcome) => {
                let expected = match worker.assignment() {
                    Some(a) if !a.result_received => format!("result for {}", a.suite),
                    _ => expected_in(worker.state()).to_string(),
                };
                let got = format!("result for {}", outcome.suite);
                if expected != got {
                    return Err(protocol(&expected, &got));
                }
                if let Some(assignment) = worker.assignment_mut() {
                    assignment.result_received = true;
                }

                if !outcome.passed() {
                    tracing::debug!(
                        worker = number,
                        suite = %outcome.suite,
                        faults = outcome.faults().count(),
                        "suite reported faults"
                    );
                }
                run.collector.mark_complete(&outcome.suite);
                run.results.merge(outcome);
                run.update_progress();
            }

            WorkerMessage::Finished => {
                if worker.state() != WorkerState::Finishing {
                    return Err(protocol(expected_in(worker.state()), "finished"));
                }
                worker.close();
                tracing::debug!(worker = number, "worker finished");
                if let Some(worker) = run.workers.remove(&number) {
                    run.draining.push(worker);
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Collect exited processes without blocking.
    fn reap_exited(&mut self, run: &mut Run) -> Result<(), OrchestratorError> {
        let exited: Vec<u32> = run
            .workers
            .iter_mut()
            .filter_map(|(number, worker)| worker.try_reap().map(|_| *number))
            .collect();

        for number in exited {
            // Whatever it wrote before exiting is still buffered in the socket
            self.service(run, number)?;
            if run.workers.contains_key(&number) {
                return Err(crashed(run, number, "exited without finishing"));
            }
        }

        run.draining.retain_mut(|worker| worker.try_reap().is_none());
        Ok(())
    }
}

fn crashed(run: &mut Run, number: u32, what: &str) -> OrchestratorError {
    let Some(worker) = run.workers.get_mut(&number) else {
        return OrchestratorError::WorkerCrashed {
            worker: number,
            pid: 0,
            detail: what.to_string(),
        };
    };

    let mut detail = what.to_string();
    if let Some(assignment) = worker.assignment() {
        detail.push_str(&format!(" while running {}", assignment.suite));
    }
    if let Some(status) = worker.try_reap() {
        detail.push_str(&format!(" ({})", status));
    }

    OrchestratorError::WorkerCrashed {
        worker: number,
        pid: worker.pid(),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paratest_core::NoProvisioning;
    use paratest_ipc::SuiteOutcome;

    fn settings(program: &str, max_workers: usize) -> RunSettings {
        RunSettings {
            name: "unit".to_string(),
            max_workers,
            program: PathBuf::from(program),
            progress: false,
        }
    }

    fn suites(entries: &[(&str, usize)]) -> BTreeMap<String, SuiteInfo> {
        entries
            .iter()
            .map(|(name, tests)| (name.to_string(), SuiteInfo::with_tests(*tests)))
            .collect()
    }

    struct NoDatabase;

    impl SchemaProvisioner for NoDatabase {
        fn load_main(&self) -> Result<bool, ProvisionError> {
            Err(ProvisionError::Failed("database server unreachable".into()))
        }

        fn load_for_worker(&self, _worker: u32) -> Result<(), ProvisionError> {
            Ok(())
        }
    }

    #[test]
    fn test_provisioning_failure_launches_nothing() {
        let mut timings = TimingStore::in_memory();
        let mut orchestrator =
            Orchestrator::new(settings("/nonexistent/harness", 2), &mut timings, &NoDatabase);

        let outcome = orchestrator.run(&suites(&[("A", 1)]));
        assert!(matches!(outcome.error, Some(OrchestratorError::Provisioning(_))));
        assert!(outcome.dispatch_order.is_empty());
        assert!(!outcome.success());
        assert_eq!(orchestrator.phase(), RunPhase::Done);
    }

    #[test]
    fn test_empty_universe_succeeds_without_workers() {
        let mut timings = TimingStore::in_memory();
        let mut orchestrator = Orchestrator::new(
            settings("/nonexistent/harness", 4),
            &mut timings,
            &NoProvisioning,
        );

        let outcome = orchestrator.run(&BTreeMap::new());
        assert!(outcome.error.is_none());
        assert_eq!(outcome.workers, 0);
        assert!(outcome.success());
    }

    #[test]
    fn test_cap_limited_by_suite_count() {
        let mut timings = TimingStore::in_memory();
        let mut orchestrator = Orchestrator::new(settings("true", 8), &mut timings, &NoProvisioning);
        let run = orchestrator.prepare(&suites(&[("A", 1), ("B", 1)])).unwrap();
        assert_eq!(run.cap, 2);
    }

    #[test]
    fn test_launch_failure_aborts() {
        let mut timings = TimingStore::in_memory();
        let mut orchestrator = Orchestrator::new(
            settings("/nonexistent/harness", 2),
            &mut timings,
            &NoProvisioning,
        );

        let outcome = orchestrator.run(&suites(&[("A", 1)]));
        assert!(matches!(
            outcome.error,
            Some(OrchestratorError::Launch { worker: 1, .. })
        ));
    }

    #[test]
    fn test_worker_exiting_silently_is_a_crash() {
        // `true` exits at once without ever sending `started`
        let mut timings = TimingStore::in_memory();
        let mut orchestrator = Orchestrator::new(settings("true", 2), &mut timings, &NoProvisioning);

        let outcome = orchestrator.run(&suites(&[("A", 1), ("B", 1)]));
        match outcome.error {
            Some(OrchestratorError::WorkerCrashed { worker, pid, .. }) => {
                assert_eq!(worker, 1);
                assert!(pid > 0);
            }
            other => panic!("expected crash, got {:?}", other),
        }
        assert!(!outcome.success());
    }

    #[test]
    fn test_protocol_version_mismatch() {
        let mut timings = TimingStore::in_memory();
        let mut orchestrator = Orchestrator::new(settings("true", 1), &mut timings, &NoProvisioning);
        let mut run = orchestrator.prepare(&suites(&[("A", 1)])).unwrap();
        orchestrator.launch_next(&mut run).unwrap();

        let err = orchestrator
            .dispatch(
                &mut run,
                1,
                WorkerMessage::Started {
                    protocol_version: PROTOCOL_VERSION + 1,
                    worker: 1,
                },
            )
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Protocol { worker: 1, .. }));
        run.teardown();
    }

    #[test]
    fn test_result_without_assignment_is_rejected() {
        let mut timings = TimingStore::in_memory();
        let mut orchestrator = Orchestrator::new(settings("true", 1), &mut timings, &NoProvisioning);
        let mut run = orchestrator.prepare(&suites(&[("A", 1)])).unwrap();
        orchestrator.launch_next(&mut run).unwrap();

        let started = WorkerMessage::Started {
            protocol_version: PROTOCOL_VERSION,
            worker: 1,
        };
        assert!(!orchestrator.dispatch(&mut run, 1, started).unwrap());
        // Cap is 1: no second worker
        assert_eq!(run.workers.len(), 1);

        let err = orchestrator
            .dispatch(&mut run, 1, WorkerMessage::Result(SuiteOutcome::empty("A")))
            .unwrap_err();
        match err {
            OrchestratorError::Protocol { expected, got, .. } => {
                assert_eq!(expected, "ready");
                assert_eq!(got, "result for A");
            }
            other => panic!("unexpected error {:?}", other),
        }
        run.teardown();
    }

    #[test]
    fn test_finished_before_finish_is_rejected() {
        let mut timings = TimingStore::in_memory();
        let mut orchestrator = Orchestrator::new(settings("true", 1), &mut timings, &NoProvisioning);
        let mut run = orchestrator.prepare(&suites(&[("A", 1)])).unwrap();
        orchestrator.launch_next(&mut run).unwrap();

        let err = orchestrator
            .dispatch(&mut run, 1, WorkerMessage::Finished)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Protocol { .. }));
        assert_eq!(run.workers.len(), 1);
        run.teardown();
    }
}
