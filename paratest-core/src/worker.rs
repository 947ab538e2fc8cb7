//! Worker Process Entry Point
//!
//! Handles the worker side of the orchestrator-worker architecture.
//!
//! The orchestrator passes one end of a socket pair on fd 3 (named by the
//! `PARATEST_IPC_FD` env var). The worker announces itself, then executes one
//! suite per `Run` command until told to finish. A SIGTERM handler requests
//! the same early exit as a `Shutdown` command, after the current suite.

use crate::{SchemaProvisioner, SuiteExecutor};
use crate::collaborators::ProvisionError;
use paratest_ipc::{
    Channel, ChannelError, IPC_FD_ENV, OrchestratorCommand, PROTOCOL_VERSION, WorkerMessage,
};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Global flag set by SIGTERM handler to request graceful shutdown.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Check if a graceful shutdown has been requested via SIGTERM.
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Relaxed)
}

/// Install a SIGTERM handler that sets the `SHUTDOWN_REQUESTED` flag.
/// The handler is async-signal-safe (only sets an atomic).
fn install_sigterm_handler() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = sigterm_handler as *const () as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
    }
}

extern "C" fn sigterm_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

/// Errors that end a worker abnormally
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("IPC error: {0}")]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("Invalid PARATEST_IPC_FD: {0}")]
    Transport(String),

    #[error("Orchestrator closed the channel")]
    Disconnected,
}

/// How the worker loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Told to finish; `Finished` was sent
    Finished,
    /// Shut down without announcing it
    Shutdown,
}

/// Worker main loop
pub struct WorkerMain {
    channel: Channel,
    number: u32,
}

impl WorkerMain {
    /// Adopt the channel inherited from the orchestrator.
    pub fn from_env(number: u32) -> Result<Self, WorkerError> {
        let value = std::env::var(IPC_FD_ENV).map_err(|_| WorkerError::Transport("unset".into()))?;
        let fd: i32 = value
            .trim()
            .parse()
            .map_err(|_| WorkerError::Transport(format!("{value:?} is not a descriptor")))?;

        install_sigterm_handler();

        // The descriptor was placed by the orchestrator for this process alone
        let channel = unsafe { Channel::from_raw_fd(fd) };
        Ok(Self::with_channel(channel, number))
    }

    /// Run over an existing channel (used in tests and by embedders).
    pub fn with_channel(channel: Channel, number: u32) -> Self {
        Self { channel, number }
    }

    /// Worker number assigned by the orchestrator
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Prepare, announce, then serve suites until told to stop.
    pub fn run(
        &mut self,
        executor: &dyn SuiteExecutor,
        provisioner: &dyn SchemaProvisioner,
    ) -> Result<WorkerExit, WorkerError> {
        provisioner.load_for_worker(self.number)?;

        self.channel.send(&WorkerMessage::Started {
            protocol_version: PROTOCOL_VERSION,
            worker: self.number,
        })?;
        self.channel.send(&WorkerMessage::Ready)?;

        loop {
            if shutdown_requested() {
                return Ok(WorkerExit::Shutdown);
            }

            let command = self
                .channel
                .next_message::<OrchestratorCommand>()?
                .ok_or(WorkerError::Disconnected)?;

            match command {
                OrchestratorCommand::Run { suite } => {
                    tracing::debug!(worker = self.number, suite = %suite, "running suite");
                    let outcome = executor.run(&suite);
                    self.channel.send(&WorkerMessage::Result(outcome))?;
                    if shutdown_requested() {
                        return Ok(WorkerExit::Shutdown);
                    }
                    self.channel.send(&WorkerMessage::Ready)?;
                }
                OrchestratorCommand::Finish => {
                    self.channel.send(&WorkerMessage::Finished)?;
                    return Ok(WorkerExit::Finished);
                }
                OrchestratorCommand::Shutdown => {
                    return Ok(WorkerExit::Shutdown);
                }
            }
        }
    }
}
