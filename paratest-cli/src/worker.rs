//! Worker Handle
//!
//! Owns one worker process and the orchestrator's end of its channel.
//!
//! The child is the harness binary re-executed with `--paratest-worker <N>`.
//! Its channel endpoint is moved to descriptor 3 before exec; every other
//! channel descriptor is close-on-exec, so the orchestrator sees end-of-stream
//! as soon as the child exits.

use paratest_ipc::{
    CHILD_IPC_FD, Channel, ChannelError, IPC_FD_ENV, OrchestratorCommand, Recv, WorkerMessage,
};
use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// Hidden flag that puts the harness binary into worker mode
pub const WORKER_FLAG: &str = "--paratest-worker";

/// Grace period between SIGTERM and SIGKILL
const TERMINATE_GRACE: Duration = Duration::from_millis(50);

/// Worker lifecycle state, as seen by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Launched, `Started` not yet received
    Spawning,
    /// Waiting for work
    Idle,
    /// Executing an assigned suite
    Running,
    /// Told to finish, `Finished` not yet received
    Finishing,
    /// Channel released
    Closed,
}

/// Suite currently assigned to a worker
#[derive(Debug, Clone)]
pub struct Assignment {
    /// Suite name
    pub suite: String,
    /// When the suite was sent
    pub started: Instant,
    /// Whether the worker has returned its result
    pub result_received: bool,
}

/// Send SIGTERM to a process. Returns `Err` if the signal could not be delivered.
fn send_sigterm(pid: u32) -> Result<(), std::io::Error> {
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// One worker process plus its channel
pub struct WorkerHandle {
    number: u32,
    child: Child,
    channel: Channel,
    state: WorkerState,
    assignment: Option<Assignment>,
    exit: Option<ExitStatus>,
}

impl WorkerHandle {
    /// Spawn worker `number` by re-executing `program`.
    pub fn launch(number: u32, program: &Path) -> Result<Self, ChannelError> {
        let (mut parent, child_end) = Channel::pair()?;
        let (Some(parent_fd), Some(child_fd)) = (parent.raw_fd(), child_end.raw_fd()) else {
            return Err(ChannelError::Closed);
        };

        let mut command = Command::new(program);
        command
            .arg(WORKER_FLAG)
            .arg(number.to_string())
            .env(IPC_FD_ENV, CHILD_IPC_FD.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        // In the child: move the endpoint to the fixed descriptor, keep it
        // across exec, and drop the orchestrator's end.
        unsafe {
            command.pre_exec(move || {
                if child_fd != CHILD_IPC_FD && libc::dup2(child_fd, CHILD_IPC_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                let flags = libc::fcntl(CHILD_IPC_FD, libc::F_GETFD);
                libc::fcntl(CHILD_IPC_FD, libc::F_SETFD, flags & !libc::FD_CLOEXEC);

                if parent_fd != CHILD_IPC_FD {
                    libc::close(parent_fd);
                }
                Ok(())
            });
        }

        let child = command.spawn()?;

        // Only the child may hold this end, or end-of-stream never arrives
        drop(child_end);
        parent.set_nonblocking(true)?;

        tracing::debug!(worker = number, pid = child.id(), "worker launched");

        Ok(Self {
            number,
            child,
            channel: parent,
            state: WorkerState::Spawning,
            assignment: None,
            exit: None,
        })
    }

    /// Worker number
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Process id
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Move to `state`
    pub fn set_state(&mut self, state: WorkerState) {
        self.state = state;
    }

    /// Descriptor to wait on, while the channel is open
    pub fn fd(&self) -> Option<RawFd> {
        self.channel.raw_fd()
    }

    /// Suite currently assigned, if any
    pub fn assignment(&self) -> Option<&Assignment> {
        self.assignment.as_ref()
    }

    /// Mutable access to the current assignment
    pub fn assignment_mut(&mut self) -> Option<&mut Assignment> {
        self.assignment.as_mut()
    }

    /// Clear the current assignment, returning the suite and how long it ran
    pub fn take_assignment(&mut self) -> Option<(Assignment, Duration)> {
        self.assignment.take().map(|a| {
            let elapsed = a.started.elapsed();
            (a, elapsed)
        })
    }

    /// Send `suite` to the worker and start its clock.
    pub fn assign(&mut self, suite: &str) -> Result<(), ChannelError> {
        self.channel.send(&OrchestratorCommand::Run {
            suite: suite.to_string(),
        })?;
        self.assignment = Some(Assignment {
            suite: suite.to_string(),
            started: Instant::now(),
            result_received: false,
        });
        self.state = WorkerState::Running;
        Ok(())
    }

    /// Tell the worker there is no more work.
    pub fn finish(&mut self) -> Result<(), ChannelError> {
        self.channel.send(&OrchestratorCommand::Finish)?;
        self.state = WorkerState::Finishing;
        Ok(())
    }

    /// Ask the worker to exit without announcing it. Best effort.
    pub fn shutdown(&mut self) {
        if self.channel.is_closed() {
            return;
        }
        if let Err(e) = self.channel.send(&OrchestratorCommand::Shutdown) {
            tracing::debug!(worker = self.number, error = %e, "shutdown not delivered");
        }
    }

    /// Every message already available, without waiting.
    pub fn poll(&mut self) -> Result<Vec<WorkerMessage>, ChannelError> {
        let mut messages = Vec::new();
        if self.channel.is_closed() {
            return Ok(messages);
        }
        loop {
            match self.channel.recv::<WorkerMessage>()? {
                Recv::Message(message) => messages.push(message),
                Recv::WouldBlock | Recv::Closed => break,
            }
        }
        Ok(messages)
    }

    /// Whether the worker closed its end of the channel
    pub fn at_eof(&self) -> bool {
        self.channel.at_eof()
    }

    /// Release the channel. Safe to call more than once.
    pub fn close(&mut self) {
        self.channel.close();
        self.state = WorkerState::Closed;
    }

    /// Exit status, if the process has exited. Never blocks.
    pub fn try_reap(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.exit = status,
                Err(e) => tracing::debug!(worker = self.number, error = %e, "try_wait failed"),
            }
        }
        self.exit
    }

    /// Wait for the process to exit.
    pub fn reap(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            match self.child.wait() {
                Ok(status) => self.exit = Some(status),
                Err(e) => tracing::debug!(worker = self.number, error = %e, "wait failed"),
            }
        }
        self.exit
    }

    /// Best-effort hard stop: SIGTERM, short grace, then SIGKILL. Safe if
    /// already dead.
    pub fn terminate(&mut self) {
        if self.try_reap().is_some() {
            return;
        }
        let _ = send_sigterm(self.child.id());
        std::thread::sleep(TERMINATE_GRACE);
        if self.try_reap().is_none() {
            let _ = self.child.kill();
        }
        self.reap();
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.channel.close();
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exited_child_reads_as_eof() {
        // `true` ignores its arguments and exits at once
        let mut worker = WorkerHandle::launch(1, Path::new("true")).unwrap();
        assert_eq!(worker.number(), 1);
        assert_eq!(worker.state(), WorkerState::Spawning);
        assert!(worker.fd().is_some());

        let status = worker.reap().unwrap();
        assert!(status.success());
        assert_eq!(worker.try_reap(), Some(status));

        assert!(worker.poll().unwrap().is_empty());
        assert!(worker.at_eof());

        worker.close();
        assert_eq!(worker.state(), WorkerState::Closed);
        assert!(worker.fd().is_none());
        // Already reaped: nothing to signal
        worker.terminate();
    }

    #[test]
    fn test_launch_missing_program_fails() {
        assert!(WorkerHandle::launch(1, Path::new("/nonexistent/paratest-harness")).is_err());
    }

    #[test]
    fn test_take_assignment_clears_it() {
        let mut worker = WorkerHandle::launch(2, Path::new("true")).unwrap();
        worker.assignment = Some(Assignment {
            suite: "Billing".into(),
            started: Instant::now(),
            result_received: true,
        });

        let (assignment, _elapsed) = worker.take_assignment().unwrap();
        assert_eq!(assignment.suite, "Billing");
        assert!(worker.assignment().is_none());
        worker.reap();
    }
}
