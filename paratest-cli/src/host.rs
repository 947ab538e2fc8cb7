//! Resident Host
//!
//! A long-lived harness process driven over a channel: the caller sends run
//! requests, the host runs each one and answers success or failure. Loading
//! happens once, so repeated runs skip process start-up.

use paratest_ipc::{Channel, ChannelError, HostCommand, HostReply, IPC_FD_ENV, RunRequest};

/// Hidden flag that puts the harness binary into host mode
pub const HOST_FLAG: &str = "--paratest-host";

/// Host side of a caller connection
pub struct Host {
    channel: Channel,
}

impl Host {
    /// Serve over `channel`
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Adopt the channel named by `PARATEST_IPC_FD`.
    pub fn from_env() -> anyhow::Result<Self> {
        let value = std::env::var(IPC_FD_ENV)
            .map_err(|_| anyhow::anyhow!("{} is not set", IPC_FD_ENV))?;
        let fd: i32 = value
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid {}: {:?}", IPC_FD_ENV, value))?;
        // The caller handed this descriptor to us alone
        let channel = unsafe { Channel::from_raw_fd(fd) };
        Ok(Self::new(channel))
    }

    /// Answer run requests until told to shut down or the caller goes away.
    ///
    /// `runner` returns whether the run succeeded. Returns the number of runs
    /// served.
    pub fn serve<F>(mut self, mut runner: F) -> Result<usize, ChannelError>
    where
        F: FnMut(&RunRequest) -> bool,
    {
        self.channel.send(&HostReply::Started)?;
        self.channel.send(&HostReply::Ready)?;

        let mut runs = 0;
        loop {
            match self.channel.next_message::<HostCommand>()? {
                Some(HostCommand::Run(request)) => {
                    tracing::info!(run = %request.name, "run requested");
                    let reply = if runner(&request) {
                        HostReply::Success
                    } else {
                        HostReply::Failure
                    };
                    runs += 1;
                    self.channel.send(&reply)?;
                    self.channel.send(&HostReply::Ready)?;
                }
                Some(HostCommand::Shutdown) => {
                    tracing::debug!(runs, "host shutting down");
                    return Ok(runs);
                }
                None => {
                    tracing::debug!(runs, "caller disconnected");
                    return Ok(runs);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paratest_ipc::RunOption;

    fn reply(channel: &mut Channel) -> HostReply {
        channel.next_message::<HostReply>().unwrap().unwrap()
    }

    #[test]
    fn test_host_answers_each_request() {
        let (mut caller, host_end) = Channel::pair().unwrap();
        let handle = std::thread::spawn(move || {
            let mut seen = Vec::new();
            let runs = Host::new(host_end).serve(|request| {
                seen.push(request.clone());
                request.name != "broken"
            });
            (runs, seen)
        });

        assert_eq!(reply(&mut caller), HostReply::Started);
        assert_eq!(reply(&mut caller), HostReply::Ready);

        let request = RunRequest {
            options: vec![RunOption::require("app::billing")],
            ..RunRequest::named("billing")
        };
        caller.send(&HostCommand::Run(request.clone())).unwrap();
        assert_eq!(reply(&mut caller), HostReply::Success);
        assert_eq!(reply(&mut caller), HostReply::Ready);

        caller
            .send(&HostCommand::Run(RunRequest::named("broken")))
            .unwrap();
        assert_eq!(reply(&mut caller), HostReply::Failure);
        assert_eq!(reply(&mut caller), HostReply::Ready);

        caller.send(&HostCommand::Shutdown).unwrap();
        let (runs, seen) = handle.join().unwrap();
        assert_eq!(runs.unwrap(), 2);
        assert_eq!(seen[0], request);
        assert_eq!(seen[1].name, "broken");
    }

    #[test]
    fn test_host_stops_on_disconnect() {
        let (mut caller, host_end) = Channel::pair().unwrap();
        let handle = std::thread::spawn(move || Host::new(host_end).serve(|_| true));

        assert_eq!(reply(&mut caller), HostReply::Started);
        assert_eq!(reply(&mut caller), HostReply::Ready);
        drop(caller);

        assert_eq!(handle.join().unwrap().unwrap(), 0);
    }
}
