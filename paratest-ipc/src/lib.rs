#![warn(missing_docs)]
//! paratest IPC Protocol
//!
//! Framed object channel between the orchestrator and its worker processes.
//! Each frame is a 4-byte big-endian length followed by an rkyv payload holding
//! one of the tagged unions in this crate.

mod channel;
mod messages;

pub use channel::{
    Channel, ChannelError, MAX_FRAME_SIZE, Messages, Recv, decode_frame, encode_frame,
};
pub use messages::{
    Fault, FaultKind, HostCommand, HostReply, OptionKind, OrchestratorCommand, RunOption,
    RunRequest, SuiteOutcome, WorkerMessage,
};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable naming the inherited channel descriptor in a child
pub const IPC_FD_ENV: &str = "PARATEST_IPC_FD";

/// Descriptor number the channel endpoint is moved to in a child
pub const CHILD_IPC_FD: i32 = 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_message_roundtrip() {
        let (mut orchestrator, mut worker) = Channel::pair().unwrap();

        let sent = vec![
            WorkerMessage::Started {
                protocol_version: PROTOCOL_VERSION,
                worker: 2,
            },
            WorkerMessage::Ready,
            WorkerMessage::Result(SuiteOutcome {
                suite: "Billing".to_string(),
                test_count: 3,
                assertion_count: 9,
                failures: vec![Fault {
                    kind: FaultKind::Failure,
                    suite: "Billing".to_string(),
                    test: "charges_tax".to_string(),
                    message: "expected 3, got 4".to_string(),
                    backtrace: Some("at billing.rs:10".to_string()),
                }],
                errors: Vec::new(),
                duration_nanos: 1_500_000,
            }),
            WorkerMessage::Finished,
        ];
        for message in &sent {
            worker.send(message).unwrap();
        }

        orchestrator.set_nonblocking(true).unwrap();
        let received: Vec<WorkerMessage> = orchestrator
            .messages::<WorkerMessage>()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(received, sent);
    }

    #[test]
    fn test_command_roundtrip() {
        let (mut orchestrator, mut worker) = Channel::pair().unwrap();
        orchestrator
            .send(&OrchestratorCommand::Run {
                suite: "Accounts".to_string(),
            })
            .unwrap();
        orchestrator.send(&OrchestratorCommand::Finish).unwrap();

        assert_eq!(
            worker.next_message::<OrchestratorCommand>().unwrap(),
            Some(OrchestratorCommand::Run {
                suite: "Accounts".to_string()
            })
        );
        assert_eq!(
            worker.next_message::<OrchestratorCommand>().unwrap(),
            Some(OrchestratorCommand::Finish)
        );
    }

    #[test]
    fn test_run_request_roundtrip() {
        let (mut a, mut b) = Channel::pair().unwrap();
        let request = RunRequest {
            name: "test:units".to_string(),
            options: vec![RunOption::require("app::support")],
            files: vec!["tests/models.rs".to_string()],
        };
        a.send(&HostCommand::Run(request.clone())).unwrap();

        assert_eq!(
            b.next_message::<HostCommand>().unwrap(),
            Some(HostCommand::Run(request))
        );
    }
}
