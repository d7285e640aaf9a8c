use crate::domain::session::ProcessId;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchRequest {
    pub id: ProcessId,
    pub command: String,
    pub cwd: PathBuf,
}

/// Emitted by a running process towards its session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessEvent {
    Output { process: ProcessId, data: String },
    /// Always the last event of a process, sent exactly once.
    Exited { process: ProcessId, code: i32 },
}

pub type ProcessEventSender = mpsc::Sender<ProcessEvent>;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("child process has no {0} pipe")]
    MissingPipe(&'static str),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProcessIoError {
    #[error("process stdin is closed")]
    StdinClosed,
    #[error("process is not reading its input fast enough")]
    Backlogged,
}

pub trait ProcessLauncher: Send + Sync {
    /// Starts the command and streams its output and exit through `events`.
    fn launch(
        &self,
        request: LaunchRequest,
        events: ProcessEventSender,
    ) -> Result<Box<dyn ProcessControl>, LaunchError>;
}

/// Handle a session keeps for its live process.
///
/// Dropping the handle terminates the process without waiting for it. None of
/// the methods wait on the child, so a stalled process never stalls its owner.
pub trait ProcessControl: Send + Sync {
    fn id(&self) -> ProcessId;

    fn os_pid(&self) -> Option<u32> {
        None
    }

    /// Queues `data` for the process' stdin.
    fn write_stdin(&mut self, data: &[u8]) -> Result<(), ProcessIoError>;

    /// Delivers end-of-file once queued input has been written.
    fn close_stdin(&mut self);

    /// Sends the termination signal. The exit still arrives as [`ProcessEvent::Exited`].
    fn terminate(&mut self);
}
