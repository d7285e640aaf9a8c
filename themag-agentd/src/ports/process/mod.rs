pub mod launcher;

pub use launcher::{
    LaunchError, LaunchRequest, ProcessControl, ProcessEvent, ProcessEventSender, ProcessIoError,
    ProcessLauncher,
};
