pub mod scratch;

pub use scratch::ScratchDirRuntime;

use async_trait::async_trait;
use std::sync::Arc;
use themag_agentd::LaunchError;
use thiserror::Error;

/// Receives output chunks as a sandboxed command produces them.
pub type OutputFn = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("isolated workspace is not available")]
    IsolationUnavailable,
    #[error("sandbox has not been booted")]
    NotBooted,
    #[error("failed to prepare workspace: {0}")]
    Workspace(#[source] std::io::Error),
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

/// Execution backend that keeps no shell state between invocations.
///
/// Every `run` starts from the workspace-relative `cwd` it is given; callers
/// track the directory themselves.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Whether the host can provide the isolation this backend needs at all.
    fn isolation_available(&self) -> bool;

    fn is_ready(&self) -> bool;

    /// Prepares the workspace. Calling it again once ready is a no-op.
    async fn boot(&self) -> Result<(), SandboxError>;

    /// Runs `command` to completion and returns its exit code.
    async fn run(&self, command: &str, cwd: &str, output: OutputFn) -> Result<i32, SandboxError>;

    /// Terminates the command currently running, if any.
    async fn kill(&self);
}
