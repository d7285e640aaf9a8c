//! Client side of the TheMAG bridge.
//!
//! [`AgentClient`] speaks the session protocol to a local `themag-agentd`;
//! [`TerminalController`] puts one terminal surface in front of either that
//! agent, a sandboxed workspace or the simulated shell.

pub mod client;
pub mod controller;
pub mod history;
pub mod keys;
pub mod sandbox;
pub mod simulated;
pub mod surface;
pub mod vfs;

pub use client::{AgentClient, AgentStatus, ClientError, DEFAULT_AGENT_URL, DEFAULT_ORIGIN};
pub use controller::{ControllerError, TerminalController, TerminalMode};
pub use sandbox::{SandboxError, SandboxRuntime, ScratchDirRuntime};
pub use surface::{BufferSurface, StdoutSurface, Surface};
