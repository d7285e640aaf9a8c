//! Frame codec for the local agent session protocol.
//!
//! Every WebSocket text frame carries exactly one JSON object whose `type`
//! field selects the variant. Decoding is lenient: anything that does not
//! parse yields `None` and the caller drops it.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Port the agent listens on unless configured otherwise.
pub const DEFAULT_AGENT_PORT: u16 = 4477;

/// Environment variable overriding [`DEFAULT_AGENT_PORT`].
pub const AGENT_PORT_ENV: &str = "THEMAG_AGENT_PORT";

/// Exit code reported when a process was terminated by a signal or never started.
pub const ABNORMAL_EXIT_CODE: i32 = -1;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// Sent once by the agent right after the handshake.
    Ready { cwd: String },
    /// Start a command, replacing any live one.
    Run {
        #[serde(default)]
        command: String,
    },
    /// Raw bytes for the live process' stdin.
    Input {
        #[serde(default)]
        data: String,
    },
    Kill,
    /// Working directory changed through `cd`.
    Cwd { cwd: String },
    Output {
        #[serde(default)]
        data: String,
    },
    Exit { code: i32 },
}

/// Which peer is allowed to originate a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    AgentToClient,
    ClientToAgent,
}

impl Message {
    pub fn ready(cwd: impl Into<String>) -> Self {
        Self::Ready { cwd: cwd.into() }
    }

    pub fn run(command: impl Into<String>) -> Self {
        Self::Run {
            command: command.into(),
        }
    }

    pub fn input(data: impl Into<String>) -> Self {
        Self::Input { data: data.into() }
    }

    pub fn cwd(cwd: impl Into<String>) -> Self {
        Self::Cwd { cwd: cwd.into() }
    }

    pub fn output(data: impl Into<String>) -> Self {
        Self::Output { data: data.into() }
    }

    pub fn exit(code: i32) -> Self {
        Self::Exit { code }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Self::Run { .. } | Self::Input { .. } | Self::Kill => Direction::ClientToAgent,
            Self::Ready { .. } | Self::Cwd { .. } | Self::Output { .. } | Self::Exit { .. } => {
                Direction::AgentToClient
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Run { .. } => "run",
            Self::Input { .. } => "input",
            Self::Kill => "kill",
            Self::Cwd { .. } => "cwd",
            Self::Output { .. } => "output",
            Self::Exit { .. } => "exit",
        }
    }
}

/// Serialize one message into a text frame.
pub fn encode(message: &Message) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// Parse one text frame. Malformed or unknown frames yield `None`.
pub fn decode(frame: &str) -> Option<Message> {
    match serde_json::from_str::<Message>(frame) {
        Ok(message) => Some(message),
        Err(err) => {
            debug!(error = %err, len = frame.len(), "dropping undecodable frame");
            None
        }
    }
}

/// Like [`decode`], but also drops messages the given peer must never send.
pub fn decode_from(frame: &str, sender: Direction) -> Option<Message> {
    decode(frame).filter(|message| {
        let ok = message.direction() == sender;
        if !ok {
            debug!(kind = message.kind(), "dropping frame sent in the wrong direction");
        }
        ok
    })
}
