pub mod command;
pub mod value_object;

pub use command::SessionCommand;
pub use value_object::{resolve_directory, ProcessId, SessionId};
