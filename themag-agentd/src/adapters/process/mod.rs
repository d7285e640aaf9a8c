pub mod shell;

pub use shell::ShellProcessLauncher;
