use crate::client::{AgentClient, ClientError};
use crate::history::{History, Recall};
use crate::keys::{decode_keys, Key};
use crate::sandbox::{OutputFn, SandboxError, SandboxRuntime};
use crate::simulated::SimulatedShell;
use crate::surface::Surface;
use crate::vfs::{self, FileNode};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Backend the terminal surface currently targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalMode {
    Simulated,
    Sandboxed,
    Remote,
}

impl TerminalMode {
    /// Short label shown in the prompt.
    pub fn label(self) -> &'static str {
        match self {
            TerminalMode::Simulated => "mock",
            TerminalMode::Sandboxed => "web",
            TerminalMode::Remote => "local",
        }
    }
}

impl fmt::Display for TerminalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TerminalMode::Simulated => "simulated",
            TerminalMode::Sandboxed => "sandboxed",
            TerminalMode::Remote => "remote",
        };
        f.write_str(name)
    }
}

impl FromStr for TerminalMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "simulated" | "mock" => Ok(TerminalMode::Simulated),
            "sandboxed" | "web" => Ok(TerminalMode::Sandboxed),
            "remote" | "local" => Ok(TerminalMode::Remote),
            other => Err(format!(
                "unknown mode '{other}' (expected simulated, sandboxed or remote)"
            )),
        }
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("sandboxed mode needs an isolated workspace, which is not available")]
    SandboxUnavailable,
    #[error("sandbox is not ready yet")]
    SandboxNotReady,
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Client(#[from] ClientError),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes one terminal surface to one of three backends.
///
/// Switching modes never touches the agent connection: a live remote session
/// keeps running and its output is shown again once the remote mode is back.
pub struct TerminalController {
    mode: Arc<Mutex<TerminalMode>>,
    surface: Arc<dyn Surface>,
    client: AgentClient,
    remote_cwd: Arc<Mutex<String>>,
    simulated: SimulatedShell,
    sandbox: Arc<dyn SandboxRuntime>,
    sandbox_cwd: String,
    sandbox_task: Option<JoinHandle<()>>,
    history: History,
    line: String,
    echo: bool,
}

impl TerminalController {
    pub fn new(
        surface: Arc<dyn Surface>,
        client: AgentClient,
        sandbox: Arc<dyn SandboxRuntime>,
        tree: Vec<FileNode>,
    ) -> Self {
        let mode = Arc::new(Mutex::new(TerminalMode::Simulated));
        let remote_cwd = Arc::new(Mutex::new("~".to_string()));

        {
            let surface = Arc::clone(&surface);
            let mode = Arc::clone(&mode);
            // The agent answers `clear` with an empty output frame.
            client.on_output(move |data| {
                if *lock(&mode) != TerminalMode::Remote {
                    return;
                }
                if data.is_empty() {
                    surface.clear();
                } else {
                    surface.write(data);
                }
            });
        }
        {
            let remote_cwd = Arc::clone(&remote_cwd);
            client.on_cwd(move |cwd| *lock(&remote_cwd) = cwd.to_string());
        }

        Self {
            mode,
            surface,
            client,
            remote_cwd,
            simulated: SimulatedShell::new(tree),
            sandbox,
            sandbox_cwd: "/".to_string(),
            sandbox_task: None,
            history: History::default(),
            line: String::new(),
            echo: true,
        }
    }

    /// Whether typed characters are written back to the surface. Line-based
    /// frontends where the host terminal already echoes turn this off.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn mode(&self) -> TerminalMode {
        *lock(&self.mode)
    }

    pub fn client(&self) -> &AgentClient {
        &self.client
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// The in-progress input line.
    pub fn line(&self) -> &str {
        &self.line
    }

    /// Working directory of the active backend.
    pub fn cwd(&self) -> String {
        match self.mode() {
            TerminalMode::Simulated => self.simulated.cwd().to_string(),
            TerminalMode::Sandboxed => self.sandbox_cwd.clone(),
            TerminalMode::Remote => lock(&self.remote_cwd).clone(),
        }
    }

    pub fn banner(&self) {
        let out = &self.surface;
        out.writeln("\x1b[1;35m╔══════════════════════════════════════╗\x1b[0m");
        out.writeln("\x1b[1;35m║\x1b[0m   \x1b[1;36mTheMAG.dev Terminal\x1b[0m                \x1b[1;35m║\x1b[0m");
        out.writeln("\x1b[1;35m╚══════════════════════════════════════╝\x1b[0m");
        out.writeln("\x1b[90mType \"help\" for available commands\x1b[0m");
        self.prompt();
    }

    pub fn prompt(&self) {
        let cwd = self.cwd();
        self.surface.write(&format!(
            "\r\n\x1b[1;35m➜\x1b[0m \x1b[1;36m{}\x1b[0m \x1b[90m({})\x1b[0m ",
            prompt_dir(&cwd),
            self.mode().label()
        ));
    }

    pub async fn switch_mode(&mut self, mode: TerminalMode) -> Result<(), ControllerError> {
        if mode == TerminalMode::Sandboxed && !self.sandbox.isolation_available() {
            self.surface.writeln(
                "\r\n\x1b[33mSandboxed mode needs an isolated workspace, which is not available here.\x1b[0m",
            );
            self.surface
                .writeln("\x1b[90mStart the terminal with --sandbox-root <dir> to enable it.\x1b[0m");
            return Err(ControllerError::SandboxUnavailable);
        }

        *lock(&self.mode) = mode;
        self.line.clear();
        self.history.reset_cursor();
        debug!(%mode, "terminal mode switched");

        match mode {
            TerminalMode::Simulated => {}
            TerminalMode::Sandboxed => {
                if !self.sandbox.is_ready() {
                    self.surface.writeln("\r\n\x1b[90mBooting sandbox...\x1b[0m");
                    if let Err(err) = self.sandbox.boot().await {
                        self.surface
                            .writeln(&format!("\x1b[31mFailed to boot sandbox: {err}\x1b[0m"));
                        self.prompt();
                        return Err(err.into());
                    }
                    self.sandbox_cwd = "/".to_string();
                    self.surface.writeln("\x1b[32mSandbox ready.\x1b[0m");
                }
            }
            TerminalMode::Remote => {
                if !self.client.is_connected() {
                    self.remote_guidance();
                }
            }
        }
        self.surface.write("\r\n");
        self.prompt();
        Ok(())
    }

    /// Feeds raw terminal input. Every key is handled even if an earlier one
    /// reported an error; the first error is returned.
    pub async fn handle_input(&mut self, data: &str) -> Result<(), ControllerError> {
        let mut first = Ok(());
        for key in decode_keys(data) {
            let result = self.handle_key(key).await;
            if first.is_ok() {
                first = result;
            }
        }
        first
    }

    pub async fn handle_key(&mut self, key: Key) -> Result<(), ControllerError> {
        match key {
            Key::Enter => {
                let line = std::mem::take(&mut self.line);
                self.history.push(&line);
                let result = self.submit(&line).await;
                self.prompt();
                return result;
            }
            Key::Backspace => {
                if self.line.pop().is_some() && self.echo {
                    self.surface.write("\x08 \x08");
                }
            }
            Key::Up => {
                let recalled = match self.history.previous() {
                    Recall::Entry(entry) => Some(entry.to_string()),
                    _ => None,
                };
                if let Some(entry) = recalled {
                    self.replace_line(entry);
                }
            }
            Key::Down => {
                let recalled = match self.history.next() {
                    Recall::Entry(entry) => Some(entry.to_string()),
                    Recall::Blank => Some(String::new()),
                    Recall::Unchanged => None,
                };
                if let Some(entry) = recalled {
                    self.replace_line(entry);
                }
            }
            Key::Interrupt => {
                self.surface.write("^C");
                self.line.clear();
                self.history.reset_cursor();
                self.interrupt().await;
                self.prompt();
            }
            Key::ClearScreen => {
                self.surface.clear();
                self.prompt();
            }
            Key::Char(c) => {
                self.line.push(c);
                if self.echo {
                    let mut buf = [0u8; 4];
                    self.surface.write(c.encode_utf8(&mut buf));
                }
            }
            Key::Ignored => {}
        }
        Ok(())
    }

    /// Executes one line against the active backend. Does not render a prompt.
    pub async fn submit(&mut self, line: &str) -> Result<(), ControllerError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        match self.mode() {
            TerminalMode::Simulated => {
                if trimmed.eq_ignore_ascii_case("help") {
                    self.modes_help();
                }
                self.simulated.execute(trimmed, self.surface.as_ref());
                Ok(())
            }
            TerminalMode::Sandboxed => self.submit_sandboxed(trimmed),
            TerminalMode::Remote => self.submit_remote(trimmed).await,
        }
    }

    /// Waits for the running sandboxed command, if any.
    pub async fn wait_idle(&mut self) {
        if let Some(task) = self.sandbox_task.take() {
            let _ = task.await;
        }
    }

    fn submit_sandboxed(&mut self, line: &str) -> Result<(), ControllerError> {
        if !self.sandbox.is_ready() {
            self.surface
                .writeln("\r\n\x1b[33mSandbox is not ready yet. Please wait...\x1b[0m");
            return Err(ControllerError::SandboxNotReady);
        }

        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("pwd") => {
                self.surface.writeln(&format!("\r\n{}", self.sandbox_cwd));
                return Ok(());
            }
            Some("cd") => {
                self.sandbox_cwd = match parts.next() {
                    None | Some("~") => "/".to_string(),
                    Some(target) => vfs::resolve(&self.sandbox_cwd, target),
                };
                return Ok(());
            }
            _ => {}
        }

        let runtime = Arc::clone(&self.sandbox);
        let surface = Arc::clone(&self.surface);
        let command = line.to_string();
        let cwd = workspace_relative(&self.sandbox_cwd);
        self.surface.write("\r\n");
        let task = tokio::spawn(async move {
            let output: OutputFn = {
                let surface = Arc::clone(&surface);
                Arc::new(move |data: &str| surface.write(data))
            };
            match runtime.run(&command, &cwd, output).await {
                Ok(code) => debug!(command = %command, code, "sandboxed command finished"),
                Err(err) => {
                    warn!(command = %command, %err, "sandboxed command failed");
                    surface.writeln(&format!("\x1b[31mError: {err}\x1b[0m"));
                }
            }
        });
        self.sandbox_task = Some(task);
        Ok(())
    }

    async fn submit_remote(&mut self, line: &str) -> Result<(), ControllerError> {
        match self.client.run_command(line).await {
            Ok(()) => Ok(()),
            Err(ClientError::NotConnected) => {
                self.remote_guidance();
                Ok(())
            }
            Err(err) => {
                self.surface
                    .writeln(&format!("\r\n\x1b[31mError: {err}\x1b[0m"));
                Err(err.into())
            }
        }
    }

    async fn interrupt(&self) {
        match self.mode() {
            TerminalMode::Simulated => {}
            TerminalMode::Sandboxed => self.sandbox.kill().await,
            TerminalMode::Remote => match self.client.kill().await {
                Ok(()) | Err(ClientError::NotConnected) => {}
                Err(err) => warn!(%err, "failed to interrupt remote process"),
            },
        }
    }

    fn replace_line(&mut self, entry: String) {
        self.surface.write("\r\x1b[K");
        // The prompt starts with a line break that must not be repeated here.
        let cwd = self.cwd();
        self.surface.write(&format!(
            "\x1b[1;35m➜\x1b[0m \x1b[1;36m{}\x1b[0m \x1b[90m({})\x1b[0m ",
            prompt_dir(&cwd),
            self.mode().label()
        ));
        self.surface.write(&entry);
        self.line = entry;
    }

    fn modes_help(&self) {
        let out = &self.surface;
        out.writeln("\r\n\x1b[1;36mTerminal Modes:\x1b[0m");
        out.writeln("  \x1b[33mmock\x1b[0m   - Simulated commands over the sample workspace");
        out.writeln("  \x1b[33mweb\x1b[0m    - Real commands in an isolated sandbox workspace");
        out.writeln("  \x1b[33mlocal\x1b[0m  - Real commands on this machine via themag-agentd");
    }

    fn remote_guidance(&self) {
        let out = &self.surface;
        out.writeln("\r\n\x1b[33mLocal agent is not connected.\x1b[0m");
        out.writeln("\x1b[90mStart the agent on this machine:\x1b[0m");
        out.writeln("  \x1b[36mthemag-agentd --port 4477\x1b[0m");
        out.writeln("\x1b[90mThen connect the terminal to it (:connect).\x1b[0m");
    }
}

/// Last path segment, or `~` for the root and home markers.
pub fn prompt_dir(cwd: &str) -> String {
    let normalized = cwd.replace('\\', "/");
    match normalized.as_str() {
        "" | "/" | "~" => "~".to_string(),
        path => path
            .rsplit('/')
            .find(|part| !part.is_empty())
            .unwrap_or("~")
            .to_string(),
    }
}

fn workspace_relative(cwd: &str) -> String {
    match cwd.trim_start_matches('/') {
        "" => ".".to_string(),
        rest => rest.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::BufferSurface;
    use crate::vfs::sample_workspace;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Records every run instead of spawning anything.
    #[derive(Default)]
    struct FakeSandbox {
        isolated: bool,
        ready: AtomicBool,
        runs: Mutex<Vec<(String, String)>>,
        kills: Mutex<usize>,
    }

    impl FakeSandbox {
        fn isolated() -> Self {
            Self {
                isolated: true,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl SandboxRuntime for FakeSandbox {
        fn isolation_available(&self) -> bool {
            self.isolated
        }

        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        async fn boot(&self) -> Result<(), SandboxError> {
            self.ready.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn run(
            &self,
            command: &str,
            cwd: &str,
            output: OutputFn,
        ) -> Result<i32, SandboxError> {
            self.runs
                .lock()
                .unwrap()
                .push((command.to_string(), cwd.to_string()));
            output(&format!("ran {command}\n"));
            Ok(0)
        }

        async fn kill(&self) {
            *self.kills.lock().unwrap() += 1;
        }
    }

    fn controller(sandbox: FakeSandbox) -> (TerminalController, Arc<BufferSurface>, Arc<FakeSandbox>) {
        let surface = Arc::new(BufferSurface::new());
        let sandbox = Arc::new(sandbox);
        let controller = TerminalController::new(
            surface.clone(),
            AgentClient::new(),
            sandbox.clone(),
            sample_workspace(),
        );
        (controller, surface, sandbox)
    }

    #[test]
    fn modes_parse_from_names_and_labels() {
        assert_eq!("remote".parse::<TerminalMode>(), Ok(TerminalMode::Remote));
        assert_eq!("WEB".parse::<TerminalMode>(), Ok(TerminalMode::Sandboxed));
        assert_eq!("mock".parse::<TerminalMode>(), Ok(TerminalMode::Simulated));
        assert!("docker".parse::<TerminalMode>().is_err());
        assert_eq!(TerminalMode::Remote.label(), "local");
    }

    #[test]
    fn prompt_dir_shows_last_segment() {
        assert_eq!(prompt_dir("/"), "~");
        assert_eq!(prompt_dir("~"), "~");
        assert_eq!(prompt_dir("/home/user/project"), "project");
        assert_eq!(prompt_dir("C:\\Users\\dev"), "dev");
        assert_eq!(prompt_dir("/src/"), "src");
    }

    #[tokio::test]
    async fn simulated_lines_run_against_virtual_tree() {
        let (mut term, surface, _) = controller(FakeSandbox::default());
        term.handle_input("cd src\r").await.unwrap();
        assert_eq!(term.cwd(), "/src");
        surface.take();

        term.handle_input("pwd\r").await.unwrap();
        let text = surface.take();
        assert!(text.contains("\r\n/src\r\n"));
        assert!(text.ends_with("\x1b[1;36msrc\x1b[0m \x1b[90m(mock)\x1b[0m "));
    }

    #[tokio::test]
    async fn help_in_simulated_mode_lists_modes_and_commands() {
        let (mut term, surface, _) = controller(FakeSandbox::default());
        term.submit("help").await.unwrap();
        let text = surface.take();
        assert!(text.contains("Terminal Modes:"));
        assert!(text.contains("Available Commands:"));
    }

    #[tokio::test]
    async fn history_recall_replaces_line_without_submitting() {
        let (mut term, surface, _) = controller(FakeSandbox::default());
        term.handle_input("echo one\r\recho two\r").await.unwrap();
        assert_eq!(term.history().len(), 2);
        surface.take();

        term.handle_input("\x1b[A").await.unwrap();
        assert_eq!(term.line(), "echo two");
        term.handle_input("\x1b[A\x1b[A").await.unwrap();
        assert_eq!(term.line(), "echo one");
        term.handle_input("\x1b[B").await.unwrap();
        assert_eq!(term.line(), "echo two");
        term.handle_input("\x1b[B").await.unwrap();
        assert_eq!(term.line(), "");
        assert!(!surface.contents().contains("\r\none\r\n"));
    }

    #[tokio::test]
    async fn backspace_and_interrupt_edit_the_line() {
        let (mut term, surface, _) = controller(FakeSandbox::default());
        term.handle_input("lsx\x7f").await.unwrap();
        assert_eq!(term.line(), "ls");
        assert!(surface.contents().ends_with("lsx\x08 \x08"));

        term.handle_input("\x03").await.unwrap();
        assert_eq!(term.line(), "");
        assert!(surface.contents().contains("^C"));
        assert!(term.history().is_empty());
    }

    #[tokio::test]
    async fn ctrl_l_clears_surface() {
        let (mut term, surface, _) = controller(FakeSandbox::default());
        term.handle_input("echo hi\r\x0c").await.unwrap();
        assert_eq!(surface.clear_count(), 1);
        assert!(!surface.contents().contains("hi"));
    }

    #[tokio::test]
    async fn sandboxed_mode_is_rejected_without_isolation() {
        let (mut term, surface, _) = controller(FakeSandbox::default());
        let result = term.switch_mode(TerminalMode::Sandboxed).await;
        assert!(matches!(result, Err(ControllerError::SandboxUnavailable)));
        assert_eq!(term.mode(), TerminalMode::Simulated);
        assert!(surface.contents().contains("not available"));
    }

    #[tokio::test]
    async fn sandboxed_mode_tracks_its_own_directory() {
        let (mut term, surface, sandbox) = controller(FakeSandbox::isolated());
        term.switch_mode(TerminalMode::Sandboxed).await.unwrap();
        assert!(sandbox.is_ready());
        assert!(surface.contents().contains("(web)"));

        term.submit("cd src/components").await.unwrap();
        term.submit("cd ..").await.unwrap();
        term.submit("ls -la").await.unwrap();
        term.wait_idle().await;
        term.submit("cd").await.unwrap();
        term.submit("node index.js").await.unwrap();
        term.wait_idle().await;

        assert_eq!(
            *sandbox.runs.lock().unwrap(),
            vec![
                ("ls -la".to_string(), "src".to_string()),
                ("node index.js".to_string(), ".".to_string()),
            ]
        );
        surface.take();
        term.submit("pwd").await.unwrap();
        assert_eq!(surface.take(), "\r\n/\r\n");
    }

    #[tokio::test]
    async fn sandboxed_output_and_interrupt() {
        let (mut term, surface, sandbox) = controller(FakeSandbox::isolated());
        term.switch_mode(TerminalMode::Sandboxed).await.unwrap();
        term.submit("npm test").await.unwrap();
        term.wait_idle().await;
        assert!(surface.contents().contains("ran npm test"));

        term.handle_input("\x03").await.unwrap();
        assert_eq!(*sandbox.kills.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn sandboxed_submit_before_boot_reports_not_ready() {
        let (mut term, surface, sandbox) = controller(FakeSandbox::isolated());
        *term.mode.lock().unwrap() = TerminalMode::Sandboxed;
        let result = term.submit("ls").await;
        assert!(matches!(result, Err(ControllerError::SandboxNotReady)));
        assert!(surface.contents().contains("not ready yet"));
        assert!(sandbox.runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn remote_mode_without_agent_prints_guidance() {
        let (mut term, surface, _) = controller(FakeSandbox::default());
        term.switch_mode(TerminalMode::Remote).await.unwrap();
        assert!(surface.take().contains("Local agent is not connected."));

        term.submit("ls").await.unwrap();
        assert!(surface.take().contains("themag-agentd --port 4477"));

        term.handle_input("\x03").await.unwrap();
        assert!(surface.contents().contains("(local)"));
    }
}
