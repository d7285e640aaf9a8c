use super::{OutputFn, SandboxError, SandboxRuntime};
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use themag_agentd::{LaunchRequest, ProcessEvent, ProcessId, ProcessLauncher, ShellProcessLauncher};
use themag_protocol::ABNORMAL_EXIT_CODE;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 64;

/// Runs commands inside a scratch directory that acts as the workspace root.
///
/// Working directories are resolved inside the root and can never leave it.
/// Without a root the runtime reports isolation as unavailable. Commands get
/// an empty stdin and are killed together with everything they started.
pub struct ScratchDirRuntime {
    root: Option<PathBuf>,
    launcher: ShellProcessLauncher,
    ready: AtomicBool,
    runs: AtomicU64,
    current: Mutex<Option<(u64, oneshot::Sender<()>)>>,
}

impl ScratchDirRuntime {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::build(Some(root.into()))
    }

    pub fn unavailable() -> Self {
        Self::build(None)
    }

    pub fn with_shell(mut self, shell: Option<String>) -> Self {
        self.launcher = ShellProcessLauncher::with_shell(shell);
        self
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    fn build(root: Option<PathBuf>) -> Self {
        Self {
            root,
            launcher: ShellProcessLauncher::new(),
            ready: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            current: Mutex::new(None),
        }
    }

    fn current(&self) -> MutexGuard<'_, Option<(u64, oneshot::Sender<()>)>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SandboxRuntime for ScratchDirRuntime {
    fn isolation_available(&self) -> bool {
        self.root.is_some()
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    async fn boot(&self) -> Result<(), SandboxError> {
        let root = self.root.as_ref().ok_or(SandboxError::IsolationUnavailable)?;
        if self.is_ready() {
            return Ok(());
        }
        seed_workspace(root).await.map_err(SandboxError::Workspace)?;
        self.ready.store(true, Ordering::Release);
        info!(root = %root.display(), "sandbox workspace ready");
        Ok(())
    }

    async fn run(&self, command: &str, cwd: &str, output: OutputFn) -> Result<i32, SandboxError> {
        let root = self.root.as_ref().ok_or(SandboxError::IsolationUnavailable)?;
        if !self.is_ready() {
            return Err(SandboxError::NotBooted);
        }
        let dir = confine(root, cwd);

        let run_id = self.runs.fetch_add(1, Ordering::Relaxed) + 1;
        let (events_tx, mut events) = mpsc::channel(EVENT_CAPACITY);
        let mut process = self.launcher.launch(
            LaunchRequest {
                id: ProcessId::new(run_id),
                command: command.to_string(),
                cwd: dir.clone(),
            },
            events_tx,
        )?;
        process.close_stdin();
        debug!(command, dir = %dir.display(), pid = process.os_pid(), "sandbox command started");

        let (kill_tx, mut kill_rx) = oneshot::channel();
        if let Some((_, previous)) = self.current().replace((run_id, kill_tx)) {
            let _ = previous.send(());
        }

        let mut killed = false;
        let code = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ProcessEvent::Output { data, .. }) => output(data.as_str()),
                    Some(ProcessEvent::Exited { code, .. }) => break code,
                    None => break ABNORMAL_EXIT_CODE,
                },
                _ = &mut kill_rx, if !killed => {
                    killed = true;
                    process.terminate();
                }
            }
        };

        {
            let mut current = self.current();
            if matches!(current.as_ref(), Some((id, _)) if *id == run_id) {
                current.take();
            }
        }
        Ok(code)
    }

    async fn kill(&self) {
        if let Some((_, kill)) = self.current().take() {
            let _ = kill.send(());
        }
    }
}

/// Maps a workspace-relative directory onto the root; `..` stops at the root.
fn confine(root: &Path, cwd: &str) -> PathBuf {
    let mut parts: Vec<&str> = Vec::new();
    for part in cwd.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    parts.iter().fold(root.to_path_buf(), |dir, part| dir.join(part))
}

async fn seed_workspace(root: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(root.join("src")).await?;
    let package = json!({
        "name": "themag-workspace",
        "version": "1.0.0",
        "type": "module",
        "scripts": {
            "dev": "echo \"Development server would start here\"",
            "build": "echo \"Build would run here\"",
            "test": "echo \"Tests would run here\""
        },
        "dependencies": {}
    });
    let package = serde_json::to_string_pretty(&package).map_err(std::io::Error::other)?;
    let files = [
        ("package.json", package.as_str()),
        (
            "README.md",
            "# TheMAG.dev Workspace\n\nWelcome to your sandboxed workspace!\n\nYou can run Node.js commands, npm, and more.\n",
        ),
        ("index.js", "console.log(\"Hello from TheMAG.dev sandbox!\");\n"),
        (
            "src/main.ts",
            "// Your TypeScript code here\nconsole.log(\"TypeScript ready!\");\n",
        ),
    ];
    for (name, contents) in files {
        let path = root.join(name);
        if tokio::fs::try_exists(&path).await? {
            continue;
        }
        tokio::fs::write(&path, contents).await?;
    }
    Ok(())
}
