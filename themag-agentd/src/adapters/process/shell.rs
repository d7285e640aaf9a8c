use crate::domain::session::ProcessId;
use crate::ports::process::{
    LaunchError, LaunchRequest, ProcessControl, ProcessEvent, ProcessEventSender, ProcessIoError,
    ProcessLauncher,
};
use std::process::Stdio;
use std::time::Duration;
use themag_protocol::ABNORMAL_EXIT_CODE;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 8 * 1024;
/// Input chunks waiting for a process that is not reading its stdin.
const STDIN_QUEUE: usize = 64;
/// How long output pumps may keep draining after the child is gone. Background
/// jobs that inherited the pipes would otherwise hold the exit report forever.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Runs commands through the platform shell (`cmd.exe /C` on Windows, `sh -c` elsewhere).
///
/// On unix every command leads its own process group, and terminating it
/// signals the whole group so pipelines and subshells go down with it.
pub struct ShellProcessLauncher {
    shell: Option<String>,
}

impl ShellProcessLauncher {
    pub fn new() -> Self {
        Self { shell: None }
    }

    pub fn with_shell(shell: Option<String>) -> Self {
        Self { shell }
    }

    fn command(&self, line: &str) -> Command {
        #[cfg(windows)]
        let mut command = {
            let mut cmd = Command::new(self.shell.as_deref().unwrap_or("cmd.exe"));
            cmd.arg("/C").arg(line);
            cmd
        };
        #[cfg(not(windows))]
        let mut command = {
            let mut cmd = Command::new(self.shell.as_deref().unwrap_or("sh"));
            cmd.arg("-c").arg(line);
            cmd
        };
        #[cfg(unix)]
        command.process_group(0);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

impl Default for ShellProcessLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLauncher for ShellProcessLauncher {
    fn launch(
        &self,
        request: LaunchRequest,
        events: ProcessEventSender,
    ) -> Result<Box<dyn ProcessControl>, LaunchError> {
        let mut command = self.command(&request.command);
        command.current_dir(&request.cwd);

        let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
            command: request.command.clone(),
            source,
        })?;
        let pid = child.id();
        let stdin = child.stdin.take().ok_or(LaunchError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(LaunchError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(LaunchError::MissingPipe("stderr"))?;

        info!(process = %request.id, pid, cwd = %request.cwd.display(), command = %request.command, "process started");

        let (input_tx, input_rx) = mpsc::channel(STDIN_QUEUE);
        let feeder = tokio::spawn(feed_stdin(request.id, stdin, input_rx));
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(supervise(
            request.id,
            child,
            stdout,
            stderr,
            feeder.abort_handle(),
            kill_rx,
            events,
        ));

        Ok(Box::new(ShellProcess {
            id: request.id,
            pid,
            input: Some(input_tx),
            feeder: feeder.abort_handle(),
            kill: Some(kill_tx),
        }))
    }
}

struct ShellProcess {
    id: ProcessId,
    pid: Option<u32>,
    input: Option<mpsc::Sender<Vec<u8>>>,
    feeder: AbortHandle,
    kill: Option<oneshot::Sender<()>>,
}

impl ProcessControl for ShellProcess {
    fn id(&self) -> ProcessId {
        self.id
    }

    fn os_pid(&self) -> Option<u32> {
        self.pid
    }

    fn write_stdin(&mut self, data: &[u8]) -> Result<(), ProcessIoError> {
        let input = self.input.as_ref().ok_or(ProcessIoError::StdinClosed)?;
        input.try_send(data.to_vec()).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ProcessIoError::Backlogged,
            mpsc::error::TrySendError::Closed(_) => ProcessIoError::StdinClosed,
        })
    }

    fn close_stdin(&mut self) {
        self.input = None;
    }

    fn terminate(&mut self) {
        self.input = None;
        self.feeder.abort();
        if let Some(kill) = self.kill.take() {
            debug!(process = %self.id, pid = self.pid, "terminating process");
            let _ = kill.send(());
        }
    }
}

impl Drop for ShellProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Writes queued input to the child. Dropping the queue sender closes the pipe.
async fn feed_stdin(id: ProcessId, mut stdin: ChildStdin, mut input: mpsc::Receiver<Vec<u8>>) {
    while let Some(chunk) = input.recv().await {
        let written = async {
            stdin.write_all(&chunk).await?;
            stdin.flush().await
        };
        if let Err(err) = written.await {
            debug!(process = %id, %err, "stdin write failed, closing input");
            return;
        }
    }
}

#[cfg(unix)]
fn kill_process_tree(child: &mut Child) -> std::io::Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return Ok(());
    };
    let group = i32::try_from(pid).map_err(std::io::Error::other)?;
    killpg(Pid::from_raw(group), Signal::SIGKILL).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

async fn supervise<O, E>(
    id: ProcessId,
    mut child: Child,
    stdout: O,
    stderr: E,
    feeder: AbortHandle,
    mut kill: oneshot::Receiver<()>,
    events: ProcessEventSender,
) where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let mut stdout_pump = tokio::spawn(pump(id, stdout, events.clone()));
    let mut stderr_pump = tokio::spawn(pump(id, stderr, events.clone()));

    // A dropped sender means the owning session went away: terminate as well.
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill => {
            if let Err(err) = kill_process_tree(&mut child) {
                debug!(process = %id, %err, "kill failed, process already exited");
            }
            child.wait().await
        }
    };
    feeder.abort();

    let drained = tokio::time::timeout(DRAIN_GRACE, async {
        let _ = (&mut stdout_pump).await;
        let _ = (&mut stderr_pump).await;
    })
    .await;
    if drained.is_err() {
        debug!(process = %id, "output pipes still open after exit, detaching");
        stdout_pump.abort();
        stderr_pump.abort();
    }

    let code = match status {
        Ok(status) => status.code().unwrap_or(ABNORMAL_EXIT_CODE),
        Err(err) => {
            warn!(process = %id, %err, "failed waiting for process");
            ABNORMAL_EXIT_CODE
        }
    };
    info!(process = %id, code, "process exited");
    let _ = events.send(ProcessEvent::Exited { process: id, code }).await;
}

async fn pump<R>(id: ProcessId, mut reader: R, events: ProcessEventSender)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut decoder = Utf8Chunker::default();
    loop {
        let read = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                debug!(process = %id, %err, "output pipe read failed");
                break;
            }
        };
        let data = decoder.push(&buf[..read]);
        if data.is_empty() {
            continue;
        }
        if events
            .send(ProcessEvent::Output { process: id, data })
            .await
            .is_err()
        {
            return;
        }
    }
    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = events
            .send(ProcessEvent::Output {
                process: id,
                data: rest,
            })
            .await;
    }
}

/// Turns arbitrary byte chunks into text without splitting multi-byte characters.
#[derive(Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + invalid);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
