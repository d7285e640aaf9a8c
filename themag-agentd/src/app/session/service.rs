use crate::domain::session::{resolve_directory, ProcessId, SessionCommand, SessionId};
use crate::ports::process::{
    LaunchRequest, ProcessControl, ProcessEvent, ProcessEventSender, ProcessLauncher,
};
use crate::telemetry::BridgeMetrics;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use themag_protocol::{Message, ABNORMAL_EXIT_CODE};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The outbound half of the connection is gone; the session must end.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("session transport closed")]
pub struct SessionClosed;

/// Shared, read-only inputs every session is created from.
#[derive(Clone)]
pub struct SessionContext {
    pub launcher: Arc<dyn ProcessLauncher>,
    pub workdir: PathBuf,
    pub home: PathBuf,
    pub metrics: Option<Arc<BridgeMetrics>>,
}

/// Per-connection execution state.
///
/// Owns the working directory and at most one live process. Messages are
/// handled one at a time in arrival order; process events are fed back in
/// through [`Session::on_process_event`] by the connection loop.
pub struct Session {
    id: SessionId,
    cwd: PathBuf,
    home: PathBuf,
    launcher: Arc<dyn ProcessLauncher>,
    process: Option<Box<dyn ProcessControl>>,
    last_process: ProcessId,
    started: HashMap<ProcessId, Instant>,
    outbound: mpsc::Sender<Message>,
    events: ProcessEventSender,
    metrics: Option<Arc<BridgeMetrics>>,
}

impl Session {
    /// Creates the session and announces it with `ready`.
    pub async fn open(
        ctx: &SessionContext,
        outbound: mpsc::Sender<Message>,
        events: ProcessEventSender,
    ) -> Result<Self, SessionClosed> {
        let session = Self {
            id: SessionId::new(),
            cwd: ctx.workdir.clone(),
            home: ctx.home.clone(),
            launcher: Arc::clone(&ctx.launcher),
            process: None,
            last_process: ProcessId::new(0),
            started: HashMap::new(),
            outbound,
            events,
            metrics: ctx.metrics.clone(),
        };
        info!(session = %session.id, cwd = %session.cwd.display(), "session opened");
        if let Some(metrics) = &session.metrics {
            metrics.record_session_opened();
        }
        session
            .send(Message::ready(session.cwd.display().to_string()))
            .await?;
        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn live_process(&self) -> Option<ProcessId> {
        self.process.as_ref().map(|process| process.id())
    }

    pub async fn handle(&mut self, message: Message) -> Result<(), SessionClosed> {
        match message {
            Message::Run { command } => self.run(&command).await,
            Message::Input { data } => {
                self.write_input(&data);
                Ok(())
            }
            Message::Kill => {
                self.kill();
                Ok(())
            }
            other => {
                debug!(session = %self.id, kind = other.kind(), "ignoring agent-bound message from client");
                Ok(())
            }
        }
    }

    pub async fn on_process_event(&mut self, event: ProcessEvent) -> Result<(), SessionClosed> {
        match event {
            ProcessEvent::Output { data, .. } => self.send(Message::output(data)).await,
            ProcessEvent::Exited { process, code } => {
                if let (Some(started), Some(metrics)) =
                    (self.started.remove(&process), &self.metrics)
                {
                    metrics.record_process_exit(started.elapsed().as_secs_f64() * 1000.0, code);
                }
                if self.live_process() == Some(process) {
                    self.process = None;
                }
                self.send(Message::exit(code)).await
            }
        }
    }

    async fn run(&mut self, raw: &str) -> Result<(), SessionClosed> {
        match SessionCommand::parse(raw) {
            SessionCommand::Empty => Ok(()),
            SessionCommand::Pwd => {
                let text = format!("\r\n{}\r\n", self.cwd.display());
                self.send(Message::output(text)).await
            }
            SessionCommand::Clear => self.send(Message::output("")).await,
            SessionCommand::ChangeDirectory(target) => {
                self.cwd = resolve_directory(&self.cwd, &self.home, target);
                debug!(session = %self.id, cwd = %self.cwd.display(), "working directory changed");
                self.send(Message::cwd(self.cwd.display().to_string()))
                    .await
            }
            SessionCommand::Spawn(command) => self.spawn(command).await,
        }
    }

    async fn spawn(&mut self, command: &str) -> Result<(), SessionClosed> {
        if let Some(mut previous) = self.process.take() {
            info!(session = %self.id, process = %previous.id(), "replacing live process");
            previous.terminate();
        }

        self.last_process = self.last_process.next();
        let request = LaunchRequest {
            id: self.last_process,
            command: command.to_string(),
            cwd: self.cwd.clone(),
        };
        match self.launcher.launch(request, self.events.clone()) {
            Ok(process) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_spawn(true);
                }
                info!(session = %self.id, process = %process.id(), pid = process.os_pid(), "process spawned");
                self.started.insert(process.id(), Instant::now());
                self.process = Some(process);
                Ok(())
            }
            Err(err) => {
                warn!(session = %self.id, %err, "spawn failed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_spawn(false);
                }
                self.send(Message::output(format!("\r\n{err}\r\n"))).await?;
                self.send(Message::exit(ABNORMAL_EXIT_CODE)).await
            }
        }
    }

    fn write_input(&mut self, data: &str) {
        let Some(process) = self.process.as_mut() else {
            return;
        };
        if let Err(err) = process.write_stdin(data.as_bytes()) {
            debug!(session = %self.id, process = %process.id(), %err, "dropping input");
        }
    }

    fn kill(&mut self) {
        if let Some(mut process) = self.process.take() {
            info!(session = %self.id, process = %process.id(), "kill requested");
            process.terminate();
        }
    }

    async fn send(&self, message: Message) -> Result<(), SessionClosed> {
        self.outbound.send(message).await.map_err(|_| SessionClosed)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.take() {
            debug!(session = %self.id, process = %process.id(), "terminating process on disconnect");
            process.terminate();
        }
        info!(session = %self.id, "session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::process::{LaunchError, ProcessIoError};
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Default)]
    struct RecordingLauncher {
        log: Log,
        fail: bool,
    }

    struct RecordingProcess {
        id: ProcessId,
        log: Log,
        terminated: bool,
    }

    impl ProcessLauncher for RecordingLauncher {
        fn launch(
            &self,
            request: LaunchRequest,
            _events: ProcessEventSender,
        ) -> Result<Box<dyn ProcessControl>, LaunchError> {
            if self.fail {
                return Err(LaunchError::Spawn {
                    command: request.command,
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no shell"),
                });
            }
            self.log.lock().unwrap().push(format!(
                "launch:{}:{}:{}",
                request.id,
                request.command,
                request.cwd.display()
            ));
            Ok(Box::new(RecordingProcess {
                id: request.id,
                log: Arc::clone(&self.log),
                terminated: false,
            }))
        }
    }

    impl ProcessControl for RecordingProcess {
        fn id(&self) -> ProcessId {
            self.id
        }

        fn write_stdin(&mut self, data: &[u8]) -> Result<(), ProcessIoError> {
            self.log.lock().unwrap().push(format!(
                "stdin:{}:{}",
                self.id,
                String::from_utf8_lossy(data)
            ));
            Ok(())
        }

        fn close_stdin(&mut self) {
            self.log.lock().unwrap().push(format!("eof:{}", self.id));
        }

        fn terminate(&mut self) {
            if !self.terminated {
                self.terminated = true;
                self.log.lock().unwrap().push(format!("terminate:{}", self.id));
            }
        }
    }

    impl Drop for RecordingProcess {
        fn drop(&mut self) {
            self.terminate();
        }
    }

    struct Harness {
        session: Session,
        outbound: mpsc::Receiver<Message>,
        log: Log,
    }

    impl Harness {
        fn drain(&mut self) -> Vec<Message> {
            let mut messages = Vec::new();
            while let Ok(message) = self.outbound.try_recv() {
                messages.push(message);
            }
            messages
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    async fn harness_with(launcher: RecordingLauncher) -> Harness {
        let log = Arc::clone(&launcher.log);
        let ctx = SessionContext {
            launcher: Arc::new(launcher),
            workdir: PathBuf::from("/srv/app"),
            home: PathBuf::from("/home/user"),
            metrics: None,
        };
        let (out_tx, outbound) = mpsc::channel(32);
        let (events, _events_rx) = mpsc::channel(32);
        let session = Session::open(&ctx, out_tx, events).await.unwrap();
        Harness {
            session,
            outbound,
            log,
        }
    }

    async fn harness() -> Harness {
        harness_with(RecordingLauncher::default()).await
    }

    #[tokio::test]
    async fn ready_is_sent_first() {
        let mut h = harness().await;
        assert_eq!(h.drain(), vec![Message::ready("/srv/app")]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn builtins_do_not_spawn() {
        let mut h = harness().await;
        h.drain();

        h.session.handle(Message::run("   ")).await.unwrap();
        h.session.handle(Message::run("pwd")).await.unwrap();
        h.session.handle(Message::run("clear")).await.unwrap();
        h.session.handle(Message::run("cd ../lib")).await.unwrap();
        h.session.handle(Message::run("pwd")).await.unwrap();
        h.session.handle(Message::run("cd")).await.unwrap();

        assert_eq!(
            h.drain(),
            vec![
                Message::output("\r\n/srv/app\r\n"),
                Message::output(""),
                Message::cwd("/srv/lib"),
                Message::output("\r\n/srv/lib\r\n"),
                Message::cwd("/home/user"),
            ]
        );
        assert!(h.log().is_empty());
        assert_eq!(h.session.live_process(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_uses_session_directory() {
        let mut h = harness().await;
        h.session.handle(Message::run("cd /tmp")).await.unwrap();
        h.session.handle(Message::run("ls -la")).await.unwrap();
        assert_eq!(h.log(), vec!["launch:1:ls -la:/tmp"]);
        assert_eq!(h.session.live_process(), Some(ProcessId::new(1)));
    }

    #[tokio::test]
    async fn second_run_terminates_first_before_spawning() {
        let mut h = harness().await;
        h.session.handle(Message::run("sleep 30")).await.unwrap();
        h.session.handle(Message::run("echo next")).await.unwrap();

        let log = h.log();
        assert_eq!(log.len(), 3);
        assert!(log[0].starts_with("launch:1:sleep 30"));
        assert_eq!(log[1], "terminate:1");
        assert!(log[2].starts_with("launch:2:echo next"));
        assert_eq!(h.session.live_process(), Some(ProcessId::new(2)));
    }

    #[tokio::test]
    async fn input_and_kill_target_live_process_only() {
        let mut h = harness().await;
        h.session.handle(Message::input("ignored")).await.unwrap();
        h.session.handle(Message::Kill).await.unwrap();
        assert!(h.log().is_empty());

        h.session.handle(Message::run("cat")).await.unwrap();
        h.session.handle(Message::input("abc\n")).await.unwrap();
        h.session.handle(Message::Kill).await.unwrap();
        h.session.handle(Message::input("late")).await.unwrap();

        let log = h.log();
        assert_eq!(log[1], "stdin:1:abc\n");
        assert_eq!(log[2], "terminate:1");
        assert_eq!(log.len(), 3);
        assert_eq!(h.session.live_process(), None);
    }

    #[tokio::test]
    async fn exit_of_replaced_process_keeps_current_one() {
        let mut h = harness().await;
        h.session.handle(Message::run("first")).await.unwrap();
        h.session.handle(Message::run("second")).await.unwrap();
        h.drain();

        h.session
            .on_process_event(ProcessEvent::Exited {
                process: ProcessId::new(1),
                code: ABNORMAL_EXIT_CODE,
            })
            .await
            .unwrap();
        assert_eq!(h.session.live_process(), Some(ProcessId::new(2)));

        h.session
            .on_process_event(ProcessEvent::Output {
                process: ProcessId::new(2),
                data: "hi\n".into(),
            })
            .await
            .unwrap();
        h.session
            .on_process_event(ProcessEvent::Exited {
                process: ProcessId::new(2),
                code: 0,
            })
            .await
            .unwrap();
        assert_eq!(h.session.live_process(), None);
        assert_eq!(
            h.drain(),
            vec![
                Message::exit(ABNORMAL_EXIT_CODE),
                Message::output("hi\n"),
                Message::exit(0),
            ]
        );
    }

    #[tokio::test]
    async fn spawn_failure_reports_output_then_exit() {
        let mut h = harness_with(RecordingLauncher {
            fail: true,
            ..Default::default()
        })
        .await;
        h.drain();
        h.session.handle(Message::run("broken")).await.unwrap();

        let messages = h.drain();
        assert_eq!(messages.len(), 2);
        match &messages[0] {
            Message::Output { data } => assert!(data.contains("broken"), "{data:?}"),
            other => panic!("expected output, got {other:?}"),
        }
        assert_eq!(messages[1], Message::exit(ABNORMAL_EXIT_CODE));
        assert_eq!(h.session.live_process(), None);
    }

    #[tokio::test]
    async fn agent_bound_messages_from_client_are_ignored() {
        let mut h = harness().await;
        h.drain();
        h.session.handle(Message::exit(3)).await.unwrap();
        h.session.handle(Message::cwd("/etc")).await.unwrap();
        assert!(h.drain().is_empty());

        h.session.handle(Message::run("pwd")).await.unwrap();
        assert_eq!(h.drain(), vec![Message::output("\r\n/srv/app\r\n")]);
    }

    #[tokio::test]
    async fn dropping_session_terminates_live_process() {
        let mut h = harness().await;
        h.session.handle(Message::run("sleep 30")).await.unwrap();
        let log = Arc::clone(&h.log);
        drop(h);
        assert_eq!(log.lock().unwrap().last().unwrap(), "terminate:1");
    }

    #[tokio::test]
    async fn closed_transport_ends_session() {
        let mut h = harness().await;
        h.outbound.close();
        assert_eq!(
            h.session.handle(Message::run("pwd")).await,
            Err(SessionClosed)
        );
    }
}
