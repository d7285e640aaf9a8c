use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use themag_protocol::{decode, encode, Message};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

pub const DEFAULT_AGENT_URL: &str = "ws://localhost:4477";
pub const DEFAULT_ORIGIN: &str = "http://localhost";

const OUTBOUND_CAPACITY: usize = 64;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Disconnected => "disconnected",
            AgentStatus::Connecting => "connecting",
            AgentStatus::Connected => "connected",
            AgentStatus::Error => "error",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("local agent not connected")]
    NotConnected,
    #[error("invalid agent address '{url}': {reason}")]
    InvalidAddress { url: String, reason: String },
    #[error("agent refused the connection (HTTP {0})")]
    Rejected(u16),
    #[error("local agent connection error: {0}")]
    Transport(String),
    #[error("connection attempt was cancelled")]
    Cancelled,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<tungstenite::Error> for ClientError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => ClientError::Rejected(response.status().as_u16()),
            other => ClientError::Transport(other.to_string()),
        }
    }
}

type OutputObserver = Box<dyn Fn(&str) + Send + Sync>;
type CwdObserver = Box<dyn Fn(&str) + Send + Sync>;
type StatusObserver = Box<dyn Fn(AgentStatus) + Send + Sync>;

#[derive(Default)]
struct Observers {
    output: Mutex<Vec<OutputObserver>>,
    cwd: Mutex<Vec<CwdObserver>>,
    status: Mutex<Vec<StatusObserver>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Connection {
    outbound: mpsc::Sender<String>,
    reader: JoinHandle<()>,
}

struct ClientState {
    status: AgentStatus,
    /// Bumped by every connect and disconnect; stale tasks compare against it.
    generation: u64,
    connection: Option<Connection>,
    pending: Option<oneshot::Sender<()>>,
}

struct Inner {
    state: Mutex<ClientState>,
    observers: Observers,
}

/// Caller-side session with a local agent.
///
/// One instance per terminal surface. Observers are registered on the
/// instance and only ever see traffic of that instance's connection.
#[derive(Clone)]
pub struct AgentClient {
    inner: Arc<Inner>,
}

impl Default for AgentClient {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentClient {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ClientState {
                    status: AgentStatus::Disconnected,
                    generation: 0,
                    connection: None,
                    pending: None,
                }),
                observers: Observers::default(),
            }),
        }
    }

    /// Receives process output, exit notices and frames that could not be decoded.
    pub fn on_output(&self, observer: impl Fn(&str) + Send + Sync + 'static) {
        lock(&self.inner.observers.output).push(Box::new(observer));
    }

    /// Receives the session directory from `ready` and `cwd` messages.
    pub fn on_cwd(&self, observer: impl Fn(&str) + Send + Sync + 'static) {
        lock(&self.inner.observers.cwd).push(Box::new(observer));
    }

    pub fn on_status(&self, observer: impl Fn(AgentStatus) + Send + Sync + 'static) {
        lock(&self.inner.observers.status).push(Box::new(observer));
    }

    pub fn status(&self) -> AgentStatus {
        lock(&self.inner.state).status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == AgentStatus::Connected
    }

    /// Opens the transport, announcing `origin` in the handshake.
    ///
    /// Resolves once the socket is open. Succeeds immediately when already
    /// connected. A `disconnect` issued while this is pending makes it fail
    /// with [`ClientError::Cancelled`].
    pub async fn connect(&self, url: &str, origin: &str) -> Result<(), ClientError> {
        let (generation, cancelled) = {
            let mut state = lock(&self.inner.state);
            if state.status == AgentStatus::Connected && state.connection.is_some() {
                return Ok(());
            }
            if let Some(pending) = state.pending.take() {
                let _ = pending.send(());
            }
            if let Some(connection) = state.connection.take() {
                connection.reader.abort();
            }
            state.generation += 1;
            let (cancel_tx, cancel_rx) = oneshot::channel();
            state.pending = Some(cancel_tx);
            state.status = AgentStatus::Connecting;
            (state.generation, cancel_rx)
        };
        self.inner.emit_status(AgentStatus::Connecting);

        let request = match build_request(url, origin) {
            Ok(request) => request,
            Err(err) => {
                self.inner.fail(generation);
                return Err(err);
            }
        };

        let socket = tokio::select! {
            result = tokio_tungstenite::connect_async(request) => match result {
                Ok((socket, _)) => socket,
                Err(err) => {
                    let err = ClientError::from(err);
                    warn!(url, %err, "agent connection failed");
                    self.inner.fail(generation);
                    return Err(err);
                }
            },
            _ = cancelled => return Err(ClientError::Cancelled),
        };

        let (sink, stream) = socket.split();
        {
            let mut state = lock(&self.inner.state);
            if state.generation != generation {
                return Err(ClientError::Cancelled);
            }
            let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
            tokio::spawn(write_loop(sink, outbound_rx));
            let reader = tokio::spawn(read_loop(Arc::clone(&self.inner), generation, stream));
            state.connection = Some(Connection {
                outbound: outbound_tx,
                reader,
            });
            state.pending = None;
            state.status = AgentStatus::Connected;
        }
        info!(url, origin, "connected to local agent");
        self.inner.emit_status(AgentStatus::Connected);
        Ok(())
    }

    /// Closes the transport, cancelling a pending connect. Always ends `disconnected`.
    pub fn disconnect(&self) {
        {
            let mut state = lock(&self.inner.state);
            state.generation += 1;
            if let Some(pending) = state.pending.take() {
                let _ = pending.send(());
            }
            if let Some(connection) = state.connection.take() {
                // Dropping the sender lets the writer send a close frame.
                connection.reader.abort();
            }
            state.status = AgentStatus::Disconnected;
        }
        self.inner.emit_status(AgentStatus::Disconnected);
    }

    pub async fn run_command(&self, command: &str) -> Result<(), ClientError> {
        self.send(Message::run(command)).await
    }

    pub async fn write_input(&self, data: &str) -> Result<(), ClientError> {
        self.send(Message::input(data)).await
    }

    pub async fn kill(&self) -> Result<(), ClientError> {
        self.send(Message::Kill).await
    }

    async fn send(&self, message: Message) -> Result<(), ClientError> {
        let outbound = {
            let state = lock(&self.inner.state);
            match (&state.status, &state.connection) {
                (AgentStatus::Connected, Some(connection)) => connection.outbound.clone(),
                _ => return Err(ClientError::NotConnected),
            }
        };
        let frame = encode(&message)?;
        outbound
            .send(frame)
            .await
            .map_err(|_| ClientError::NotConnected)
    }
}

impl Inner {
    fn emit_status(&self, status: AgentStatus) {
        debug!(%status, "agent status changed");
        for observer in lock(&self.observers.status).iter() {
            observer(status);
        }
    }

    fn emit_output(&self, data: &str) {
        for observer in lock(&self.observers.output).iter() {
            observer(data);
        }
    }

    fn emit_cwd(&self, cwd: &str) {
        for observer in lock(&self.observers.cwd).iter() {
            observer(cwd);
        }
    }

    /// Marks a failed connect, unless a newer attempt or a disconnect superseded it.
    fn fail(&self, generation: u64) {
        let current = {
            let mut state = lock(&self.state);
            if state.generation != generation {
                false
            } else {
                state.pending = None;
                state.status = AgentStatus::Error;
                true
            }
        };
        if current {
            self.emit_status(AgentStatus::Error);
        }
    }

    fn connection_lost(&self, generation: u64, status: AgentStatus) {
        let current = {
            let mut state = lock(&self.state);
            if state.generation != generation || state.connection.is_none() {
                false
            } else {
                state.connection = None;
                state.status = status;
                true
            }
        };
        if current {
            self.emit_status(status);
        }
    }

    fn dispatch(&self, frame: &str) {
        match decode(frame) {
            Some(Message::Output { data }) => self.emit_output(&data),
            Some(Message::Exit { code }) => {
                self.emit_output(&format!("\r\n[process exited {code}]\r\n"))
            }
            Some(Message::Ready { cwd }) | Some(Message::Cwd { cwd }) => {
                if !cwd.is_empty() {
                    self.emit_cwd(&cwd);
                }
            }
            Some(other) => debug!(kind = other.kind(), "ignoring agent-bound message from agent"),
            None => self.emit_output(frame),
        }
    }
}

fn build_request(
    url: &str,
    origin: &str,
) -> Result<tungstenite::handshake::client::Request, ClientError> {
    let invalid = |reason: String| ClientError::InvalidAddress {
        url: url.to_string(),
        reason,
    };
    let mut request = url
        .into_client_request()
        .map_err(|err| invalid(err.to_string()))?;
    let origin = HeaderValue::from_str(origin).map_err(|err| invalid(err.to_string()))?;
    request.headers_mut().insert("Origin", origin);
    Ok(request)
}

async fn write_loop(mut sink: SplitSink<Socket, WsMessage>, mut outbound: mpsc::Receiver<String>) {
    while let Some(frame) = outbound.recv().await {
        if let Err(err) = sink.send(WsMessage::Text(frame)).await {
            debug!(%err, "agent send failed");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(inner: Arc<Inner>, generation: u64, mut stream: SplitStream<Socket>) {
    let status = loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => inner.dispatch(&text),
            Some(Ok(WsMessage::Binary(bytes))) => inner.dispatch(&String::from_utf8_lossy(&bytes)),
            Some(Ok(WsMessage::Close(_))) | None => break AgentStatus::Disconnected,
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                warn!(%err, "agent connection error");
                break AgentStatus::Error;
            }
        }
    };
    inner.connection_lost(generation, status);
}
