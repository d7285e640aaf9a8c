// E2E tests for the WebSocket bridge
//
// Starts the agent on a free port and drives it with real WebSocket clients:
// handshake gating, built-ins, process streaming, replacement and teardown.

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tempfile::TempDir;
use themag_protocol::{decode, encode, Message};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Agent {
    port: u16,
    workdir: TempDir,
    handle: JoinHandle<()>,
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start_agent() -> Agent {
    let workdir = TempDir::new().unwrap();
    let port = find_free_port().await;
    let settings = themag_agentd::Settings {
        listen: ([127, 0, 0, 1], port).into(),
        workdir: Some(workdir.path().to_path_buf()),
        allowed_origins: vec!["https://studio.partner.io".into()],
        ..Default::default()
    };

    let handle = tokio::spawn(async move {
        themag_agentd::run(settings).await.unwrap();
    });
    wait_for_port(port).await;

    Agent {
        port,
        workdir,
        handle,
    }
}

async fn connect(port: u16, origin: Option<&str>) -> Result<Client, tungstenite::Error> {
    let mut request = format!("ws://127.0.0.1:{port}/")
        .into_client_request()
        .unwrap();
    if let Some(origin) = origin {
        request
            .headers_mut()
            .insert("Origin", HeaderValue::from_str(origin).unwrap());
    }
    let (ws, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws)
}

async fn next_message(ws: &mut Client) -> Message {
    loop {
        let frame = timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .expect("websocket error");
        if let WsMessage::Text(text) = frame {
            return decode(&text).unwrap_or_else(|| panic!("undecodable frame {text:?}"));
        }
    }
}

async fn send(ws: &mut Client, message: Message) {
    ws.send(WsMessage::Text(encode(&message).unwrap()))
        .await
        .unwrap();
}

/// Collects messages until an `exit` arrives; returns concatenated output and the code.
async fn until_exit(ws: &mut Client) -> (String, i32) {
    let mut output = String::new();
    loop {
        match next_message(ws).await {
            Message::Output { data } => output.push_str(&data),
            Message::Exit { code } => return (output, code),
            other => panic!("unexpected message {other:?}"),
        }
    }
}

#[tokio::test]
async fn e2e_ready_then_echo() {
    let agent = start_agent().await;
    let mut ws = connect(agent.port, Some("http://localhost:5173"))
        .await
        .unwrap();

    let cwd = agent.workdir.path().display().to_string();
    assert_eq!(next_message(&mut ws).await, Message::ready(cwd));

    send(&mut ws, Message::run("echo hello")).await;
    let (output, code) = until_exit(&mut ws).await;
    assert!(output.contains("hello"), "output was {output:?}");
    assert_eq!(code, 0);
}

#[tokio::test]
async fn e2e_foreign_origin_is_rejected_before_ready() {
    let agent = start_agent().await;

    for origin in [Some("http://evil.example"), Some("https://themag.dev.evil.example"), None] {
        match connect(agent.port, origin).await {
            Err(tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), 403, "{origin:?}");
            }
            Err(other) => panic!("unexpected handshake error for {origin:?}: {other}"),
            Ok(_) => panic!("handshake accepted for {origin:?}"),
        }
    }
}

#[tokio::test]
async fn e2e_allow_list_and_primary_domain_are_accepted() {
    let agent = start_agent().await;
    for origin in [
        "https://studio.partner.io",
        "https://app.themag.dev",
        "http://preview.themag.dev:8080",
    ] {
        let mut ws = connect(agent.port, Some(origin)).await.unwrap();
        assert!(matches!(next_message(&mut ws).await, Message::Ready { .. }));
    }
}

#[cfg(unix)]
#[tokio::test]
async fn e2e_cd_emits_cwd_without_spawning() {
    let agent = start_agent().await;
    let mut ws = connect(agent.port, Some("http://127.0.0.1:3000"))
        .await
        .unwrap();
    next_message(&mut ws).await;

    send(&mut ws, Message::run("cd /tmp")).await;
    assert_eq!(next_message(&mut ws).await, Message::cwd("/tmp"));

    send(&mut ws, Message::run("pwd")).await;
    assert_eq!(next_message(&mut ws).await, Message::output("\r\n/tmp\r\n"));

    send(&mut ws, Message::run("cd ..")).await;
    assert_eq!(next_message(&mut ws).await, Message::cwd("/"));
    send(&mut ws, Message::run("cd ..")).await;
    assert_eq!(next_message(&mut ws).await, Message::cwd("/"));
}

#[tokio::test]
async fn e2e_malformed_frames_are_ignored() {
    let agent = start_agent().await;
    let mut ws = connect(agent.port, Some("http://localhost")).await.unwrap();
    next_message(&mut ws).await;

    ws.send(WsMessage::Text("{not json".into())).await.unwrap();
    ws.send(WsMessage::Text(r#"{"type":"launch"}"#.into()))
        .await
        .unwrap();
    ws.send(WsMessage::Text(r#"{"type":"exit","code":0}"#.into()))
        .await
        .unwrap();
    send(&mut ws, Message::run("clear")).await;

    assert_eq!(next_message(&mut ws).await, Message::output(""));
}

#[cfg(unix)]
#[tokio::test]
async fn e2e_input_reaches_stdin() {
    let agent = start_agent().await;
    let mut ws = connect(agent.port, Some("http://localhost")).await.unwrap();
    next_message(&mut ws).await;

    send(&mut ws, Message::run("head -n 1")).await;
    send(&mut ws, Message::input("typed over the socket\n")).await;
    let (output, code) = until_exit(&mut ws).await;
    assert_eq!(output.trim(), "typed over the socket");
    assert_eq!(code, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn e2e_kill_reports_exit() {
    let agent = start_agent().await;
    let mut ws = connect(agent.port, Some("http://localhost")).await.unwrap();
    next_message(&mut ws).await;

    send(&mut ws, Message::run("sleep 30")).await;
    sleep(Duration::from_millis(100)).await;
    send(&mut ws, Message::Kill).await;
    let (_, code) = until_exit(&mut ws).await;
    assert_eq!(code, -1);
}

#[cfg(unix)]
#[tokio::test]
async fn e2e_new_run_replaces_live_process() {
    let agent = start_agent().await;
    let mut ws = connect(agent.port, Some("http://localhost")).await.unwrap();
    next_message(&mut ws).await;

    send(&mut ws, Message::run("sleep 30")).await;
    sleep(Duration::from_millis(100)).await;
    send(&mut ws, Message::run("echo second")).await;

    let mut output = String::new();
    let mut exits = Vec::new();
    while exits.len() < 2 {
        match next_message(&mut ws).await {
            Message::Output { data } => output.push_str(&data),
            Message::Exit { code } => exits.push(code),
            other => panic!("unexpected message {other:?}"),
        }
    }
    exits.sort();
    assert_eq!(exits, vec![-1, 0]);
    assert!(output.contains("second"));
}

#[cfg(unix)]
#[tokio::test]
async fn e2e_disconnect_terminates_process() {
    let agent = start_agent().await;
    let mut ws = connect(agent.port, Some("http://localhost")).await.unwrap();
    next_message(&mut ws).await;

    send(&mut ws, Message::run("echo $$; exec sleep 30")).await;
    let pid = match next_message(&mut ws).await {
        Message::Output { data } => data.trim().to_string(),
        other => panic!("expected pid output, got {other:?}"),
    };
    assert!(process_alive(&pid), "process {pid} should be running");

    ws.close(None).await.unwrap();
    drop(ws);

    for _ in 0..100 {
        if !process_alive(&pid) {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("process {pid} survived its connection");
}

#[cfg(unix)]
#[tokio::test]
async fn e2e_unread_input_does_not_delay_kill() {
    let agent = start_agent().await;
    let mut ws = connect(agent.port, Some("http://localhost")).await.unwrap();
    next_message(&mut ws).await;

    send(&mut ws, Message::run("sleep 30")).await;
    sleep(Duration::from_millis(100)).await;
    send(&mut ws, Message::input("x".repeat(1024 * 1024))).await;
    send(&mut ws, Message::Kill).await;

    let (_, code) = timeout(Duration::from_secs(3), until_exit(&mut ws))
        .await
        .expect("kill must not wait for the process to read its input");
    assert_eq!(code, -1);
}

#[cfg(unix)]
#[tokio::test]
async fn e2e_unread_input_does_not_delay_disconnect() {
    let agent = start_agent().await;
    let mut ws = connect(agent.port, Some("http://localhost")).await.unwrap();
    next_message(&mut ws).await;

    send(&mut ws, Message::run("echo $$; exec sleep 30")).await;
    let pid = first_output_line(&mut ws).await;
    send(&mut ws, Message::input("x".repeat(1024 * 1024))).await;
    ws.close(None).await.unwrap();
    drop(ws);

    assert!(
        wait_until_gone(&pid).await,
        "process {pid} survived its connection"
    );
}

#[cfg(unix)]
#[tokio::test]
async fn e2e_disconnect_terminates_children_of_the_shell() {
    let agent = start_agent().await;
    let mut ws = connect(agent.port, Some("http://localhost")).await.unwrap();
    next_message(&mut ws).await;

    send(&mut ws, Message::run("echo $$; sleep 25; echo done")).await;
    let shell = first_output_line(&mut ws).await;
    let child = child_of(&shell).await;

    ws.close(None).await.unwrap();
    drop(ws);

    assert!(wait_until_gone(&shell).await, "shell {shell} survived");
    assert!(wait_until_gone(&child).await, "child {child} outlived its shell");
}

#[cfg(unix)]
async fn first_output_line(ws: &mut Client) -> String {
    match next_message(ws).await {
        Message::Output { data } => data.trim().to_string(),
        other => panic!("expected output, got {other:?}"),
    }
}

#[cfg(unix)]
async fn child_of(parent: &str) -> String {
    for _ in 0..100 {
        let out = std::process::Command::new("pgrep")
            .args(["-P", parent])
            .output()
            .expect("pgrep");
        if let Some(pid) = String::from_utf8_lossy(&out.stdout).split_whitespace().next() {
            return pid.to_string();
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("process {parent} never started a child");
}

#[cfg(unix)]
async fn wait_until_gone(pid: &str) -> bool {
    for _ in 0..100 {
        if !process_alive(pid) {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Unreaped zombies count as dead.
#[cfg(unix)]
fn process_alive(pid: &str) -> bool {
    std::process::Command::new("ps")
        .args(["-o", "stat=", "-p", pid])
        .output()
        .map(|out| {
            let stat = String::from_utf8_lossy(&out.stdout);
            let stat = stat.trim();
            !stat.is_empty() && !stat.starts_with('Z')
        })
        .unwrap_or(false)
}

#[tokio::test]
async fn e2e_healthz_without_origin() {
    let agent = start_agent().await;
    let mut stream = TcpStream::connect(("127.0.0.1", agent.port)).await.unwrap();
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    stream
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("\"status\":\"ok\""));
}

async fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

async fn wait_for_port(port: u16) {
    let mut attempts = 0;
    loop {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(stream) => {
                drop(stream);
                break;
            }
            Err(_) if attempts < 50 => {
                attempts += 1;
                sleep(Duration::from_millis(50)).await;
            }
            Err(err) => {
                panic!("agentd did not start listening on port {}: {}", port, err);
            }
        }
    }
}
