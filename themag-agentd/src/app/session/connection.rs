use super::service::{Session, SessionContext};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use themag_protocol::{decode_from, encode, Direction, Message};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const OUTBOUND_CAPACITY: usize = 256;
const PROCESS_EVENT_CAPACITY: usize = 256;

/// Drives one authorized connection until either side goes away.
///
/// The session lives on this task's stack, so returning from here drops it
/// and terminates whatever process it still owns.
pub async fn serve_socket(socket: WebSocket, ctx: SessionContext) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
    let (events_tx, mut events_rx) = mpsc::channel(PROCESS_EVENT_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let frame = match encode(&message) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("failed to encode {} message: {err}", message.kind());
                    continue;
                }
            };
            if let Err(err) = sink.send(WsMessage::Text(frame)).await {
                debug!("WebSocket send failed: {err}");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = match Session::open(&ctx, outbound_tx, events_tx).await {
        Ok(session) => session,
        Err(_) => {
            writer.abort();
            return;
        }
    };

    loop {
        tokio::select! {
            frame = stream.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => {
                        debug!(session = %session.id(), "WebSocket receive error: {err}");
                        break;
                    }
                    None => break,
                };
                let text = match frame {
                    WsMessage::Text(text) => text,
                    WsMessage::Binary(bytes) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!(session = %session.id(), "dropping non UTF-8 binary frame");
                            continue;
                        }
                    },
                    WsMessage::Close(_) => break,
                    WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                };
                let Some(message) = decode_from(&text, Direction::ClientToAgent) else {
                    continue;
                };
                if session.handle(message).await.is_err() {
                    break;
                }
            }
            Some(event) = events_rx.recv() => {
                if session.on_process_event(event).await.is_err() {
                    break;
                }
            }
        }
    }

    drop(session);
    writer.abort();
}
