//! WebSocket session lifecycle: one connected peer from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::client::{ClientSession, SessionRegistry};
use crate::handler::ConnectionHandler;

/// How long the writer may spend flushing queued replies once the reader is
/// done.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Heartbeat settings for one session.
#[derive(Clone, Copy, Debug)]
pub struct Heartbeat {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Run a session until the peer leaves, the heartbeat expires or the server
/// shuts down.
///
/// Frames are handled one at a time in arrival order. A writer task drains
/// the session's outbound queue and sends Ping frames. When the reader stops,
/// the writer flushes what is already queued and sends a Close frame. On exit
/// the observer reconciles the session's users and the session is
/// unregistered.
#[instrument(skip_all, fields(session_key = %session.key()))]
pub async fn run_ws_session(
    ws: WebSocket,
    session: Arc<ClientSession>,
    mut outbound_rx: mpsc::Receiver<String>,
    handler: ConnectionHandler,
    sessions: Arc<SessionRegistry>,
    heartbeat: Heartbeat,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    // Cancelled when the reader stops or the server shuts down.
    let reader_done = shutdown.child_token();
    let writer_session = Arc::clone(&session);
    let writer_done = reader_done.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat.interval);
        // Skip the immediate first tick
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if !writer_session.check_alive()
                        && writer_session.last_seen_elapsed() > heartbeat.timeout
                    {
                        warn!("peer unresponsive for {:?}, disconnecting", heartbeat.timeout);
                        break;
                    }
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                () = writer_done.cancelled() => {
                    while let Ok(text) = outbound_rx.try_recv() {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });
    tokio::pin!(writer);
    let mut writer_finished = false;

    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            _ = &mut writer => {
                debug!("writer finished");
                writer_finished = true;
                break;
            }
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text.to_string(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    info!(len = data.len(), "received non-UTF8 binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                session.mark_alive();
                continue;
            }
            Some(Ok(Message::Close(_))) | None => {
                info!("peer closed connection");
                break;
            }
            Some(Err(e)) => {
                sessions.observer().on_failed(&session, &e.to_string());
                warn!(error = %e, "websocket error");
                break;
            }
        };

        session.mark_alive();
        let _ = handler.handle_text(&text);
    }

    if !writer_finished {
        reader_done.cancel();
        if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer).await.is_err() {
            warn!("writer did not flush in time");
            writer.abort();
        }
    }
    sessions.observer().on_disconnected(&session);
    let _ = sessions.on_session_close(session.key());
    info!(
        age_secs = session.age().as_secs(),
        dropped = session.drop_count(),
        "session finished"
    );
}
