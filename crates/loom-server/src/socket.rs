use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use loom_core::protocol::{ClientFrame, ServerFrame};
use loom_core::{ErrorKind, SessionId};
use loom_engine::{CancelOutcome, SubmitRequest};

use crate::connection::Connection;
use crate::server::AppState;

/// Drive one WebSocket link: announce the session, then run the writer
/// (frames + pings) and the reader (client frames) until either side ends.
pub async fn handle_ws_connection(socket: WebSocket, session_id: SessionId, state: AppState) {
    let (conn, mut frames) = state.hub.attach(&session_id);
    let (mut ws_tx, mut ws_rx) = socket.split();

    let connected = match state.coordinator.snapshot(&session_id) {
        Ok(snapshot) => ServerFrame::Connected {
            session_id: session_id.clone(),
            connection_id: conn.id.clone(),
            state: snapshot.state,
            last_seq: snapshot.last_seq,
            queue_length: snapshot.queue_length,
            last_user_prompt_id: snapshot.last_user_prompt_id,
        },
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "snapshot failed, refusing connection");
            let frame = ServerFrame::error(e.kind().code(), e.to_string());
            let _ = ws_tx.send(WsMessage::Text(frame.to_json().into())).await;
            state.hub.detach(&conn.id);
            return;
        }
    };
    if ws_tx.send(WsMessage::Text(connected.to_json().into())).await.is_err() {
        state.hub.detach(&conn.id);
        return;
    }
    info!(connection_id = %conn.id, session_id = %session_id, "WebSocket client connected");

    let ping_interval = state.config.ping_interval;
    let max_missed = state.config.max_missed_pings;

    let writer_conn = Arc::clone(&conn);
    let writer = tokio::spawn(async move {
        let shutdown = writer_conn.shutdown_token();
        let mut ping = tokio::time::interval(ping_interval);
        ping.tick().await;

        loop {
            tokio::select! {
                biased;
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        if ws_tx.send(WsMessage::Text(frame.to_json().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
                _ = ping.tick() => {
                    let missed = writer_conn.record_missed_ping();
                    if missed > max_missed {
                        warn!(connection_id = %writer_conn.id, missed, "keepalive lost, dropping connection");
                        break;
                    }
                    if ws_tx.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        writer_conn.close();
    });

    let reader_conn = Arc::clone(&conn);
    let reader_state = state.clone();
    let reader = tokio::spawn(async move {
        let shutdown = reader_conn.shutdown_token();
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = ws_rx.next() => msg,
            };
            match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    reader_conn.touch();
                    if let Some(reply) = handle_client_text(&reader_state, &reader_conn, text.as_str()) {
                        if reader_conn.send_frame(reply).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => reader_conn.touch(),
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection_id = %reader_conn.id, error = %e, "WebSocket read error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    state.hub.detach(&conn.id);
}

/// Parse and dispatch one client frame. Returns the direct reply, if any.
pub(crate) fn handle_client_text(state: &AppState, conn: &Connection, text: &str) -> Option<ServerFrame> {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => handle_client_frame(state, conn, frame),
        Err(e) => {
            debug!(connection_id = %conn.id, error = %e, "malformed client frame");
            Some(ServerFrame::error(
                ErrorKind::Invalid.code(),
                format!("malformed frame: {e}"),
            ))
        }
    }
}

fn handle_client_frame(state: &AppState, conn: &Connection, frame: ClientFrame) -> Option<ServerFrame> {
    match frame {
        ClientFrame::Subscribe {
            since_seq,
            last_activity_ms,
        } => {
            debug!(connection_id = %conn.id, since_seq, "subscribe");
            state
                .hub
                .subscribe(&conn.id, since_seq, last_activity_ms)
                .err()
                .map(|e| ServerFrame::error(e.kind().code(), e.to_string()))
        }
        ClientFrame::Submit { prompt_id, text } => {
            let request = SubmitRequest::new(text)
                .with_prompt_id(prompt_id.clone())
                .with_origin(conn.id.clone());
            Some(match state.coordinator.submit(&conn.session_id, request) {
                Ok(outcome) => ServerFrame::Accepted {
                    prompt_id: outcome.prompt_id,
                    disposition: outcome.disposition,
                },
                Err(e) => {
                    debug!(connection_id = %conn.id, prompt_id = %prompt_id, error = %e, "submit rejected");
                    ServerFrame::prompt_error(prompt_id, e.kind().code(), e.to_string())
                }
            })
        }
        ClientFrame::Cancel { session_id } => {
            if session_id.as_ref().is_some_and(|s| s != &conn.session_id) {
                return Some(ServerFrame::error(
                    ErrorKind::Invalid.code(),
                    "cancel targets a different session than this connection",
                ));
            }
            Some(match state.coordinator.cancel(&conn.session_id) {
                Ok(outcome) => ServerFrame::CancelResult {
                    cancelled: outcome == CancelOutcome::Cancelled,
                },
                Err(e) => ServerFrame::error(e.kind().code(), e.to_string()),
            })
        }
        ClientFrame::Keepalive {
            client_time_ms,
            last_seen_seq,
        } => Some(match state.coordinator.snapshot(&conn.session_id) {
            Ok(snapshot) => {
                if last_seen_seq < snapshot.last_seq {
                    debug!(connection_id = %conn.id, last_seen_seq, server_max_seq = snapshot.last_seq, "client behind");
                }
                ServerFrame::KeepaliveAck {
                    client_time_ms,
                    server_time_ms: chrono::Utc::now().timestamp_millis(),
                    server_max_seq: snapshot.last_seq,
                    state: snapshot.state,
                    queue_length: snapshot.queue_length,
                }
            }
            Err(e) => ServerFrame::error(e.kind().code(), e.to_string()),
        }),
    }
}
