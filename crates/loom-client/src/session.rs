//! Reconnecting session link.
//!
//! [`SessionClient::spawn`] runs one task per session that keeps a WebSocket
//! open, resubscribes from the last sequence it has seen after every drop,
//! drops duplicate events, and settles pending prompts as their `user_prompt`
//! events arrive on whichever connection carries them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use loom_core::protocol::{ClientFrame, ServerFrame};
use loom_core::{ConnectionId, Event, PromptId, SessionId, SubmitDisposition, TurnState};
use loom_settings::ClientSettings;

use crate::backoff::ReconnectBackoff;
use crate::error::{ClientError, Result};
use crate::pending::{PendingSendReconciler, Resolution};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const COMMAND_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 1024;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// `http://host:port` of the server.
    pub server_url: String,
    pub session_id: SessionId,
    /// Creates the session on first connect when set.
    pub workspace: Option<String>,
    pub keepalive_interval: Duration,
    pub max_missed_keepalives: u32,
    pub pending_timeout: Duration,
    /// How often inflight prompts are checked against `pending_timeout`.
    pub pending_check_interval: Duration,
    pub backoff: ReconnectBackoff,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, session_id: SessionId) -> Self {
        Self::from_settings(server_url, session_id, &ClientSettings::default())
    }

    pub fn from_settings(server_url: impl Into<String>, session_id: SessionId, settings: &ClientSettings) -> Self {
        Self {
            server_url: server_url.into(),
            session_id,
            workspace: None,
            keepalive_interval: Duration::from_secs(settings.keepalive_interval_secs),
            max_missed_keepalives: settings.max_missed_keepalives,
            pending_timeout: Duration::from_secs(settings.pending_timeout_secs),
            pending_check_interval: Duration::from_secs(1),
            backoff: ReconnectBackoff::from_settings(settings),
        }
    }

    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn ws_url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        let mut url = format!("{base}/api/sessions/{}/ws", self.session_id);
        if let Some(workspace) = &self.workspace {
            url.push_str("?workspace=");
            url.push_str(&encode_query(workspace));
        }
        url
    }
}

fn encode_query(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// What the session loop reports upward.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    Connected {
        connection_id: ConnectionId,
        state: TurnState,
        last_seq: u64,
        queue_length: usize,
    },
    SyncStarted {
        since_seq: u64,
        full_resync: bool,
    },
    /// Events arrive in `seq` order without repeats. A full resync restarts
    /// the stream at seq 1.
    Event(Event),
    Live {
        last_seq: u64,
    },
    Accepted {
        prompt_id: PromptId,
        disposition: SubmitDisposition,
    },
    CancelResult {
        cancelled: bool,
    },
    PromptConfirmed {
        prompt_id: PromptId,
        text: String,
    },
    PromptFailed {
        prompt_id: PromptId,
        text: String,
        reason: String,
    },
    Error {
        code: String,
        message: String,
    },
    Disconnected {
        reason: String,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    SessionClosed {
        reason: String,
    },
}

impl From<Resolution> for ClientEvent {
    fn from(r: Resolution) -> Self {
        match r {
            Resolution::Confirmed(p) => Self::PromptConfirmed {
                prompt_id: p.prompt_id,
                text: p.text,
            },
            Resolution::Failed { prompt, reason } => Self::PromptFailed {
                prompt_id: prompt.prompt_id,
                text: prompt.text,
                reason,
            },
        }
    }
}

#[derive(Debug)]
enum Command {
    Submit { prompt_id: PromptId, text: String },
    Cancel,
}

/// Cursor shared between the link task and the handle.
#[derive(Default)]
struct Cursor {
    last_seq: AtomicU64,
    last_activity: Mutex<Option<DateTime<Utc>>>,
}

impl Cursor {
    fn last_seq(&self) -> u64 {
        self.last_seq.load(Ordering::Acquire)
    }

    fn advance(&self, seq: u64) {
        self.last_seq.store(seq, Ordering::Release);
        *self.last_activity.lock() = Some(Utc::now());
    }

    fn reset(&self) {
        self.last_seq.store(0, Ordering::Release);
    }

    fn last_activity_ms(&self) -> Option<i64> {
        self.last_activity.lock().map(|t| t.timestamp_millis())
    }
}

/// Handle to a running session loop.
pub struct SessionHandle {
    session_id: SessionId,
    commands: mpsc::Sender<Command>,
    reconciler: Arc<PendingSendReconciler>,
    cursor: Arc<Cursor>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Record the prompt as pending, then hand it to the link. While the link
    /// is down the prompt waits locally and goes out after reconnect.
    pub async fn submit(&self, text: impl Into<String>) -> Result<PromptId> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(ClientError::Protocol("prompt text is empty".into()));
        }
        let pending = self.reconciler.begin(&self.session_id, text.clone())?;
        let prompt_id = pending.prompt_id.clone();
        self.commands
            .send(Command::Submit {
                prompt_id: prompt_id.clone(),
                text,
            })
            .await
            .map_err(|_| ClientError::Closed)?;
        Ok(prompt_id)
    }

    pub async fn cancel(&self) -> Result<()> {
        self.commands.send(Command::Cancel).await.map_err(|_| ClientError::Closed)
    }

    pub fn reconciler(&self) -> &Arc<PendingSendReconciler> {
        &self.reconciler
    }

    pub fn last_seq(&self) -> u64 {
        self.cursor.last_seq()
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

pub struct SessionClient;

impl SessionClient {
    /// Start the link and pending-timeout tasks for one session.
    pub fn spawn(
        config: ClientConfig,
        reconciler: Arc<PendingSendReconciler>,
    ) -> (SessionHandle, mpsc::Receiver<ClientEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let cursor = Arc::new(Cursor::default());
        let shutdown = CancellationToken::new();

        let watchdog = tokio::spawn(run_pending_watchdog(
            Arc::clone(&reconciler),
            config.pending_check_interval,
            event_tx.clone(),
            shutdown.clone(),
        ));
        let link = tokio::spawn(
            LinkLoop {
                config: config.clone(),
                reconciler: Arc::clone(&reconciler),
                cursor: Arc::clone(&cursor),
                backoff: config.backoff.clone(),
                events: event_tx,
                shutdown: shutdown.clone(),
            }
            .run(cmd_rx),
        );

        let handle = SessionHandle {
            session_id: config.session_id,
            commands: cmd_tx,
            reconciler,
            cursor,
            shutdown,
            tasks: vec![link, watchdog],
        };
        (handle, event_rx)
    }
}

async fn run_pending_watchdog(
    reconciler: Arc<PendingSendReconciler>,
    interval: Duration,
    events: mpsc::Sender<ClientEvent>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                for resolution in reconciler.expire(Utc::now()) {
                    if events.send(resolution.into()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Why one link ended.
enum LinkEnd {
    Lost(String),
    SessionClosed,
    Shutdown,
}

struct LinkLoop {
    config: ClientConfig,
    reconciler: Arc<PendingSendReconciler>,
    cursor: Arc<Cursor>,
    /// Restarts from the first attempt only once a link reaches LIVE.
    backoff: ReconnectBackoff,
    events: mpsc::Sender<ClientEvent>,
    shutdown: CancellationToken,
}

impl LinkLoop {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let url = self.config.ws_url();
        loop {
            let connect = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                r = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url.as_str())) => r,
            };
            match connect {
                Ok(Ok((ws, _))) => {
                    match self.drive(ws, &mut commands).await {
                        LinkEnd::Shutdown => return,
                        LinkEnd::SessionClosed => {
                            info!(session_id = %self.config.session_id, "session closed by server");
                            return;
                        }
                        LinkEnd::Lost(reason) => {
                            info!(session_id = %self.config.session_id, reason = %reason, "link lost");
                            self.emit(ClientEvent::Disconnected { reason }).await;
                        }
                    }
                }
                Ok(Err(e)) => {
                    let e = ClientError::from(e);
                    if !e.is_retryable() {
                        warn!(session_id = %self.config.session_id, error = %e, "connect rejected");
                        self.emit(ClientEvent::Error {
                            code: e.kind().code().to_string(),
                            message: e.to_string(),
                        })
                        .await;
                        return;
                    }
                    debug!(error = %e, "connect failed");
                }
                Err(_) => debug!("connect timed out"),
            }

            let delay = self.backoff.next_delay();
            self.emit(ClientEvent::Reconnecting {
                attempt: self.backoff.attempt(),
                delay,
            })
            .await;
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn drive(&mut self, ws: WsStream, commands: &mut mpsc::Receiver<Command>) -> LinkEnd {
        let (mut tx, mut rx) = ws.split();

        // The server speaks first.
        let connection_id = match tokio::time::timeout(CONNECT_TIMEOUT, rx.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ServerFrame>(text.as_str()) {
                Ok(ServerFrame::Connected {
                    connection_id,
                    state,
                    last_seq,
                    queue_length,
                    last_user_prompt_id,
                    ..
                }) => {
                    self.emit(ClientEvent::Connected {
                        connection_id: connection_id.clone(),
                        state,
                        last_seq,
                        queue_length,
                    })
                    .await;
                    if let Some(r) = self.reconciler.observe_connected(last_user_prompt_id.as_ref()) {
                        self.emit(r.into()).await;
                    }
                    connection_id
                }
                Ok(ServerFrame::Error { code, message, .. }) => {
                    self.emit(ClientEvent::Error { code, message }).await;
                    return LinkEnd::SessionClosed;
                }
                other => return LinkEnd::Lost(format!("unexpected greeting: {other:?}")),
            },
            Ok(Some(Ok(other))) => return LinkEnd::Lost(format!("unexpected greeting: {other:?}")),
            Ok(Some(Err(e))) => return LinkEnd::Lost(e.to_string()),
            Ok(None) => return LinkEnd::Lost("closed during handshake".into()),
            Err(_) => return LinkEnd::Lost("no greeting from server".into()),
        };
        info!(session_id = %self.config.session_id, connection_id = %connection_id, since_seq = self.cursor.last_seq(), "link up");

        if let Err(e) = send_frame(&mut tx, &self.subscribe_frame()).await {
            return LinkEnd::Lost(e.to_string());
        }

        let mut live = false;
        let mut missed = 0u32;
        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        keepalive.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    let _ = tx.send(Message::Close(None)).await;
                    return LinkEnd::Shutdown;
                }
                msg = rx.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => return LinkEnd::Lost("closed by server".into()),
                        Some(Ok(_)) => {
                            missed = 0;
                            continue;
                        }
                        Some(Err(e)) => return LinkEnd::Lost(e.to_string()),
                    };
                    missed = 0;
                    let frame = match serde_json::from_str::<ServerFrame>(text.as_str()) {
                        Ok(f) => f,
                        Err(e) => {
                            warn!(error = %e, "unreadable server frame");
                            continue;
                        }
                    };
                    match self.on_frame(frame, &mut live).await {
                        FrameAction::Continue => {}
                        FrameAction::Resubscribe => {
                            live = false;
                            if let Err(e) = send_frame(&mut tx, &self.subscribe_frame()).await {
                                return LinkEnd::Lost(e.to_string());
                            }
                        }
                        FrameAction::Closed => return LinkEnd::SessionClosed,
                    }
                }
                cmd = commands.recv() => {
                    let frame = match cmd {
                        Some(Command::Submit { prompt_id, text }) => {
                            if !self.reconciler.is_pending(&prompt_id) {
                                // Already settled (or expired) while waiting to be sent.
                                continue;
                            }
                            ClientFrame::Submit { prompt_id, text }
                        }
                        Some(Command::Cancel) => ClientFrame::Cancel {
                            session_id: Some(self.config.session_id.clone()),
                        },
                        None => return LinkEnd::Shutdown,
                    };
                    if let Err(e) = send_frame(&mut tx, &frame).await {
                        return LinkEnd::Lost(e.to_string());
                    }
                }
                _ = keepalive.tick() => {
                    missed += 1;
                    if missed > self.config.max_missed_keepalives {
                        return LinkEnd::Lost("keepalive timeout".into());
                    }
                    let frame = ClientFrame::Keepalive {
                        client_time_ms: Utc::now().timestamp_millis(),
                        last_seen_seq: self.cursor.last_seq(),
                    };
                    if let Err(e) = send_frame(&mut tx, &frame).await {
                        return LinkEnd::Lost(e.to_string());
                    }
                }
            }
        }
    }

    async fn on_frame(&mut self, frame: ServerFrame, live: &mut bool) -> FrameAction {
        match frame {
            ServerFrame::SyncStarted { since_seq, full_resync } => {
                if full_resync {
                    self.cursor.reset();
                }
                self.emit(ClientEvent::SyncStarted { since_seq, full_resync }).await;
            }
            ServerFrame::Event { event } => {
                let last = self.cursor.last_seq();
                if event.seq <= last {
                    debug!(seq = event.seq, last_seq = last, "duplicate event dropped");
                    return FrameAction::Continue;
                }
                if event.seq > last + 1 {
                    warn!(seq = event.seq, last_seq = last, "gap in event stream, resubscribing");
                    return FrameAction::Resubscribe;
                }
                self.cursor.advance(event.seq);
                let resolution = self.reconciler.observe(&event);
                self.emit(ClientEvent::Event(event)).await;
                if let Some(r) = resolution {
                    self.emit(r.into()).await;
                }
            }
            ServerFrame::Live { last_seq } => {
                *live = true;
                self.backoff.reset();
                self.emit(ClientEvent::Live { last_seq }).await;
            }
            ServerFrame::Accepted { prompt_id, disposition } => {
                if disposition == SubmitDisposition::Queued {
                    self.reconciler.mark_queued(&prompt_id);
                }
                self.emit(ClientEvent::Accepted { prompt_id, disposition }).await;
            }
            ServerFrame::CancelResult { cancelled } => {
                self.emit(ClientEvent::CancelResult { cancelled }).await;
            }
            ServerFrame::KeepaliveAck { server_max_seq, .. } => {
                if *live && server_max_seq > self.cursor.last_seq() {
                    debug!(server_max_seq, last_seq = self.cursor.last_seq(), "behind server, resubscribing");
                    return FrameAction::Resubscribe;
                }
            }
            ServerFrame::Error {
                code,
                message,
                prompt_id: Some(prompt_id),
            } => match self.reconciler.fail(&prompt_id, &message) {
                Some(r) => self.emit(r.into()).await,
                None => self.emit(ClientEvent::Error { code, message }).await,
            },
            ServerFrame::Error { code, message, .. } => {
                self.emit(ClientEvent::Error { code, message }).await;
            }
            ServerFrame::SessionClosed { reason } => {
                self.emit(ClientEvent::SessionClosed { reason }).await;
                return FrameAction::Closed;
            }
            ServerFrame::Connected { .. } => {}
        }
        FrameAction::Continue
    }

    fn subscribe_frame(&self) -> ClientFrame {
        ClientFrame::Subscribe {
            since_seq: self.cursor.last_seq(),
            last_activity_ms: self.cursor.last_activity_ms(),
        }
    }

    async fn emit(&self, event: ClientEvent) {
        // A dropped receiver only means nobody is watching.
        let _ = self.events.send(event).await;
    }
}

enum FrameAction {
    Continue,
    Resubscribe,
    Closed,
}

async fn send_frame(
    tx: &mut futures::stream::SplitSink<WsStream, Message>,
    frame: &ClientFrame,
) -> std::result::Result<(), tokio_tungstenite::tungstenite::Error> {
    tx.send(Message::text(frame.to_json())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_from_http_base() {
        let config = ClientConfig::new("http://127.0.0.1:7411/", SessionId::from_raw("sess_a"));
        assert_eq!(config.ws_url(), "ws://127.0.0.1:7411/api/sessions/sess_a/ws");

        let config = ClientConfig::new("https://loom.example", SessionId::from_raw("sess_b"))
            .with_workspace("/home/me/my project");
        assert_eq!(
            config.ws_url(),
            "wss://loom.example/api/sessions/sess_b/ws?workspace=/home/me/my%20project"
        );
    }

    #[test]
    fn settings_feed_config() {
        let settings = ClientSettings {
            pending_timeout_secs: 5,
            max_missed_keepalives: 7,
            ..ClientSettings::default()
        };
        let config = ClientConfig::from_settings("http://x", SessionId::from_raw("s"), &settings);
        assert_eq!(config.pending_timeout, Duration::from_secs(5));
        assert_eq!(config.max_missed_keepalives, 7);
    }

    #[test]
    fn resolution_maps_to_client_event() {
        let prompt = crate::pending::PendingPrompt {
            prompt_id: PromptId::from_raw("prm_1"),
            session_id: SessionId::from_raw("s"),
            text: "t".into(),
            status: crate::pending::PendingStatus::Failed,
            submitted_at: Utc::now(),
        };
        let event: ClientEvent = Resolution::Failed {
            prompt,
            reason: "gone".into(),
        }
        .into();
        assert_eq!(
            event,
            ClientEvent::PromptFailed {
                prompt_id: PromptId::from_raw("prm_1"),
                text: "t".into(),
                reason: "gone".into(),
            }
        );
    }
}
