//! One live client link and the pump task that feeds it.
//!
//! The pump owns the connection's read cursor. It is the only writer of
//! `event` frames for the connection, so catch-up output and live pushes can
//! never interleave out of order: live events that arrive while a backlog is
//! being streamed wait in the outbound queue and are filtered against the
//! cursor afterwards.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use loom_core::protocol::ServerFrame;
use loom_core::{ConnectionId, ConnectionMode, Event, SessionId};
use loom_store::{EventLog, ReadOrder, StoreError};

use crate::error::HubError;

#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Reconnects idle for longer than this replay the whole log.
    pub staleness: Duration,
    /// Outbound events buffered per connection before it is marked lagged.
    pub max_send_queue: usize,
    pub catch_up_page: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            staleness: Duration::from_secs(3600),
            max_send_queue: 256,
            catch_up_page: 500,
        }
    }
}

pub(crate) enum Control {
    Subscribe {
        since_seq: u64,
        last_activity: Option<DateTime<Utc>>,
    },
    Close {
        reason: String,
        done: oneshot::Sender<()>,
    },
}

pub struct Connection {
    pub id: ConnectionId,
    pub session_id: SessionId,
    pub connected_at: DateTime<Utc>,
    mode: Mutex<ConnectionMode>,
    last_seen_seq: AtomicU64,
    last_activity: Mutex<DateTime<Utc>>,
    missed_pings: AtomicU32,
    lagged: AtomicBool,
    wake: Notify,
    events: mpsc::Sender<Event>,
    control: mpsc::UnboundedSender<Control>,
    frames: mpsc::Sender<ServerFrame>,
    shutdown: CancellationToken,
}

pub(crate) struct PumpChannels {
    pub events: mpsc::Receiver<Event>,
    pub control: mpsc::UnboundedReceiver<Control>,
}

impl Connection {
    pub(crate) fn new(
        session_id: SessionId,
        queue_size: usize,
    ) -> (Self, PumpChannels, mpsc::Receiver<ServerFrame>) {
        let queue_size = queue_size.max(1);
        let (events_tx, events_rx) = mpsc::channel(queue_size);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::channel(queue_size);
        let now = Utc::now();
        let conn = Self {
            id: ConnectionId::new(),
            session_id,
            connected_at: now,
            mode: Mutex::new(ConnectionMode::Connecting),
            last_seen_seq: AtomicU64::new(0),
            last_activity: Mutex::new(now),
            missed_pings: AtomicU32::new(0),
            lagged: AtomicBool::new(false),
            wake: Notify::new(),
            events: events_tx,
            control: control_tx,
            frames: frames_tx,
            shutdown: CancellationToken::new(),
        };
        let channels = PumpChannels {
            events: events_rx,
            control: control_rx,
        };
        (conn, channels, frames_rx)
    }

    pub fn mode(&self) -> ConnectionMode {
        *self.mode.lock()
    }

    fn set_mode(&self, mode: ConnectionMode) {
        *self.mode.lock() = mode;
    }

    /// Highest seq delivered to this connection.
    pub fn last_seen_seq(&self) -> u64 {
        self.last_seen_seq.load(Ordering::Acquire)
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    /// Record inbound traffic. Any frame from the client counts as liveness.
    pub fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
        self.missed_pings.store(0, Ordering::Relaxed);
    }

    /// Count one unanswered ping; returns the running total.
    pub fn record_missed_ping(&self) -> u32 {
        self.missed_pings.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn missed_pings(&self) -> u32 {
        self.missed_pings.load(Ordering::Relaxed)
    }

    pub fn is_lagged(&self) -> bool {
        self.lagged.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancelled when the connection should be torn down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn close(&self) {
        self.set_mode(ConnectionMode::Closed);
        self.shutdown.cancel();
    }

    /// Queue a reply frame (accepted, keepalive_ack, error) for the writer.
    pub async fn send_frame(&self, frame: ServerFrame) -> Result<(), HubError> {
        self.frames
            .send(frame)
            .await
            .map_err(|_| HubError::ConnectionClosed(self.id.clone()))
    }

    pub(crate) fn request(&self, control: Control) -> Result<(), HubError> {
        self.control
            .send(control)
            .map_err(|_| HubError::ConnectionClosed(self.id.clone()))
    }

    /// Hand a freshly appended event to the pump without waiting. A full queue
    /// marks the connection lagged; the pump then re-reads from the log.
    pub(crate) fn offer(&self, event: &Event) -> bool {
        match self.events.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                if !self.lagged.swap(true, Ordering::AcqRel) {
                    warn!(
                        connection_id = %self.id,
                        session_id = %self.session_id,
                        seq = event.seq,
                        "outbound queue full, connection lagged"
                    );
                }
                self.wake.notify_one();
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub(crate) fn mark_lagged(&self) {
        self.lagged.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}

/// Why the pump stopped early.
enum PumpExit {
    /// Writer side is gone.
    Disconnected,
    /// The session's log is no longer readable.
    Store(StoreError),
}

struct Pump {
    conn: std::sync::Arc<Connection>,
    log: EventLog,
    config: HubConfig,
}

pub(crate) async fn run_pump(
    conn: std::sync::Arc<Connection>,
    log: EventLog,
    config: HubConfig,
    mut channels: PumpChannels,
) {
    let pump = Pump { conn, log, config };
    let conn = pump.conn.clone();
    let shutdown = conn.shutdown_token();

    let exit = loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break None,
            control = channels.control.recv() => match control {
                Some(Control::Subscribe { since_seq, last_activity }) => {
                    if let Err(e) = pump.catch_up(since_seq, last_activity).await {
                        break Some(e);
                    }
                }
                Some(Control::Close { reason, done }) => {
                    pump.close(&reason).await;
                    conn.close();
                    let _ = done.send(());
                    break None;
                }
                None => break None,
            },
            _ = conn.wake.notified() => {
                if conn.lagged.swap(false, Ordering::AcqRel) && conn.mode() == ConnectionMode::Live {
                    debug!(connection_id = %conn.id, "recovering lagged connection from log");
                    if let Err(e) = pump.flush_from_log().await {
                        break Some(e);
                    }
                }
            }
            event = channels.events.recv() => match event {
                Some(event) => {
                    if let Err(e) = pump.deliver_live(event).await {
                        break Some(e);
                    }
                }
                None => break None,
            },
        }
    };

    match exit {
        Some(PumpExit::Store(e)) => {
            warn!(connection_id = %conn.id, error = %e, "event log unreadable, closing connection");
            let _ = conn.frames.try_send(ServerFrame::error(e.kind().code(), e.to_string()));
        }
        Some(PumpExit::Disconnected) => debug!(connection_id = %conn.id, "writer gone"),
        None => {}
    }
    conn.close();
}

impl Pump {
    async fn send(&self, frame: ServerFrame) -> Result<(), PumpExit> {
        self.conn
            .frames
            .send(frame)
            .await
            .map_err(|_| PumpExit::Disconnected)
    }

    async fn send_event(&self, event: Event) -> Result<(), PumpExit> {
        let seq = event.seq;
        self.send(ServerFrame::Event { event }).await?;
        self.conn.last_seen_seq.store(seq, Ordering::Release);
        Ok(())
    }

    async fn catch_up(&self, since_seq: u64, last_activity: Option<DateTime<Utc>>) -> Result<(), PumpExit> {
        let conn = &self.conn;
        let head = self
            .log
            .last_seq(&conn.session_id)
            .map_err(PumpExit::Store)?;
        let reference = last_activity.unwrap_or_else(|| conn.last_activity());
        let idle = (Utc::now() - reference).to_std().unwrap_or_default();
        let stale = since_seq > 0 && idle > self.config.staleness;
        // A cursor beyond the head belongs to some other history.
        let ahead = since_seq > head;
        let full_resync = stale || ahead;
        let effective = if full_resync { 0 } else { since_seq };

        if full_resync {
            info!(
                connection_id = %conn.id,
                since_seq,
                head,
                idle_secs = idle.as_secs(),
                "forcing full resync"
            );
        }

        conn.set_mode(ConnectionMode::Syncing);
        conn.last_seen_seq.store(effective, Ordering::Release);
        self.send(ServerFrame::SyncStarted {
            since_seq: effective,
            full_resync,
        })
        .await?;

        let delivered = self.flush_from_log().await?;
        conn.set_mode(ConnectionMode::Live);
        let last_seq = conn.last_seen_seq();
        self.send(ServerFrame::Live { last_seq }).await?;
        debug!(connection_id = %conn.id, delivered, last_seq, "connection live");
        Ok(())
    }

    /// Stream everything after the cursor, page by page, until the log is exhausted.
    async fn flush_from_log(&self) -> Result<usize, PumpExit> {
        let page = self.config.catch_up_page.max(1);
        let mut delivered = 0;
        loop {
            let events = self
                .log
                .read(
                    &self.conn.session_id,
                    Some(self.conn.last_seen_seq()),
                    Some(page),
                    ReadOrder::Asc,
                )
                .map_err(PumpExit::Store)?;
            let n = events.len();
            for event in events {
                self.send_event(event).await?;
            }
            delivered += n;
            if n < page as usize {
                return Ok(delivered);
            }
        }
    }

    async fn deliver_live(&self, event: Event) -> Result<(), PumpExit> {
        if self.conn.mode() != ConnectionMode::Live {
            // Not subscribed yet; catch-up will read it from the log.
            return Ok(());
        }
        let cursor = self.conn.last_seen_seq();
        if event.seq <= cursor {
            return Ok(());
        }
        if event.seq == cursor + 1 {
            return self.send_event(event).await;
        }
        debug!(connection_id = %self.conn.id, cursor, seq = event.seq, "gap in live stream, reading log");
        self.flush_from_log().await.map(|_| ())
    }

    async fn close(&self, reason: &str) {
        if self.conn.mode() == ConnectionMode::Live {
            // Deliver whatever was appended while closing, e.g. failed queued prompts.
            if let Err(PumpExit::Store(e)) = self.flush_from_log().await {
                debug!(connection_id = %self.conn.id, error = %e, "final flush skipped");
            }
        }
        let _ = self
            .send(ServerFrame::SessionClosed {
                reason: reason.to_string(),
            })
            .await;
        info!(connection_id = %self.conn.id, reason, "session closed for connection");
    }
}

/// Unix millis to a timestamp; out-of-range values are ignored.
pub(crate) fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}
