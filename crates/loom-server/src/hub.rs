use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use loom_core::protocol::ServerFrame;
use loom_core::{ConnectionId, Event, SessionId};
use loom_store::EventLog;

use crate::connection::{from_millis, run_pump, Connection, Control, HubConfig};
use crate::error::HubError;

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Fans appended events out to every connection on a session and runs
/// catch-up for connections that (re)subscribe.
pub struct SyncHub {
    log: EventLog,
    config: HubConfig,
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl SyncHub {
    pub fn new(log: EventLog, config: HubConfig) -> Self {
        Self {
            log,
            config,
            connections: DashMap::new(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Register a connection and start its pump. The returned receiver yields
    /// every frame destined for the client, in send order.
    pub fn attach(&self, session_id: &SessionId) -> (Arc<Connection>, mpsc::Receiver<ServerFrame>) {
        let (conn, channels, frames) = Connection::new(session_id.clone(), self.config.max_send_queue);
        let conn = Arc::new(conn);
        self.connections.insert(conn.id.clone(), conn.clone());
        tokio::spawn(run_pump(conn.clone(), self.log.clone(), self.config.clone(), channels));
        info!(connection_id = %conn.id, session_id = %session_id, "connection attached");
        (conn, frames)
    }

    pub fn detach(&self, connection_id: &ConnectionId) {
        if let Some((_, conn)) = self.connections.remove(connection_id) {
            conn.close();
            let lifetime = chrono::Utc::now() - conn.connected_at;
            info!(
                connection_id = %connection_id,
                session_id = %conn.session_id,
                last_seen_seq = conn.last_seen_seq(),
                lifetime_secs = lifetime.num_seconds(),
                "connection detached"
            );
        }
    }

    pub fn detach_all(&self) {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            self.detach(id);
        }
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(connection_id).map(|c| c.value().clone())
    }

    /// Start catch-up from `since_seq`. `last_activity_ms` is the client's own
    /// record of when it last saw the session, used for the staleness check.
    pub fn subscribe(
        &self,
        connection_id: &ConnectionId,
        since_seq: u64,
        last_activity_ms: Option<i64>,
    ) -> Result<(), HubError> {
        let conn = self
            .get(connection_id)
            .ok_or_else(|| HubError::UnknownConnection(connection_id.clone()))?;
        conn.request(Control::Subscribe {
            since_seq,
            last_activity: last_activity_ms.and_then(from_millis),
        })
    }

    /// Push an appended event to every connection on its session. Never waits.
    pub fn publish(&self, event: &Event) -> usize {
        let mut offered = 0;
        for entry in self.connections.iter() {
            let conn = entry.value();
            if conn.session_id != event.session_id || conn.is_closed() {
                continue;
            }
            if conn.offer(event) {
                offered += 1;
            }
        }
        debug!(session_id = %event.session_id, seq = event.seq, offered, "event published");
        offered
    }

    /// Send `session_closed` to every connection on the session after flushing
    /// pending events, then tear them down. Returns the number closed.
    pub async fn close_session(&self, session_id: &SessionId, reason: &str) -> usize {
        let conns = self.session_connections(session_id);
        let mut waits = Vec::with_capacity(conns.len());
        for conn in &conns {
            let (done_tx, done_rx) = oneshot::channel();
            let control = Control::Close {
                reason: reason.to_string(),
                done: done_tx,
            };
            if conn.request(control).is_ok() {
                waits.push(done_rx);
            }
        }
        for done in waits {
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, done).await.is_err() {
                warn!(session_id = %session_id, "connection did not flush before close");
            }
        }
        for conn in &conns {
            self.detach(&conn.id);
        }
        info!(session_id = %session_id, closed = conns.len(), reason, "session connections closed");
        conns.len()
    }

    /// Make every live connection re-read from its cursor. Used when the
    /// upstream event feed itself lagged and events may have been skipped.
    pub fn resync_all(&self) {
        for entry in self.connections.iter() {
            entry.value().mark_lagged();
        }
    }

    pub fn session_connections(&self, session_id: &SessionId) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|e| &e.value().session_id == session_id)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Drop connections whose pump has stopped or that missed too many pings.
    pub fn reap_dead(&self, max_missed_pings: u32) -> usize {
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|e| e.value().is_closed() || e.value().missed_pings() >= max_missed_pings)
            .map(|e| e.key().clone())
            .collect();
        for id in &dead {
            self.detach(id);
        }
        dead.len()
    }
}

/// Periodically reap dead connections.
pub fn start_reaper(hub: Arc<SyncHub>, interval: Duration, max_missed_pings: u32) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = hub.reap_dead(max_missed_pings);
            if removed > 0 {
                info!(removed, "reaped dead connections");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::{ConnectionMode, NewEvent, PromptId};
    use loom_store::{Database, SessionRepo};

    fn setup() -> (Arc<SyncHub>, EventLog, SessionId) {
        let (hub, log, session, _) = setup_with_db();
        (hub, log, session)
    }

    fn setup_with_db() -> (Arc<SyncHub>, EventLog, SessionId, Database) {
        let db = Database::in_memory().unwrap();
        let session = SessionRepo::new(db.clone()).create("/w", None).unwrap().id;
        let log = EventLog::new(db.clone());
        (Arc::new(SyncHub::new(log.clone(), HubConfig::default())), log, session, db)
    }

    async fn next(frames: &mut mpsc::Receiver<ServerFrame>) -> ServerFrame {
        tokio::time::timeout(Duration::from_secs(5), frames.recv())
            .await
            .expect("frame timeout")
            .expect("frames closed")
    }

    async fn wait_live(frames: &mut mpsc::Receiver<ServerFrame>) {
        while !matches!(next(frames).await, ServerFrame::Live { .. }) {}
    }

    async fn next_seq(frames: &mut mpsc::Receiver<ServerFrame>) -> u64 {
        loop {
            if let ServerFrame::Event { event } = next(frames).await {
                return event.seq;
            }
        }
    }

    #[tokio::test]
    async fn publish_reaches_every_connection_on_session() {
        let (hub, log, session, db) = setup_with_db();
        let other = SessionRepo::new(db).create("/x", None).unwrap().id;

        let (a, mut fa) = hub.attach(&session);
        let (b, mut fb) = hub.attach(&session);
        let (c, mut fc) = hub.attach(&other);
        for conn in [&a, &b, &c] {
            hub.subscribe(&conn.id, 0, None).unwrap();
        }
        wait_live(&mut fa).await;
        wait_live(&mut fb).await;
        wait_live(&mut fc).await;

        let event = log.append(&session, NewEvent::chunk(PromptId::new(), "hi")).unwrap();
        assert_eq!(hub.publish(&event), 2);
        assert_eq!(next_seq(&mut fa).await, 1);
        assert_eq!(next_seq(&mut fb).await, 1);
        let none = tokio::time::timeout(Duration::from_millis(100), fc.recv()).await;
        assert!(none.is_err());
    }

    #[tokio::test]
    async fn reconnect_sees_every_missed_event_once() {
        let (hub, log, session) = setup();
        for i in 0..3 {
            let e = log.append(&session, NewEvent::chunk(PromptId::new(), format!("{i}"))).unwrap();
            hub.publish(&e);
        }

        let (first, mut frames) = hub.attach(&session);
        hub.subscribe(&first.id, 0, None).unwrap();
        wait_live(&mut frames).await;
        let seen = first.last_seen_seq();
        hub.detach(&first.id);

        for i in 3..6 {
            let e = log.append(&session, NewEvent::chunk(PromptId::new(), format!("{i}"))).unwrap();
            hub.publish(&e);
        }

        let (second, mut frames) = hub.attach(&session);
        assert_ne!(first.id, second.id);
        hub.subscribe(&second.id, seen, Some(chrono::Utc::now().timestamp_millis())).unwrap();
        let mut seqs = Vec::new();
        loop {
            match next(&mut frames).await {
                ServerFrame::Event { event } => seqs.push(event.seq),
                ServerFrame::Live { last_seq } => {
                    assert_eq!(last_seq, 6);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(seqs, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn full_resync_twice_is_identical() {
        let (hub, log, session) = setup();
        for i in 0..4 {
            log.append(&session, NewEvent::chunk(PromptId::new(), format!("{i}"))).unwrap();
        }
        let (conn, mut frames) = hub.attach(&session);
        let mut runs = Vec::new();
        for _ in 0..2 {
            hub.subscribe(&conn.id, 0, None).unwrap();
            let mut events = Vec::new();
            loop {
                match next(&mut frames).await {
                    ServerFrame::Event { event } => events.push(event),
                    ServerFrame::Live { .. } => break,
                    _ => {}
                }
            }
            runs.push(events);
        }
        assert_eq!(runs[0], runs[1]);
        assert_eq!(runs[0].len(), 4);
    }

    #[tokio::test]
    async fn subscribe_unknown_connection_fails() {
        let (hub, _, _) = setup();
        let err = hub.subscribe(&ConnectionId::new(), 0, None).unwrap_err();
        assert!(matches!(err, HubError::UnknownConnection(_)));
    }

    #[tokio::test]
    async fn close_session_notifies_and_detaches() {
        let (hub, _, session) = setup();
        let (conn, mut frames) = hub.attach(&session);
        hub.subscribe(&conn.id, 0, None).unwrap();
        wait_live(&mut frames).await;

        let closer = {
            let hub = hub.clone();
            let session = session.clone();
            tokio::spawn(async move { hub.close_session(&session, "deleted").await })
        };
        assert!(matches!(next(&mut frames).await, ServerFrame::SessionClosed { .. }));
        assert_eq!(closer.await.unwrap(), 1);
        assert_eq!(hub.count(), 0);
        assert_eq!(conn.mode(), ConnectionMode::Closed);
    }

    #[tokio::test]
    async fn reap_removes_silent_connections() {
        let (hub, _, session) = setup();
        let (conn, _frames) = hub.attach(&session);
        let (_ok, _frames2) = hub.attach(&session);
        for _ in 0..3 {
            conn.record_missed_ping();
        }
        assert_eq!(hub.reap_dead(3), 1);
        assert_eq!(hub.count(), 1);
        assert!(conn.is_closed());
    }
}
