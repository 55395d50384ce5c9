use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use loom_core::Event;

use crate::hub::SyncHub;

/// Forwards every appended event from the coordinator's broadcast into the
/// hub. When the bridge itself falls behind, every connection re-reads from
/// its cursor so nothing skipped here is lost downstream.
pub fn create_bridge(hub: Arc<SyncHub>, mut rx: broadcast::Receiver<Event>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    hub.publish(&event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event bridge lagged, resyncing connections from log");
                    hub.resync_all();
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("event bridge channel closed");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::HubConfig;
    use loom_core::protocol::ServerFrame;
    use loom_core::{NewEvent, PromptId};
    use loom_store::{Database, EventLog, SessionRepo};
    use std::time::Duration;

    #[tokio::test]
    async fn bridge_forwards_to_session_connections() {
        let db = Database::in_memory().unwrap();
        let session = SessionRepo::new(db.clone()).create("/w", None).unwrap().id;
        let log = EventLog::new(db);
        let hub = Arc::new(SyncHub::new(log.clone(), HubConfig::default()));
        let (tx, rx) = broadcast::channel(16);
        let handle = create_bridge(hub.clone(), rx);

        let (conn, mut frames) = hub.attach(&session);
        hub.subscribe(&conn.id, 0, None).unwrap();
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), frames.recv()).await.unwrap().unwrap();
            if matches!(frame, ServerFrame::Live { .. }) {
                break;
            }
        }

        let event = log.append(&session, NewEvent::chunk(PromptId::new(), "hello")).unwrap();
        tx.send(event).unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), frames.recv()).await.unwrap().unwrap();
        match frame {
            ServerFrame::Event { event } => assert_eq!(event.body.text(), "hello"),
            other => panic!("expected event frame, got {other:?}"),
        }
        handle.abort();
    }
}
