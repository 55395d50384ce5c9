//! Session link tests against a real server.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use loom_client::{
    ClientConfig, ClientEvent, HistoryCursor, PendingLedger, PendingSendReconciler, ReconnectBackoff, RestClient,
    SessionClient,
};
use loom_core::{SessionId, SubmitDisposition};
use loom_engine::backends::Gate;
use loom_engine::{ScriptedBackend, ScriptedTurn};
use loom_server::{start, ServerConfig, ServerHandle};
use loom_store::Database;

const TIMEOUT: Duration = Duration::from_secs(10);

async fn boot(backend: Arc<ScriptedBackend>) -> (ServerHandle, String) {
    let config = ServerConfig {
        port: 0,
        ..ServerConfig::default()
    };
    let handle = start(config, Database::in_memory().unwrap(), backend).await.unwrap();
    let url = format!("http://127.0.0.1:{}", handle.port());
    (handle, url)
}

fn client_config(url: &str, session: &str) -> ClientConfig {
    let mut config = ClientConfig::new(url, SessionId::from_raw(session)).with_workspace("/tmp/work");
    config.backoff = ReconnectBackoff::new(Duration::from_millis(50), Duration::from_millis(200), 0.0);
    config.pending_check_interval = Duration::from_millis(50);
    config
}

fn reconciler(timeout: Duration) -> Arc<PendingSendReconciler> {
    Arc::new(PendingSendReconciler::new(PendingLedger::in_memory(), timeout))
}

/// Collect client events until `stop` matches, returning everything seen.
async fn until(rx: &mut mpsc::Receiver<ClientEvent>, stop: impl Fn(&ClientEvent) -> bool) -> Vec<ClientEvent> {
    let mut seen = Vec::new();
    timeout(TIMEOUT, async {
        loop {
            let event = rx.recv().await.expect("client event channel closed");
            let done = stop(&event);
            seen.push(event);
            if done {
                return;
            }
        }
    })
    .await
    .expect("expected client event never arrived");
    seen
}

fn event_seqs(events: &[ClientEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            ClientEvent::Event(ev) => Some(ev.seq),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn submit_is_confirmed_by_user_prompt() {
    let (server, url) = boot(Arc::new(ScriptedBackend::echo())).await;
    let (handle, mut rx) = SessionClient::spawn(client_config(&url, "sess_link"), reconciler(TIMEOUT));
    until(&mut rx, |e| matches!(e, ClientEvent::Live { .. })).await;

    let prompt_id = handle.submit("hello").await.unwrap();
    let seen = until(&mut rx, |e| matches!(e, ClientEvent::Event(ev) if ev.kind() == loom_core::EventKind::AgentComplete)).await;

    assert!(seen.iter().any(|e| matches!(
        e,
        ClientEvent::PromptConfirmed { prompt_id: id, text } if id == &prompt_id && text == "hello"
    )));
    assert_eq!(event_seqs(&seen), vec![1, 2, 3]);
    assert!(handle.reconciler().ledger().is_empty());
    assert!(handle.reconciler().staged_text().is_none());
    assert_eq!(handle.last_seq(), 3);

    handle.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn pending_prompt_confirms_on_new_connection() {
    let gate = Gate::new();
    let backend = Arc::new(ScriptedBackend::new(vec![ScriptedTurn::gated(&["working"], &gate)]));
    let (server, url) = boot(backend).await;

    let (handle, mut rx) = SessionClient::spawn(client_config(&url, "sess_move"), reconciler(TIMEOUT));
    let first = until(&mut rx, |e| matches!(e, ClientEvent::Live { .. })).await;
    let first_conn = first
        .iter()
        .find_map(|e| match e {
            ClientEvent::Connected { connection_id, .. } => Some(connection_id.clone()),
            _ => None,
        })
        .unwrap();

    let rest = RestClient::new(&url);
    let session = SessionId::from_raw("sess_move");
    let started = rest.enqueue(&session, "keep busy", None).await.unwrap();
    assert_eq!(started.disposition, SubmitDisposition::Started);

    let prompt_id = handle.submit("second").await.unwrap();
    until(&mut rx, |e| {
        matches!(e, ClientEvent::Accepted { prompt_id: id, disposition: SubmitDisposition::Queued } if id == &prompt_id)
    })
    .await;

    // Drop every link server-side; the client comes back under a new identity.
    server.state().hub.detach_all();
    let reconnect = until(&mut rx, |e| matches!(e, ClientEvent::Live { .. })).await;
    let second_conn = reconnect
        .iter()
        .find_map(|e| match e {
            ClientEvent::Connected { connection_id, .. } => Some(connection_id.clone()),
            _ => None,
        })
        .unwrap();
    assert_ne!(first_conn, second_conn);
    assert!(handle.reconciler().is_pending(&prompt_id));

    gate.open();
    let rest_of_run = until(&mut rx, |e| matches!(e, ClientEvent::PromptConfirmed { prompt_id: id, .. } if id == &prompt_id)).await;

    let mut seqs = event_seqs(&first);
    seqs.extend(event_seqs(&reconnect));
    seqs.extend(event_seqs(&rest_of_run));
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "events repeated or reordered: {seqs:?}");

    let history = rest.events(&session, HistoryCursor::Start, 100).await.unwrap();
    let confirmed = history
        .iter()
        .find(|e| e.confirms(&prompt_id))
        .expect("user_prompt for the queued prompt");
    assert_eq!(confirmed.origin_connection_id.as_ref(), Some(&first_conn));

    handle.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn unconfirmed_prompt_times_out_and_restores_text() {
    let backend = Arc::new(ScriptedBackend::new(vec![ScriptedTurn::hang(&[])]));
    let (server, url) = boot(backend.clone()).await;

    let (handle, mut rx) = SessionClient::spawn(
        client_config(&url, "sess_slow"),
        reconciler(Duration::from_millis(300)),
    );
    until(&mut rx, |e| matches!(e, ClientEvent::Live { .. })).await;
    RestClient::new(&url)
        .enqueue(&SessionId::from_raw("sess_slow"), "hang", None)
        .await
        .unwrap();

    let prompt_id = handle.submit("retry me").await.unwrap();
    let seen = until(&mut rx, |e| matches!(e, ClientEvent::PromptFailed { .. })).await;
    match seen.last().unwrap() {
        ClientEvent::PromptFailed { prompt_id: id, text, .. } => {
            assert_eq!(id, &prompt_id);
            assert_eq!(text, "retry me");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(handle.reconciler().staged_text().as_deref(), Some("retry me"));
    assert!(handle.reconciler().ledger().is_empty());
    // Only the hanging prompt reached the backend; nothing was re-sent.
    assert_eq!(backend.call_count(), 1);

    handle.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn deleted_session_fails_queued_prompt_and_stops() {
    let gate = Gate::new();
    let backend = Arc::new(ScriptedBackend::new(vec![ScriptedTurn::gated(&[], &gate)]));
    let (server, url) = boot(backend).await;
    let session = SessionId::from_raw("sess_gone");

    let (handle, mut rx) = SessionClient::spawn(client_config(&url, session.as_str()), reconciler(TIMEOUT));
    until(&mut rx, |e| matches!(e, ClientEvent::Live { .. })).await;
    let rest = RestClient::new(&url);
    rest.enqueue(&session, "busy", None).await.unwrap();
    let prompt_id = handle.submit("never runs").await.unwrap();
    until(&mut rx, |e| matches!(e, ClientEvent::Accepted { .. })).await;

    rest.delete_session(&session).await.unwrap();
    let seen = until(&mut rx, |e| matches!(e, ClientEvent::SessionClosed { .. })).await;
    assert!(seen.iter().any(|e| matches!(
        e,
        ClientEvent::PromptFailed { prompt_id: id, text, .. } if id == &prompt_id && text == "never runs"
    )));
    assert!(matches!(
        rest.events(&session, HistoryCursor::Start, 10).await,
        Err(loom_client::ClientError::NotFound(_))
    ));

    handle.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn queued_prompt_outlives_pending_timeout() {
    let gate = Gate::new();
    let backend = Arc::new(ScriptedBackend::new(vec![ScriptedTurn::gated(&["long"], &gate)]));
    let (server, url) = boot(backend.clone()).await;
    let session = SessionId::from_raw("sess_patient");

    let (handle, mut rx) = SessionClient::spawn(
        client_config(&url, session.as_str()),
        reconciler(Duration::from_millis(300)),
    );
    until(&mut rx, |e| matches!(e, ClientEvent::Live { .. })).await;
    RestClient::new(&url).enqueue(&session, "long turn", None).await.unwrap();

    let prompt_id = handle.submit("wait your turn").await.unwrap();
    until(&mut rx, |e| {
        matches!(e, ClientEvent::Accepted { prompt_id: id, disposition: SubmitDisposition::Queued } if id == &prompt_id)
    })
    .await;

    // Several watchdog sweeps past the timeout while the first turn holds the session.
    let mut waited = Vec::new();
    while let Ok(Some(event)) = timeout(Duration::from_millis(900), rx.recv()).await {
        waited.push(event);
    }
    assert!(
        !waited.iter().any(|e| matches!(e, ClientEvent::PromptFailed { .. })),
        "queued prompt failed: {waited:?}"
    );
    assert!(handle.reconciler().is_pending(&prompt_id));
    assert!(handle.reconciler().staged_text().is_none());

    gate.open();
    let seen = until(&mut rx, |e| matches!(e, ClientEvent::PromptConfirmed { prompt_id: id, .. } if id == &prompt_id)).await;
    assert!(!seen.iter().any(|e| matches!(e, ClientEvent::PromptFailed { .. })));
    assert!(handle.reconciler().ledger().is_empty());
    assert_eq!(backend.call_count(), 2);

    handle.shutdown().await;
    server.shutdown().await;
}
