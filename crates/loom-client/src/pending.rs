//! Pending-send reconciliation.
//!
//! A prompt is recorded locally before it is sent. It stays pending until a
//! `user_prompt` event with the same prompt id is observed on any link, an
//! `error` event or frame names it, or the confirmation timeout passes. Once
//! the server reports the prompt queued, the timeout no longer applies: it
//! will start or fail visibly. A failed prompt is never re-sent; its text
//! goes back to the input.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use loom_core::{Event, EventBody, EventKind, PromptId, SessionId};

use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Inflight,
    /// Held in the server's queue behind another turn.
    Queued,
    Confirmed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPrompt {
    pub prompt_id: PromptId,
    pub session_id: SessionId,
    pub text: String,
    pub status: PendingStatus,
    pub submitted_at: DateTime<Utc>,
}

/// Outcome of a pending prompt, handed back to the UI layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Confirmed(PendingPrompt),
    Failed { prompt: PendingPrompt, reason: String },
}

impl Resolution {
    pub fn prompt(&self) -> &PendingPrompt {
        match self {
            Self::Confirmed(p) | Self::Failed { prompt: p, .. } => p,
        }
    }
}

#[derive(Default, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    pending: Vec<PendingPrompt>,
}

const LEDGER_VERSION: u32 = 1;

/// Inflight prompts keyed by prompt id, optionally mirrored to a JSON file so
/// a restarted client still recognises its own prompts.
pub struct PendingLedger {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<PromptId, PendingPrompt>>,
}

impl PendingLedger {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Load the ledger at `path`. A missing or unreadable file starts empty.
    pub fn open(path: &Path) -> Self {
        let entries = load_ledger(path)
            .into_iter()
            .map(|p| (p.prompt_id.clone(), p))
            .collect();
        Self {
            path: Some(path.to_owned()),
            entries: Mutex::new(entries),
        }
    }

    pub fn insert(&self, prompt: PendingPrompt) -> Result<()> {
        let mut entries = self.entries.lock();
        let _ = entries.insert(prompt.prompt_id.clone(), prompt);
        self.persist(&entries)
    }

    /// Drop an entry. A failed file write is logged; the entry is still
    /// returned so its outcome reaches the caller.
    pub fn remove(&self, prompt_id: &PromptId) -> Option<PendingPrompt> {
        let mut entries = self.entries.lock();
        let removed = entries.remove(prompt_id)?;
        if let Err(e) = self.persist(&entries) {
            warn!(prompt_id = %prompt_id, error = %e, "failed to persist pending ledger");
        }
        Some(removed)
    }

    /// Move an entry from `from` to `to`. Returns false when the entry is
    /// missing or in another state.
    pub fn transition(&self, prompt_id: &PromptId, from: PendingStatus, to: PendingStatus) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(prompt_id) {
            Some(entry) if entry.status == from => entry.status = to,
            _ => return false,
        }
        if let Err(e) = self.persist(&entries) {
            warn!(prompt_id = %prompt_id, error = %e, "failed to persist pending ledger");
        }
        true
    }

    pub fn get(&self, prompt_id: &PromptId) -> Option<PendingPrompt> {
        self.entries.lock().get(prompt_id).cloned()
    }

    pub fn list(&self) -> Vec<PendingPrompt> {
        let mut all: Vec<_> = self.entries.lock().values().cloned().collect();
        all.sort_by_key(|p| p.submitted_at);
        all
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn persist(&self, entries: &BTreeMap<PromptId, PendingPrompt>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = LedgerFile {
            version: LEDGER_VERSION,
            pending: entries.values().cloned().collect(),
        };
        let raw = serde_json::to_vec_pretty(&file)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn load_ledger(path: &Path) -> Vec<PendingPrompt> {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read pending ledger");
            return Vec::new();
        }
    };
    match serde_json::from_str::<LedgerFile>(&data) {
        Ok(file) if file.version == LEDGER_VERSION => file.pending,
        Ok(file) => {
            warn!(version = file.version, "unsupported pending ledger version");
            Vec::new()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to parse pending ledger");
            Vec::new()
        }
    }
}

/// Tracks prompts between send and confirmation, plus the input staging
/// area the text came from.
pub struct PendingSendReconciler {
    ledger: PendingLedger,
    timeout: Duration,
    staged: Mutex<Option<String>>,
}

impl PendingSendReconciler {
    pub fn new(ledger: PendingLedger, timeout: Duration) -> Self {
        Self {
            ledger,
            timeout,
            staged: Mutex::new(None),
        }
    }

    pub fn ledger(&self) -> &PendingLedger {
        &self.ledger
    }

    /// Record a prompt before it goes on the wire. The text stays staged until
    /// the prompt is confirmed.
    pub fn begin(&self, session_id: &SessionId, text: impl Into<String>) -> Result<PendingPrompt> {
        let text = text.into();
        let prompt = PendingPrompt {
            prompt_id: PromptId::new(),
            session_id: session_id.clone(),
            text: text.clone(),
            status: PendingStatus::Inflight,
            submitted_at: Utc::now(),
        };
        self.ledger.insert(prompt.clone())?;
        *self.staged.lock() = Some(text);
        debug!(prompt_id = %prompt.prompt_id, "prompt pending");
        Ok(prompt)
    }

    /// Text currently in the input staging area.
    pub fn staged_text(&self) -> Option<String> {
        self.staged.lock().clone()
    }

    pub fn take_staged(&self) -> Option<String> {
        self.staged.lock().take()
    }

    pub fn is_pending(&self, prompt_id: &PromptId) -> bool {
        self.ledger.get(prompt_id).is_some()
    }

    /// Resolve pending prompts against an event from any link.
    pub fn observe(&self, event: &Event) -> Option<Resolution> {
        let prompt_id = event.prompt_id.as_ref()?;
        match (&event.body, event.kind()) {
            (_, EventKind::UserPrompt) => self.confirm(prompt_id),
            (_, EventKind::Queued) => {
                self.mark_queued(prompt_id);
                None
            }
            (EventBody::Error(notice), _) => self.fail(prompt_id, &notice.message),
            _ => None,
        }
    }

    /// A `connected` snapshot names the newest `user_prompt`, which settles a
    /// prompt whose event was appended while the link was down.
    pub fn observe_connected(&self, last_user_prompt_id: Option<&PromptId>) -> Option<Resolution> {
        self.confirm(last_user_prompt_id?)
    }

    /// The server holds the prompt in its queue. It stops counting toward the
    /// confirmation timeout.
    pub fn mark_queued(&self, prompt_id: &PromptId) -> bool {
        let moved = self
            .ledger
            .transition(prompt_id, PendingStatus::Inflight, PendingStatus::Queued);
        if moved {
            debug!(prompt_id = %prompt_id, "prompt queued by server");
        }
        moved
    }

    pub fn confirm(&self, prompt_id: &PromptId) -> Option<Resolution> {
        let mut prompt = self.take(prompt_id)?;
        prompt.status = PendingStatus::Confirmed;
        let mut staged = self.staged.lock();
        if staged.as_deref() == Some(prompt.text.as_str()) {
            *staged = None;
        }
        info!(prompt_id = %prompt_id, "prompt confirmed");
        Some(Resolution::Confirmed(prompt))
    }

    /// Fail a pending prompt and put its text back in the input.
    pub fn fail(&self, prompt_id: &PromptId, reason: &str) -> Option<Resolution> {
        let mut prompt = self.take(prompt_id)?;
        prompt.status = PendingStatus::Failed;
        *self.staged.lock() = Some(prompt.text.clone());
        warn!(prompt_id = %prompt_id, reason, "prompt failed");
        Some(Resolution::Failed {
            prompt,
            reason: reason.to_string(),
        })
    }

    /// Fail every unacknowledged prompt that has waited longer than the timeout.
    pub fn expire(&self, now: DateTime<Utc>) -> Vec<Resolution> {
        let timeout = chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::MAX);
        let overdue: Vec<PromptId> = self
            .ledger
            .list()
            .into_iter()
            .filter(|p| p.status == PendingStatus::Inflight && now - p.submitted_at >= timeout)
            .map(|p| p.prompt_id)
            .collect();
        overdue
            .iter()
            .filter_map(|id| self.fail(id, "no confirmation from server"))
            .collect()
    }

    fn take(&self, prompt_id: &PromptId) -> Option<PendingPrompt> {
        self.ledger.remove(prompt_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::events::{Notice, Queued, UserPrompt};

    fn event(body: EventBody, prompt_id: &PromptId) -> Event {
        Event {
            seq: 1,
            session_id: SessionId::from_raw("sess_a"),
            body,
            prompt_id: Some(prompt_id.clone()),
            origin_connection_id: None,
            ts: Utc::now(),
        }
    }

    fn user_prompt(prompt_id: &PromptId, text: &str) -> Event {
        event(EventBody::UserPrompt(UserPrompt { text: text.into() }), prompt_id)
    }

    fn reconciler(timeout: Duration) -> PendingSendReconciler {
        PendingSendReconciler::new(PendingLedger::in_memory(), timeout)
    }

    #[test]
    fn confirmation_clears_entry_and_staging() {
        let r = reconciler(Duration::from_secs(60));
        let p = r.begin(&SessionId::from_raw("sess_a"), "hello").unwrap();
        assert!(r.is_pending(&p.prompt_id));
        assert_eq!(r.staged_text().as_deref(), Some("hello"));

        let res = r.observe(&user_prompt(&p.prompt_id, "hello")).unwrap();
        assert!(matches!(res, Resolution::Confirmed(ref c) if c.status == PendingStatus::Confirmed));
        assert!(!r.is_pending(&p.prompt_id));
        assert!(r.staged_text().is_none());
        assert!(r.observe(&user_prompt(&p.prompt_id, "hello")).is_none());
    }

    #[test]
    fn unrelated_events_leave_pending_alone() {
        let r = reconciler(Duration::from_secs(60));
        let p = r.begin(&SessionId::from_raw("sess_a"), "x").unwrap();
        assert!(r.observe(&user_prompt(&PromptId::new(), "other")).is_none());
        let chunk = event(
            EventBody::AgentChunk(loom_core::events::AgentChunk { text: "x".into() }),
            &p.prompt_id,
        );
        assert!(r.observe(&chunk).is_none());
        assert!(r.is_pending(&p.prompt_id));
    }

    #[test]
    fn error_event_fails_and_restores_text() {
        let r = reconciler(Duration::from_secs(60));
        let p = r.begin(&SessionId::from_raw("sess_a"), "draft").unwrap();
        r.take_staged();
        let err = event(
            EventBody::Error(Notice {
                code: "prompt_removed".into(),
                message: "removed from queue".into(),
            }),
            &p.prompt_id,
        );
        match r.observe(&err).unwrap() {
            Resolution::Failed { prompt, reason } => {
                assert_eq!(prompt.text, "draft");
                assert_eq!(reason, "removed from queue");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(r.staged_text().as_deref(), Some("draft"));
    }

    #[test]
    fn connected_snapshot_confirms() {
        let r = reconciler(Duration::from_secs(60));
        let p = r.begin(&SessionId::from_raw("sess_a"), "x").unwrap();
        assert!(r.observe_connected(None).is_none());
        assert!(r.observe_connected(Some(&p.prompt_id)).is_some());
        assert!(r.ledger().is_empty());
    }

    #[test]
    fn expire_fails_only_overdue() {
        let r = reconciler(Duration::from_secs(10));
        let p = r.begin(&SessionId::from_raw("sess_a"), "late").unwrap();
        assert!(r.expire(Utc::now()).is_empty());

        let later = p.submitted_at + chrono::Duration::seconds(11);
        let failed = r.expire(later);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].prompt().prompt_id, p.prompt_id);
        assert_eq!(r.staged_text().as_deref(), Some("late"));
        assert!(r.expire(later).is_empty());
    }

    #[test]
    fn queued_prompt_is_exempt_from_timeout() {
        let r = reconciler(Duration::from_secs(10));
        let p = r.begin(&SessionId::from_raw("sess_a"), "behind a long turn").unwrap();
        let queued = event(
            EventBody::Queued(Queued {
                text: "behind a long turn".into(),
                position: 1,
            }),
            &p.prompt_id,
        );
        assert!(r.observe(&queued).is_none());
        assert_eq!(r.ledger().get(&p.prompt_id).unwrap().status, PendingStatus::Queued);
        assert!(!r.mark_queued(&p.prompt_id));

        let much_later = p.submitted_at + chrono::Duration::minutes(30);
        assert!(r.expire(much_later).is_empty());
        assert!(r.is_pending(&p.prompt_id));

        let res = r.observe(&user_prompt(&p.prompt_id, "behind a long turn")).unwrap();
        assert!(matches!(res, Resolution::Confirmed(_)));
        assert!(r.staged_text().is_none());
    }

    #[test]
    fn resolution_survives_failed_ledger_write() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let r = PendingSendReconciler::new(
            PendingLedger::open(&state_dir.join("pending.json")),
            Duration::from_secs(60),
        );
        let confirmed = r.begin(&SessionId::from_raw("sess_a"), "first").unwrap();
        let failed = r.begin(&SessionId::from_raw("sess_a"), "second").unwrap();

        // Replace the ledger's directory with a plain file so every write fails.
        std::fs::remove_dir_all(&state_dir).unwrap();
        std::fs::write(&state_dir, b"not a directory").unwrap();

        let res = r.observe(&user_prompt(&confirmed.prompt_id, "first")).unwrap();
        assert_eq!(res.prompt().prompt_id, confirmed.prompt_id);

        match r.fail(&failed.prompt_id, "rejected") {
            Some(Resolution::Failed { prompt, .. }) => assert_eq!(prompt.text, "second"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(r.staged_text().as_deref(), Some("second"));
        assert!(r.ledger().is_empty());
    }

    #[test]
    fn ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.json");
        let id = {
            let ledger = PendingLedger::open(&path);
            let r = PendingSendReconciler::new(ledger, Duration::from_secs(60));
            r.begin(&SessionId::from_raw("sess_a"), "persist me").unwrap().prompt_id
        };
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = PendingLedger::open(&path);
        let entry = reopened.get(&id).unwrap();
        assert_eq!(entry.text, "persist me");
        assert_eq!(entry.status, PendingStatus::Inflight);

        assert!(reopened.remove(&id).is_some());
        assert!(PendingLedger::open(&path).is_empty());
    }

    #[test]
    fn corrupt_ledger_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.json");
        std::fs::write(&path, "{broken").unwrap();
        assert!(PendingLedger::open(&path).is_empty());
    }
}
