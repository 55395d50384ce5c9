//! Single-active-turn coordination per session.
//!
//! Each session has one [`Slot`] guarded by a mutex. Every append to the
//! session's log, every state transition, and every queue drain happens while
//! that mutex is held, so the log order, the broadcast order, and the turn
//! state machine can never disagree. The backend runs in a spawned task that
//! re-enters the slot once per chunk.

use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use loom_core::backend::{AgentBackend, BackendChunk, BackendError, TurnRequest};
use loom_core::events::{codes, CompletionReason};
use loom_core::{
    ConnectionId, Event, EventKind, NewEvent, PromptId, SessionId, SubmitDisposition, TurnState,
};
use loom_store::{Database, EventLog, MoveDirection, QueuedPrompt, SessionRepo, SessionStatus};

use crate::error::EngineError;
use crate::queue::PromptQueue;

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Maximum queued prompts per session (0 = unbounded).
    pub queue_max_size: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self { queue_max_size: 10 }
    }
}

#[derive(Clone, Debug)]
pub struct SubmitRequest {
    /// Client-reserved id. Minted here when absent.
    pub prompt_id: Option<PromptId>,
    pub text: String,
    pub origin: Option<ConnectionId>,
}

impl SubmitRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            prompt_id: None,
            text: text.into(),
            origin: None,
        }
    }

    pub fn with_prompt_id(mut self, prompt_id: PromptId) -> Self {
        self.prompt_id = Some(prompt_id);
        self
    }

    pub fn with_origin(mut self, origin: ConnectionId) -> Self {
        self.origin = Some(origin);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SubmitOutcome {
    pub prompt_id: PromptId,
    pub disposition: SubmitDisposition,
    /// Queue position when queued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// Nothing was streaming. Not an error.
    NotStreaming,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    Deleted,
    Archived,
}

impl CloseReason {
    fn code(&self) -> &'static str {
        match self {
            Self::Deleted => codes::SESSION_DELETED,
            Self::Archived => codes::SESSION_ARCHIVED,
        }
    }
}

/// Point-in-time view used for `connected` and `keepalive_ack` frames.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub state: TurnState,
    pub queue_length: usize,
    pub last_seq: u64,
    pub last_user_prompt_id: Option<PromptId>,
}

enum TurnOutcome {
    Completed,
    Failed(BackendError),
    Cancelled,
}

struct ActiveTurn {
    id: u64,
    prompt_id: PromptId,
    cancel: CancellationToken,
    chunks: u32,
}

#[derive(Default)]
struct Slot {
    state: TurnState,
    active: Option<ActiveTurn>,
    closed: bool,
    turns_started: u64,
}

struct Inner {
    log: EventLog,
    sessions: SessionRepo,
    queue: PromptQueue,
    backend: Arc<dyn AgentBackend>,
    events: broadcast::Sender<Event>,
    slots: DashMap<SessionId, Arc<Mutex<Slot>>>,
}

/// Owns per-session turn state and is the only writer to session event logs.
#[derive(Clone)]
pub struct TurnCoordinator {
    inner: Arc<Inner>,
}

impl TurnCoordinator {
    pub fn new(
        db: Database,
        backend: Arc<dyn AgentBackend>,
        events: broadcast::Sender<Event>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                log: EventLog::new(db.clone()),
                sessions: SessionRepo::new(db.clone()),
                queue: PromptQueue::new(db, config.queue_max_size),
                backend,
                events,
                slots: DashMap::new(),
            }),
        }
    }

    /// Receiver for every event appended through this coordinator, in append order per session.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub fn log(&self) -> &EventLog {
        &self.inner.log
    }

    pub fn sessions(&self) -> &SessionRepo {
        &self.inner.sessions
    }

    pub fn state(&self, session_id: &SessionId) -> TurnState {
        self.inner
            .slots
            .get(session_id)
            .map(|slot| slot.lock().state)
            .unwrap_or_default()
    }

    pub fn snapshot(&self, session_id: &SessionId) -> Result<SessionSnapshot, EngineError> {
        let inner = &self.inner;
        let last_seq = inner.log.last_seq(session_id)?;
        Ok(SessionSnapshot {
            state: self.state(session_id),
            queue_length: inner.queue.len(session_id)?,
            last_seq,
            last_user_prompt_id: inner
                .log
                .last_user_prompt(session_id)?
                .and_then(|e| e.prompt_id),
        })
    }

    /// Start a turn if the session is idle, otherwise queue the prompt.
    #[instrument(skip(self, request), fields(session_id = %session_id))]
    pub fn submit(&self, session_id: &SessionId, request: SubmitRequest) -> Result<SubmitOutcome, EngineError> {
        let inner = &self.inner;
        if request.text.trim().is_empty() {
            return Err(EngineError::Invalid("prompt text is empty".into()));
        }
        let session = inner.sessions.get(session_id)?;
        if session.status == SessionStatus::Archived {
            return Err(EngineError::Archived(session_id.clone()));
        }

        let slot = inner.slot(session_id);
        let mut slot = slot.lock();
        if slot.closed {
            return Err(EngineError::Closed(session_id.clone()));
        }

        let prompt_id = request.prompt_id.unwrap_or_default();
        if inner.is_known_prompt(session_id, &slot, &prompt_id)? {
            debug!(prompt_id = %prompt_id, "duplicate submit ignored");
            return Ok(SubmitOutcome {
                prompt_id,
                disposition: SubmitDisposition::Duplicate,
                position: None,
            });
        }

        if slot.state == TurnState::Idle {
            inner.start_turn_locked(session_id, &mut slot, prompt_id.clone(), request.text, request.origin)?;
            return Ok(SubmitOutcome {
                prompt_id,
                disposition: SubmitDisposition::Started,
                position: None,
            });
        }

        let position = inner
            .queue
            .enqueue(session_id, &prompt_id, &request.text, request.origin.as_ref())?;
        inner.append_locked(
            session_id,
            &mut slot,
            NewEvent::queued(prompt_id.clone(), request.text, position).with_origin(request.origin),
        )?;
        info!(prompt_id = %prompt_id, position, "prompt queued behind active turn");
        Ok(SubmitOutcome {
            prompt_id,
            disposition: SubmitDisposition::Queued,
            position: Some(position),
        })
    }

    /// Ask the active turn to stop. Queued prompts are kept and drain once the
    /// turn has closed.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn cancel(&self, session_id: &SessionId) -> Result<CancelOutcome, EngineError> {
        let inner = &self.inner;
        if !inner.sessions.exists(session_id)? {
            return Err(EngineError::NotFound(format!("session {session_id}")));
        }
        let slot = inner.slot(session_id);
        let mut slot = slot.lock();
        if slot.state != TurnState::Streaming {
            debug!(state = ?slot.state, "cancel ignored");
            return Ok(CancelOutcome::NotStreaming);
        }
        slot.state = TurnState::Cancelling;
        if let Some(active) = &slot.active {
            active.cancel.cancel();
            info!(prompt_id = %active.prompt_id, "turn cancelling");
        }
        Ok(CancelOutcome::Cancelled)
    }

    /// Close the active turn immediately, without waiting for the backend, then
    /// drain the queue.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn force_reset(&self, session_id: &SessionId) -> Result<bool, EngineError> {
        let inner = &self.inner;
        let slot = inner.slot(session_id);
        let mut slot = slot.lock();
        let reset = inner.reset_locked(session_id, &mut slot, "turn reset");
        if !slot.closed {
            inner.drain_locked(session_id, &mut slot);
        }
        Ok(reset)
    }

    /// Stop accepting prompts for a session. The active turn is reset and every
    /// queued prompt is failed visibly with an `error` event carrying its id.
    #[instrument(skip(self), fields(session_id = %session_id, reason = ?reason))]
    pub fn close_session(&self, session_id: &SessionId, reason: CloseReason) -> Result<Vec<QueuedPrompt>, EngineError> {
        let inner = &self.inner;
        let slot = inner.slot(session_id);
        let mut slot = slot.lock();
        slot.closed = true;
        inner.reset_locked(session_id, &mut slot, "session closed");

        let dropped = inner.queue.drain(session_id)?;
        for prompt in &dropped {
            let event = NewEvent::error(reason.code(), "session closed before this prompt started")
                .with_prompt(prompt.prompt_id.clone())
                .with_origin(prompt.origin_connection_id.clone());
            if let Err(e) = inner.append_locked(session_id, &mut slot, event) {
                warn!(prompt_id = %prompt.prompt_id, error = %e, "could not record dropped prompt");
            }
        }
        info!(dropped = dropped.len(), "session closed");
        Ok(dropped)
    }

    /// Drop in-memory state for a session whose rows are gone.
    pub fn forget(&self, session_id: &SessionId) {
        self.inner.slots.remove(session_id);
    }

    pub fn list_queue(&self, session_id: &SessionId) -> Result<Vec<QueuedPrompt>, EngineError> {
        if !self.inner.sessions.exists(session_id)? {
            return Err(EngineError::NotFound(format!("session {session_id}")));
        }
        self.inner.queue.list(session_id)
    }

    /// Withdraw a queued prompt. Its pending senders see an `error` event.
    #[instrument(skip(self), fields(session_id = %session_id, prompt_id = %prompt_id))]
    pub fn remove_queued(&self, session_id: &SessionId, prompt_id: &PromptId) -> Result<QueuedPrompt, EngineError> {
        let inner = &self.inner;
        let slot = inner.slot(session_id);
        let mut slot = slot.lock();
        let removed = inner.queue.remove(session_id, prompt_id)?;
        inner.append_locked(
            session_id,
            &mut slot,
            NewEvent::error(codes::PROMPT_REMOVED, "prompt removed from queue")
                .with_prompt(prompt_id.clone())
                .with_origin(removed.origin_connection_id.clone()),
        )?;
        Ok(removed)
    }

    pub fn move_queued(
        &self,
        session_id: &SessionId,
        prompt_id: &PromptId,
        direction: MoveDirection,
    ) -> Result<bool, EngineError> {
        let slot = self.inner.slot(session_id);
        let _slot = slot.lock();
        self.inner.queue.move_prompt(session_id, prompt_id, direction)
    }

    /// Start turns for sessions left with queued prompts, e.g. after a restart.
    pub fn resume_queues(&self) -> Result<usize, EngineError> {
        let inner = &self.inner;
        let mut resumed = 0;
        for session in inner.sessions.list(false)? {
            if inner.queue.len(&session.id)? == 0 {
                continue;
            }
            let slot = inner.slot(&session.id);
            let mut slot = slot.lock();
            if slot.state == TurnState::Idle && !slot.closed {
                inner.drain_locked(&session.id, &mut slot);
                resumed += 1;
            }
        }
        if resumed > 0 {
            info!(resumed, "resumed queued prompts");
        }
        Ok(resumed)
    }
}

impl Inner {
    fn slot(&self, session_id: &SessionId) -> Arc<Mutex<Slot>> {
        self.slots.entry(session_id.clone()).or_default().clone()
    }

    /// Slot lookup for turn tasks. A forgotten session stays forgotten.
    fn existing_slot(&self, session_id: &SessionId) -> Option<Arc<Mutex<Slot>>> {
        self.slots.get(session_id).map(|s| s.value().clone())
    }

    /// Append and publish. Callers hold the session's slot lock.
    fn append_locked(&self, session_id: &SessionId, _slot: &mut Slot, event: NewEvent) -> Result<Event, EngineError> {
        let event = self.log.append(session_id, event)?;
        // No receivers is fine: nobody is watching this session right now.
        let _ = self.events.send(event.clone());
        Ok(event)
    }

    fn is_known_prompt(&self, session_id: &SessionId, slot: &Slot, prompt_id: &PromptId) -> Result<bool, EngineError> {
        if slot.active.as_ref().is_some_and(|a| &a.prompt_id == prompt_id) {
            return Ok(true);
        }
        if self.queue.contains(session_id, prompt_id)? {
            return Ok(true);
        }
        Ok(self
            .log
            .find_by_prompt(session_id, prompt_id, EventKind::UserPrompt)?
            .is_some())
    }

    fn start_turn_locked(
        self: &Arc<Self>,
        session_id: &SessionId,
        slot: &mut Slot,
        prompt_id: PromptId,
        text: String,
        origin: Option<ConnectionId>,
    ) -> Result<(), EngineError> {
        let session = self.sessions.get(session_id)?;
        self.append_locked(
            session_id,
            slot,
            NewEvent::user_prompt(prompt_id.clone(), text.clone()).with_origin(origin),
        )?;

        slot.turns_started += 1;
        let turn_id = slot.turns_started;
        let cancel = CancellationToken::new();
        slot.active = Some(ActiveTurn {
            id: turn_id,
            prompt_id: prompt_id.clone(),
            cancel: cancel.clone(),
            chunks: 0,
        });
        slot.state = TurnState::Streaming;
        info!(session_id = %session_id, prompt_id = %prompt_id, turn_id, "turn started");

        let request = TurnRequest {
            session_id: session_id.clone(),
            prompt_id,
            text,
            workspace_ref: session.workspace_ref,
            cancel,
        };
        tokio::spawn(run_turn(self.clone(), turn_id, request));
        Ok(())
    }

    /// Start the oldest queued prompt, if any. Prompts that cannot start are
    /// failed visibly and the next one is tried.
    fn drain_locked(self: &Arc<Self>, session_id: &SessionId, slot: &mut Slot) {
        while slot.state == TurnState::Idle && !slot.closed {
            let next = match self.queue.next(session_id) {
                Ok(Some(next)) => next,
                Ok(None) => return,
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "queue drain failed");
                    return;
                }
            };
            debug!(session_id = %session_id, prompt_id = %next.prompt_id, "draining queued prompt");
            if let Err(e) = self.start_turn_locked(
                session_id,
                slot,
                next.prompt_id.clone(),
                next.text,
                next.origin_connection_id,
            ) {
                warn!(session_id = %session_id, prompt_id = %next.prompt_id, error = %e, "queued prompt failed to start");
                let failed = NewEvent::error(e.kind().code(), e.to_string()).with_prompt(next.prompt_id);
                if self.append_locked(session_id, slot, failed).is_err() {
                    return;
                }
            }
        }
    }

    /// Relay one chunk. Returns false when the turn is no longer the active
    /// streaming turn, in which case the chunk is dropped.
    fn relay_chunk(&self, session_id: &SessionId, turn_id: u64, text: String) -> bool {
        let Some(slot) = self.existing_slot(session_id) else {
            return false;
        };
        let mut slot = slot.lock();
        if slot.state != TurnState::Streaming {
            return false;
        }
        let prompt_id = match slot.active.as_mut() {
            Some(active) if active.id == turn_id => {
                active.chunks += 1;
                active.prompt_id.clone()
            }
            _ => return false,
        };
        match self.append_locked(session_id, &mut slot, NewEvent::chunk(prompt_id, text)) {
            Ok(_) => true,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "failed to append chunk");
                false
            }
        }
    }

    /// Close out a turn with its terminal events, go idle, and drain the queue,
    /// all under one lock so no idle gap is observable.
    fn finish(self: &Arc<Self>, session_id: &SessionId, turn_id: u64, outcome: TurnOutcome) {
        let Some(slot) = self.existing_slot(session_id) else {
            debug!(session_id = %session_id, turn_id, "turn ended after its session was forgotten");
            return;
        };
        let mut slot = slot.lock();
        let (prompt_id, chunks) = match slot.active.as_ref() {
            Some(active) if active.id == turn_id => (active.prompt_id.clone(), active.chunks),
            _ => return,
        };
        // A cancel accepted before the backend finished wins.
        let outcome = if slot.state == TurnState::Cancelling {
            TurnOutcome::Cancelled
        } else {
            outcome
        };

        let mut terminal = Vec::with_capacity(2);
        let reason = match outcome {
            TurnOutcome::Completed => CompletionReason::Completed,
            TurnOutcome::Cancelled => {
                terminal.push(NewEvent::system(codes::TURN_CANCELLED, "turn cancelled").with_prompt(prompt_id.clone()));
                CompletionReason::Cancelled
            }
            TurnOutcome::Failed(e) => {
                warn!(session_id = %session_id, prompt_id = %prompt_id, error = %e, "backend failure");
                terminal.push(NewEvent::error(codes::BACKEND_FAILURE, e.to_string()).with_prompt(prompt_id.clone()));
                CompletionReason::Failed
            }
        };
        terminal.push(NewEvent::complete(prompt_id.clone(), reason, chunks));
        for event in terminal {
            if let Err(e) = self.append_locked(session_id, &mut slot, event) {
                error!(session_id = %session_id, error = %e, "failed to record turn end");
            }
        }

        slot.active = None;
        slot.state = TurnState::Idle;
        info!(session_id = %session_id, prompt_id = %prompt_id, ?reason, chunks, "turn finished");
        self.drain_locked(session_id, &mut slot);
    }

    /// Close the active turn as cancelled without waiting for the backend task.
    fn reset_locked(&self, session_id: &SessionId, slot: &mut Slot, message: &str) -> bool {
        let Some(active) = slot.active.take() else {
            slot.state = TurnState::Idle;
            return false;
        };
        active.cancel.cancel();
        let events = [
            NewEvent::system(codes::TURN_CANCELLED, message).with_prompt(active.prompt_id.clone()),
            NewEvent::complete(active.prompt_id.clone(), CompletionReason::Cancelled, active.chunks),
        ];
        for event in events {
            if let Err(e) = self.append_locked(session_id, slot, event) {
                error!(session_id = %session_id, error = %e, "failed to record reset");
            }
        }
        slot.state = TurnState::Idle;
        true
    }
}

async fn run_turn(inner: Arc<Inner>, turn_id: u64, request: TurnRequest) {
    let session_id = request.session_id.clone();
    let cancel = request.cancel.clone();

    let started = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            inner.finish(&session_id, turn_id, TurnOutcome::Cancelled);
            return;
        }
        started = inner.backend.start(request) => started,
    };
    let mut stream = match started {
        Ok(stream) => stream,
        Err(e) => {
            inner.finish(&session_id, turn_id, TurnOutcome::Failed(e));
            return;
        }
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                drop(stream);
                inner.finish(&session_id, turn_id, TurnOutcome::Cancelled);
                return;
            }
            next = stream.next() => next,
        };
        match next {
            Some(Ok(BackendChunk::Text(text))) => {
                if text.is_empty() {
                    continue;
                }
                if !inner.relay_chunk(&session_id, turn_id, text) {
                    // Cancelled or reset while we were waiting on the backend.
                    drop(stream);
                    inner.finish(&session_id, turn_id, TurnOutcome::Cancelled);
                    return;
                }
            }
            Some(Ok(BackendChunk::Done)) | None => {
                inner.finish(&session_id, turn_id, TurnOutcome::Completed);
                return;
            }
            Some(Err(e)) => {
                inner.finish(&session_id, turn_id, TurnOutcome::Failed(e));
                return;
            }
        }
    }
}
