use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ConnectionId, PromptId, SessionId};

/// Discriminant of a session event. Stored in the `type` column and emitted
/// as the `type` field of the wire shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    UserPrompt,
    AgentChunk,
    AgentComplete,
    System,
    Error,
    Queued,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserPrompt => "user_prompt",
            Self::AgentChunk => "agent_chunk",
            Self::AgentComplete => "agent_complete",
            Self::System => "system",
            Self::Error => "error",
            Self::Queued => "queued",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_prompt" => Ok(Self::UserPrompt),
            "agent_chunk" => Ok(Self::AgentChunk),
            "agent_complete" => Ok(Self::AgentComplete),
            "system" => Ok(Self::System),
            "error" => Ok(Self::Error),
            "queued" => Ok(Self::Queued),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPrompt {
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentChunk {
    pub text: String,
}

/// How a turn ended. Every started turn gets exactly one `agent_complete`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Completed,
    Cancelled,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentComplete {
    pub reason: CompletionReason,
    pub chunk_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub code: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queued {
    pub text: String,
    /// 1-based position in the queue at the time of enqueue.
    pub position: u32,
}

/// Well-known `code` values carried by `system` and `error` notices.
pub mod codes {
    pub const TURN_CANCELLED: &str = "turn_cancelled";
    pub const BACKEND_FAILURE: &str = "backend_failure";
    pub const PROMPT_REMOVED: &str = "prompt_removed";
    pub const SESSION_DELETED: &str = "session_deleted";
    pub const SESSION_ARCHIVED: &str = "session_archived";
}

/// Typed event payload, one shape per [`EventKind`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventBody {
    UserPrompt(UserPrompt),
    AgentChunk(AgentChunk),
    AgentComplete(AgentComplete),
    System(Notice),
    Error(Notice),
    Queued(Queued),
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::UserPrompt(_) => EventKind::UserPrompt,
            Self::AgentChunk(_) => EventKind::AgentChunk,
            Self::AgentComplete(_) => EventKind::AgentComplete,
            Self::System(_) => EventKind::System,
            Self::Error(_) => EventKind::Error,
            Self::Queued(_) => EventKind::Queued,
        }
    }

    pub fn to_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::UserPrompt(p) => serde_json::to_value(p),
            Self::AgentChunk(p) => serde_json::to_value(p),
            Self::AgentComplete(p) => serde_json::to_value(p),
            Self::System(p) | Self::Error(p) => serde_json::to_value(p),
            Self::Queued(p) => serde_json::to_value(p),
        }
    }

    /// Rebuild a typed body from its discriminant and JSON payload.
    pub fn from_payload(kind: EventKind, payload: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            EventKind::UserPrompt => Self::UserPrompt(serde_json::from_value(payload)?),
            EventKind::AgentChunk => Self::AgentChunk(serde_json::from_value(payload)?),
            EventKind::AgentComplete => Self::AgentComplete(serde_json::from_value(payload)?),
            EventKind::System => Self::System(serde_json::from_value(payload)?),
            EventKind::Error => Self::Error(serde_json::from_value(payload)?),
            EventKind::Queued => Self::Queued(serde_json::from_value(payload)?),
        })
    }

    /// Human-readable text carried by the body, if any.
    pub fn text(&self) -> &str {
        match self {
            Self::UserPrompt(p) => &p.text,
            Self::AgentChunk(p) => &p.text,
            Self::Queued(p) => &p.text,
            Self::System(n) | Self::Error(n) => &n.message,
            Self::AgentComplete(_) => "",
        }
    }
}

/// An event that has not been sequenced yet. Only the event log turns a
/// `NewEvent` into an [`Event`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewEvent {
    pub body: EventBody,
    pub prompt_id: Option<PromptId>,
    pub origin_connection_id: Option<ConnectionId>,
}

impl NewEvent {
    pub fn new(body: EventBody) -> Self {
        Self {
            body,
            prompt_id: None,
            origin_connection_id: None,
        }
    }

    pub fn user_prompt(prompt_id: PromptId, text: impl Into<String>) -> Self {
        Self::new(EventBody::UserPrompt(UserPrompt { text: text.into() })).with_prompt(prompt_id)
    }

    pub fn chunk(prompt_id: PromptId, text: impl Into<String>) -> Self {
        Self::new(EventBody::AgentChunk(AgentChunk { text: text.into() })).with_prompt(prompt_id)
    }

    pub fn complete(prompt_id: PromptId, reason: CompletionReason, chunk_count: u32) -> Self {
        Self::new(EventBody::AgentComplete(AgentComplete { reason, chunk_count }))
            .with_prompt(prompt_id)
    }

    pub fn system(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventBody::System(Notice {
            code: code.into(),
            message: message.into(),
        }))
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventBody::Error(Notice {
            code: code.into(),
            message: message.into(),
        }))
    }

    pub fn queued(prompt_id: PromptId, text: impl Into<String>, position: u32) -> Self {
        Self::new(EventBody::Queued(Queued {
            text: text.into(),
            position,
        }))
        .with_prompt(prompt_id)
    }

    pub fn with_prompt(mut self, prompt_id: PromptId) -> Self {
        self.prompt_id = Some(prompt_id);
        self
    }

    pub fn with_origin(mut self, origin: Option<ConnectionId>) -> Self {
        self.origin_connection_id = origin;
        self
    }

    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }
}

/// An immutable, sequenced session event.
///
/// Serialized in the wire shape
/// `{seq, type, session_id, prompt_id?, origin_connection_id?, payload, ts}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEvent", into = "WireEvent")]
pub struct Event {
    pub seq: u64,
    pub session_id: SessionId,
    pub body: EventBody,
    pub prompt_id: Option<PromptId>,
    pub origin_connection_id: Option<ConnectionId>,
    pub ts: DateTime<Utc>,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }

    /// True for a `user_prompt` carrying the given prompt id.
    pub fn confirms(&self, prompt_id: &PromptId) -> bool {
        self.kind() == EventKind::UserPrompt && self.prompt_id.as_ref() == Some(prompt_id)
    }
}

#[derive(Serialize, Deserialize)]
struct WireEvent {
    seq: u64,
    #[serde(rename = "type")]
    kind: EventKind,
    session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prompt_id: Option<PromptId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin_connection_id: Option<ConnectionId>,
    payload: Value,
    ts: DateTime<Utc>,
}

impl From<Event> for WireEvent {
    fn from(e: Event) -> Self {
        Self {
            seq: e.seq,
            kind: e.body.kind(),
            payload: e.body.to_payload().unwrap_or(Value::Null),
            session_id: e.session_id,
            prompt_id: e.prompt_id,
            origin_connection_id: e.origin_connection_id,
            ts: e.ts,
        }
    }
}

impl TryFrom<WireEvent> for Event {
    type Error = serde_json::Error;

    fn try_from(w: WireEvent) -> Result<Self, Self::Error> {
        Ok(Self {
            seq: w.seq,
            session_id: w.session_id,
            body: EventBody::from_payload(w.kind, w.payload)?,
            prompt_id: w.prompt_id,
            origin_connection_id: w.origin_connection_id,
            ts: w.ts,
        })
    }
}
