use serde::{Deserialize, Serialize};

/// Per-session turn state. Only the turn coordinator moves a session between these.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    #[default]
    Idle,
    Streaming,
    Cancelling,
}

impl TurnState {
    pub fn is_busy(&self) -> bool {
        !matches!(self, Self::Idle)
    }
}

/// Lifecycle of one client link: `Connecting -> Live <-> Syncing -> Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    Connecting,
    Syncing,
    Live,
    Closed,
}

/// What happened to a submitted prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitDisposition {
    /// A turn started immediately; the `user_prompt` event is already in the log.
    Started,
    /// The session was busy; a `queued` event was appended.
    Queued,
    /// The prompt id was already known; nothing was appended.
    Duplicate,
}
