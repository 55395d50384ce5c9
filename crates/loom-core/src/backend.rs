use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::ids::{PromptId, SessionId};

/// Errors raised by an agent backend. Recorded in the log as `error` events.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to start agent: {0}")]
    Spawn(String),
    #[error("agent I/O error: {0}")]
    Io(String),
    #[error("agent exited with status {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },
    #[error("agent failed: {0}")]
    Failed(String),
}

impl BackendError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "spawn",
            Self::Io(_) => "io",
            Self::Exited { .. } => "exited",
            Self::Failed(_) => "failed",
        }
    }
}

/// One prompt handed to the backend.
#[derive(Clone, Debug)]
pub struct TurnRequest {
    pub session_id: SessionId,
    pub prompt_id: PromptId,
    pub text: String,
    pub workspace_ref: String,
    /// Cancelled when the coordinator accepts a cancel for this turn.
    /// Backends should stop producing output and release resources.
    pub cancel: CancellationToken,
}

/// Output produced by a backend during a turn. A stream that ends without
/// `Done` is treated as a normal completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendChunk {
    Text(String),
    Done,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<BackendChunk, BackendError>> + Send>>;

/// The external agent: given a prompt, streams content chunks and a completion marker.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self, request: TurnRequest) -> Result<ChunkStream, BackendError>;
}
