use tracing::debug;

use loom_core::{ConnectionId, PromptId, SessionId};
use loom_store::{Database, MoveDirection, QueueRepo, QueuedPrompt};

use crate::error::EngineError;

/// FIFO of prompts submitted while a turn is active, persisted so a restart
/// does not strand them. All mutation happens under the owning session's
/// coordinator lock.
#[derive(Clone)]
pub struct PromptQueue {
    repo: QueueRepo,
    max_size: usize,
}

impl PromptQueue {
    pub fn new(db: Database, max_size: usize) -> Self {
        Self {
            repo: QueueRepo::new(db),
            max_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Returns the 1-based queue position.
    pub fn enqueue(
        &self,
        session_id: &SessionId,
        prompt_id: &PromptId,
        text: &str,
        origin: Option<&ConnectionId>,
    ) -> Result<u32, EngineError> {
        let position = self.repo.push(session_id, prompt_id, text, origin, self.max_size)?;
        debug!(session_id = %session_id, prompt_id = %prompt_id, position, "prompt queued");
        Ok(position)
    }

    pub fn next(&self, session_id: &SessionId) -> Result<Option<QueuedPrompt>, EngineError> {
        Ok(self.repo.pop_front(session_id)?)
    }

    pub fn list(&self, session_id: &SessionId) -> Result<Vec<QueuedPrompt>, EngineError> {
        Ok(self.repo.list(session_id)?)
    }

    pub fn len(&self, session_id: &SessionId) -> Result<usize, EngineError> {
        Ok(self.repo.len(session_id)?)
    }

    pub fn contains(&self, session_id: &SessionId, prompt_id: &PromptId) -> Result<bool, EngineError> {
        Ok(self.repo.contains(session_id, prompt_id)?)
    }

    pub fn remove(&self, session_id: &SessionId, prompt_id: &PromptId) -> Result<QueuedPrompt, EngineError> {
        Ok(self.repo.remove(session_id, prompt_id)?)
    }

    pub fn move_prompt(
        &self,
        session_id: &SessionId,
        prompt_id: &PromptId,
        direction: MoveDirection,
    ) -> Result<bool, EngineError> {
        Ok(self.repo.move_prompt(session_id, prompt_id, direction)?)
    }

    pub fn drain(&self, session_id: &SessionId) -> Result<Vec<QueuedPrompt>, EngineError> {
        Ok(self.repo.clear(session_id)?)
    }
}
