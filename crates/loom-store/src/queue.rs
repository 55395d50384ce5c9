use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use loom_core::{ConnectionId, PromptId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A prompt waiting for the session to go idle. Keyed by its reserved prompt id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedPrompt {
    pub prompt_id: PromptId,
    pub session_id: SessionId,
    pub text: String,
    pub origin_connection_id: Option<ConnectionId>,
    pub enqueued_at: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveDirection {
    Up,
    Down,
}

const QUEUE_COLUMNS: &str = "prompt_id, session_id, text, origin_connection_id, enqueued_at";

/// Persistent FIFO of queued prompts per session.
#[derive(Clone)]
pub struct QueueRepo {
    db: Database,
}

impl QueueRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append to the tail. Returns the 1-based position. Fails with
    /// `QueueFull` once `max_size` prompts are waiting (0 disables the limit).
    #[instrument(skip(self, text), fields(session_id = %session_id, prompt_id = %prompt_id))]
    pub fn push(
        &self,
        session_id: &SessionId,
        prompt_id: &PromptId,
        text: &str,
        origin: Option<&ConnectionId>,
        max_size: usize,
    ) -> Result<u32, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.write(|tx| {
            let (count, tail): (i64, i64) = tx.query_row(
                "SELECT COUNT(*), COALESCE(MAX(position), 0) FROM queued_prompts WHERE session_id = ?1",
                [session_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            if max_size > 0 && count as usize >= max_size {
                return Err(StoreError::QueueFull { max: max_size });
            }
            tx.execute(
                "INSERT INTO queued_prompts (prompt_id, session_id, position, text, origin_connection_id, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    prompt_id.as_str(),
                    session_id.as_str(),
                    tail + 1,
                    text,
                    origin.map(ConnectionId::as_str),
                    now,
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation => {
                    StoreError::Conflict(format!("prompt {prompt_id} already queued"))
                }
                other => other.into(),
            })?;
            Ok(count as u32 + 1)
        })
    }

    /// Remove and return the oldest queued prompt.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn pop_front(&self, session_id: &SessionId) -> Result<Option<QueuedPrompt>, StoreError> {
        self.db.write(|tx| {
            let head = tx
                .query_row(
                    &format!(
                        "SELECT {QUEUE_COLUMNS} FROM queued_prompts WHERE session_id = ?1
                         ORDER BY position ASC LIMIT 1"
                    ),
                    [session_id.as_str()],
                    |row| Ok(row_to_prompt(row)),
                )
                .optional()?
                .transpose()?;
            if let Some(prompt) = &head {
                tx.execute(
                    "DELETE FROM queued_prompts WHERE prompt_id = ?1",
                    [prompt.prompt_id.as_str()],
                )?;
            }
            Ok(head)
        })
    }

    pub fn list(&self, session_id: &SessionId) -> Result<Vec<QueuedPrompt>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {QUEUE_COLUMNS} FROM queued_prompts WHERE session_id = ?1 ORDER BY position ASC"
            ))?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_prompt(row)?);
            }
            Ok(results)
        })
    }

    pub fn get(&self, session_id: &SessionId, prompt_id: &PromptId) -> Result<QueuedPrompt, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {QUEUE_COLUMNS} FROM queued_prompts WHERE session_id = ?1 AND prompt_id = ?2"
            ))?;
            let mut rows = stmt.query([session_id.as_str(), prompt_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_prompt(row),
                None => Err(StoreError::NotFound(format!("queued prompt {prompt_id}"))),
            }
        })
    }

    pub fn contains(&self, session_id: &SessionId, prompt_id: &PromptId) -> Result<bool, StoreError> {
        match self.get(session_id, prompt_id) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(session_id = %session_id, prompt_id = %prompt_id))]
    pub fn remove(&self, session_id: &SessionId, prompt_id: &PromptId) -> Result<QueuedPrompt, StoreError> {
        let prompt = self.get(session_id, prompt_id)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM queued_prompts WHERE session_id = ?1 AND prompt_id = ?2",
                [session_id.as_str(), prompt_id.as_str()],
            )?;
            Ok(())
        })?;
        Ok(prompt)
    }

    /// Swap a prompt with its neighbour. Returns false when it is already at that end.
    #[instrument(skip(self), fields(session_id = %session_id, prompt_id = %prompt_id))]
    pub fn move_prompt(
        &self,
        session_id: &SessionId,
        prompt_id: &PromptId,
        direction: MoveDirection,
    ) -> Result<bool, StoreError> {
        self.db.write(|tx| {
            let position: i64 = tx
                .query_row(
                    "SELECT position FROM queued_prompts WHERE session_id = ?1 AND prompt_id = ?2",
                    [session_id.as_str(), prompt_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("queued prompt {prompt_id}")))?;

            let neighbour_sql = match direction {
                MoveDirection::Up => {
                    "SELECT prompt_id, position FROM queued_prompts WHERE session_id = ?1 AND position < ?2
                     ORDER BY position DESC LIMIT 1"
                }
                MoveDirection::Down => {
                    "SELECT prompt_id, position FROM queued_prompts WHERE session_id = ?1 AND position > ?2
                     ORDER BY position ASC LIMIT 1"
                }
            };
            let neighbour: Option<(String, i64)> = tx
                .query_row(neighbour_sql, rusqlite::params![session_id.as_str(), position], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .optional()?;

            let Some((other_id, other_position)) = neighbour else {
                return Ok(false);
            };
            tx.execute(
                "UPDATE queued_prompts SET position = ?1 WHERE prompt_id = ?2",
                rusqlite::params![other_position, prompt_id.as_str()],
            )?;
            tx.execute(
                "UPDATE queued_prompts SET position = ?1 WHERE prompt_id = ?2",
                rusqlite::params![position, other_id],
            )?;
            Ok(true)
        })
    }

    /// Remove every queued prompt for a session, returning them in queue order.
    pub fn clear(&self, session_id: &SessionId) -> Result<Vec<QueuedPrompt>, StoreError> {
        let drained = self.list(session_id)?;
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM queued_prompts WHERE session_id = ?1", [session_id.as_str()])?;
            Ok(())
        })?;
        Ok(drained)
    }

    pub fn len(&self, session_id: &SessionId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM queued_prompts WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }
}

fn row_to_prompt(row: &rusqlite::Row<'_>) -> Result<QueuedPrompt, StoreError> {
    Ok(QueuedPrompt {
        prompt_id: PromptId::from_raw(row_helpers::get::<String>(row, 0, "queued_prompts", "prompt_id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "queued_prompts", "session_id")?),
        text: row_helpers::get(row, 2, "queued_prompts", "text")?,
        origin_connection_id: row_helpers::get_opt::<String>(row, 3, "queued_prompts", "origin_connection_id")?
            .map(ConnectionId::from_raw),
        enqueued_at: row_helpers::get(row, 4, "queued_prompts", "enqueued_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRepo;

    fn setup() -> (QueueRepo, SessionId) {
        let db = Database::in_memory().unwrap();
        let sid = SessionRepo::new(db.clone()).create("/q", None).unwrap().id;
        (QueueRepo::new(db), sid)
    }

    fn texts(repo: &QueueRepo, sid: &SessionId) -> Vec<String> {
        repo.list(sid).unwrap().into_iter().map(|p| p.text).collect()
    }

    #[test]
    fn fifo_order() {
        let (repo, sid) = setup();
        for t in ["A", "B", "C"] {
            repo.push(&sid, &PromptId::new(), t, None, 0).unwrap();
        }
        assert_eq!(repo.pop_front(&sid).unwrap().unwrap().text, "A");
        assert_eq!(repo.pop_front(&sid).unwrap().unwrap().text, "B");
        assert_eq!(repo.len(&sid).unwrap(), 1);
        assert_eq!(repo.pop_front(&sid).unwrap().unwrap().text, "C");
        assert!(repo.pop_front(&sid).unwrap().is_none());
    }

    #[test]
    fn push_reports_position() {
        let (repo, sid) = setup();
        assert_eq!(repo.push(&sid, &PromptId::new(), "a", None, 0).unwrap(), 1);
        assert_eq!(repo.push(&sid, &PromptId::new(), "b", None, 0).unwrap(), 2);
    }

    #[test]
    fn push_respects_max_size() {
        let (repo, sid) = setup();
        repo.push(&sid, &PromptId::new(), "a", None, 2).unwrap();
        repo.push(&sid, &PromptId::new(), "b", None, 2).unwrap();
        let full = repo.push(&sid, &PromptId::new(), "c", None, 2);
        assert!(matches!(full, Err(StoreError::QueueFull { max: 2 })));
    }

    #[test]
    fn duplicate_prompt_id_conflicts() {
        let (repo, sid) = setup();
        let pid = PromptId::new();
        repo.push(&sid, &pid, "a", None, 0).unwrap();
        assert!(matches!(repo.push(&sid, &pid, "a", None, 0), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn remove_and_contains() {
        let (repo, sid) = setup();
        let pid = PromptId::new();
        repo.push(&sid, &pid, "gone", None, 0).unwrap();
        assert!(repo.contains(&sid, &pid).unwrap());
        let removed = repo.remove(&sid, &pid).unwrap();
        assert_eq!(removed.text, "gone");
        assert!(!repo.contains(&sid, &pid).unwrap());
        assert!(matches!(repo.remove(&sid, &pid), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn move_up_and_down() {
        let (repo, sid) = setup();
        let a = PromptId::new();
        let b = PromptId::new();
        let c = PromptId::new();
        repo.push(&sid, &a, "A", None, 0).unwrap();
        repo.push(&sid, &b, "B", None, 0).unwrap();
        repo.push(&sid, &c, "C", None, 0).unwrap();

        assert!(repo.move_prompt(&sid, &c, MoveDirection::Up).unwrap());
        assert_eq!(texts(&repo, &sid), vec!["A", "C", "B"]);

        assert!(repo.move_prompt(&sid, &a, MoveDirection::Down).unwrap());
        assert_eq!(texts(&repo, &sid), vec!["C", "A", "B"]);

        assert!(!repo.move_prompt(&sid, &c, MoveDirection::Up).unwrap());
        assert!(!repo.move_prompt(&sid, &b, MoveDirection::Down).unwrap());
    }

    #[test]
    fn clear_returns_drained_in_order() {
        let (repo, sid) = setup();
        repo.push(&sid, &PromptId::new(), "A", None, 0).unwrap();
        repo.push(&sid, &PromptId::new(), "B", None, 0).unwrap();
        let drained = repo.clear(&sid).unwrap();
        assert_eq!(drained.iter().map(|p| p.text.as_str()).collect::<Vec<_>>(), vec!["A", "B"]);
        assert_eq!(repo.len(&sid).unwrap(), 0);
    }

    #[test]
    fn origin_is_preserved() {
        let (repo, sid) = setup();
        let origin = ConnectionId::new();
        let pid = PromptId::new();
        repo.push(&sid, &pid, "x", Some(&origin), 0).unwrap();
        assert_eq!(repo.get(&sid, &pid).unwrap().origin_connection_id, Some(origin));
    }
}
