use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use loom_core::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Archived,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub workspace_ref: String,
    pub title: Option<String>,
    pub status: SessionStatus,
    pub last_seq: u64,
    pub created_at: String,
    pub updated_at: String,
}

const SESSION_COLUMNS: &str = "id, workspace_ref, title, status, last_seq, created_at, updated_at";

#[derive(Clone)]
pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new session with a fresh id.
    pub fn create(&self, workspace_ref: &str, title: Option<&str>) -> Result<Session, StoreError> {
        self.create_with_id(&SessionId::new(), workspace_ref, title)
    }

    /// Create a session under a caller-chosen id. Fails with Conflict if it exists.
    #[instrument(skip(self, title), fields(session_id = %id, workspace_ref))]
    pub fn create_with_id(
        &self,
        id: &SessionId,
        workspace_ref: &str,
        title: Option<&str>,
    ) -> Result<Session, StoreError> {
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO sessions (id, workspace_ref, title, status, last_seq, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'active', 0, ?4, ?4)",
                rusqlite::params![id.as_str(), workspace_ref, title, now],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict(format!("session {id} already exists")));
            }

            Ok(Session {
                id: id.clone(),
                workspace_ref: workspace_ref.to_string(),
                title: title.map(str::to_string),
                status: SessionStatus::Active,
                last_seq: 0,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    pub fn exists(&self, id: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )?;
            Ok(n > 0)
        })
    }

    /// List sessions, most recently updated first.
    pub fn list(&self, include_archived: bool) -> Result<Vec<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = if include_archived {
                format!("SELECT {SESSION_COLUMNS} FROM sessions ORDER BY updated_at DESC, id DESC")
            } else {
                format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE status = 'active'
                     ORDER BY updated_at DESC, id DESC"
                )
            };
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(session_id = %id, status = %status))]
    pub fn set_status(&self, id: &SessionId, status: SessionStatus) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status.to_string(), now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    pub fn set_title(&self, id: &SessionId, title: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET title = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![title, now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    /// Remove a session with its events and queue.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.write(|tx| {
            tx.execute("DELETE FROM events WHERE session_id = ?1", [id.as_str()])?;
            tx.execute("DELETE FROM queued_prompts WHERE session_id = ?1", [id.as_str()])?;
            let removed = tx.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            if removed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    let status: String = row_helpers::get(row, 3, "sessions", "status")?;
    Ok(Session {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        workspace_ref: row_helpers::get(row, 1, "sessions", "workspace_ref")?,
        title: row_helpers::get_opt(row, 2, "sessions", "title")?,
        status: row_helpers::parse_enum(&status, "sessions", "status")?,
        last_seq: row_helpers::get_seq(row, 4, "sessions", "last_seq")?,
        created_at: row_helpers::get(row, 5, "sessions", "created_at")?,
        updated_at: row_helpers::get(row, 6, "sessions", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> SessionRepo {
        SessionRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn create_and_get() {
        let repo = repo();
        let s = repo.create("/work/api", Some("api")).unwrap();
        assert!(s.id.as_str().starts_with("sess_"));
        assert_eq!(s.last_seq, 0);

        let fetched = repo.get(&s.id).unwrap();
        assert_eq!(fetched, s);
    }

    #[test]
    fn create_with_existing_id_conflicts() {
        let repo = repo();
        let id = SessionId::from_raw("sess_fixed");
        repo.create_with_id(&id, "/w", None).unwrap();
        let again = repo.create_with_id(&id, "/w", None);
        assert!(matches!(again, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn get_missing_is_not_found() {
        let result = repo().get(&SessionId::from_raw("sess_nope"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn archive_hides_from_default_list() {
        let repo = repo();
        let a = repo.create("/a", None).unwrap();
        let b = repo.create("/b", None).unwrap();
        repo.set_status(&a.id, SessionStatus::Archived).unwrap();

        let active = repo.list(false).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, b.id);
        assert_eq!(repo.list(true).unwrap().len(), 2);
        assert_eq!(repo.get(&a.id).unwrap().status, SessionStatus::Archived);
    }

    #[test]
    fn delete_removes_session() {
        let repo = repo();
        let s = repo.create("/a", None).unwrap();
        repo.delete(&s.id).unwrap();
        assert!(!repo.exists(&s.id).unwrap());
        assert!(matches!(repo.delete(&s.id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn set_title_updates() {
        let repo = repo();
        let s = repo.create("/a", None).unwrap();
        repo.set_title(&s.id, "renamed").unwrap();
        assert_eq!(repo.get(&s.id).unwrap().title.as_deref(), Some("renamed"));
    }
}
