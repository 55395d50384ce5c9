use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use loom_core::{ConnectionId, Event, EventBody, EventKind, NewEvent, PromptId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, seq_param};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadOrder {
    #[default]
    Asc,
    Desc,
}

impl std::str::FromStr for ReadOrder {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(format!("unknown order: {other}")),
        }
    }
}

const EVENT_COLUMNS: &str = "session_id, seq, type, prompt_id, origin_connection_id, payload, ts";

/// Append-only, per-session event log. Owns sequence assignment: `seq` is
/// minted only inside [`EventLog::append`].
#[derive(Clone)]
pub struct EventLog {
    db: Database,
}

impl EventLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append an event, assigning `seq = last_seq + 1`.
    ///
    /// The read of `last_seq`, the insert, and the bump of `sessions.last_seq`
    /// run in one transaction under the connection lock, so concurrent appends
    /// to the same session never share a sequence number.
    #[instrument(skip(self, event), fields(session_id = %session_id, event_type = %event.kind()))]
    pub fn append(&self, session_id: &SessionId, event: NewEvent) -> Result<Event, StoreError> {
        let payload = event.body.to_payload()?;
        let ts = Utc::now();

        self.db.write(|tx| {
            let last: Option<i64> = tx
                .query_row(
                    "SELECT last_seq FROM sessions WHERE id = ?1",
                    [session_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let last = last.ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
            let seq = last + 1;

            tx.execute(
                "INSERT INTO events (session_id, seq, type, prompt_id, origin_connection_id, payload, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    session_id.as_str(),
                    seq,
                    event.kind().as_str(),
                    event.prompt_id.as_ref().map(PromptId::as_str),
                    event.origin_connection_id.as_ref().map(ConnectionId::as_str),
                    serde_json::to_string(&payload)?,
                    ts.to_rfc3339(),
                ],
            )?;
            tx.execute(
                "UPDATE sessions SET last_seq = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![seq, ts.to_rfc3339(), session_id.as_str()],
            )?;

            Ok(Event {
                seq: seq as u64,
                session_id: session_id.clone(),
                body: event.body,
                prompt_id: event.prompt_id,
                origin_connection_id: event.origin_connection_id,
                ts,
            })
        })
    }

    /// Events with `seq > since_seq` (all events when `None`), at most `limit`,
    /// in the requested order. `Desc` yields the newest matching events first.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn read(
        &self,
        session_id: &SessionId,
        since_seq: Option<u64>,
        limit: Option<u32>,
        order: ReadOrder,
    ) -> Result<Vec<Event>, StoreError> {
        let direction = match order {
            ReadOrder::Asc => "ASC",
            ReadOrder::Desc => "DESC",
        };
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE session_id = ?1 AND seq > ?2
             ORDER BY seq {direction} LIMIT ?3"
        );
        self.query(session_id, &sql, since_seq.map(seq_param).unwrap_or(0), limit)
    }

    /// The newest `limit` events with `seq < before_seq`, in the requested order.
    /// Used for paging backwards through history.
    #[instrument(skip(self), fields(session_id = %session_id, before_seq))]
    pub fn read_before(
        &self,
        session_id: &SessionId,
        before_seq: u64,
        limit: u32,
        order: ReadOrder,
    ) -> Result<Vec<Event>, StoreError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE session_id = ?1 AND seq < ?2
             ORDER BY seq DESC LIMIT ?3"
        );
        let mut events = self.query(session_id, &sql, seq_param(before_seq), Some(limit))?;
        if order == ReadOrder::Asc {
            events.reverse();
        }
        Ok(events)
    }

    /// Highest assigned sequence number (0 for an empty log).
    pub fn last_seq(&self, session_id: &SessionId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT last_seq FROM sessions WHERE id = ?1")?;
            let mut rows = stmt.query([session_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_helpers::get_seq(row, 0, "sessions", "last_seq"),
                None => Err(StoreError::NotFound(format!("session {session_id}"))),
            }
        })
    }

    /// Most recent `user_prompt` event, if any.
    pub fn last_user_prompt(&self, session_id: &SessionId) -> Result<Option<Event>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE session_id = ?1 AND type = 'user_prompt'
                 ORDER BY seq DESC LIMIT 1"
            ))?;
            let mut rows = stmt.query([session_id.as_str()])?;
            rows.next()?.map(row_to_event).transpose()
        })
    }

    /// First event of `kind` carrying `prompt_id`.
    pub fn find_by_prompt(
        &self,
        session_id: &SessionId,
        prompt_id: &PromptId,
        kind: EventKind,
    ) -> Result<Option<Event>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE session_id = ?1 AND prompt_id = ?2 AND type = ?3
                 ORDER BY seq ASC LIMIT 1"
            ))?;
            let mut rows = stmt.query(rusqlite::params![
                session_id.as_str(),
                prompt_id.as_str(),
                kind.as_str()
            ])?;
            rows.next()?.map(row_to_event).transpose()
        })
    }

    fn query(
        &self,
        session_id: &SessionId,
        sql: &str,
        bound: i64,
        limit: Option<u32>,
    ) -> Result<Vec<Event>, StoreError> {
        // Negative LIMIT means unbounded in SQLite.
        let limit = limit.map(i64::from).unwrap_or(-1);
        self.db.with_conn(|conn| {
            let known: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?;
            if known == 0 {
                return Err(StoreError::NotFound(format!("session {session_id}")));
            }

            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), bound, limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_event(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<Event, StoreError> {
    let kind_str: String = row_helpers::get(row, 2, "events", "type")?;
    let kind: EventKind = row_helpers::parse_enum(&kind_str, "events", "type")?;
    let payload_str: String = row_helpers::get(row, 5, "events", "payload")?;
    let payload = row_helpers::parse_json(&payload_str, "events", "payload")?;
    let body = EventBody::from_payload(kind, payload).map_err(|e| StoreError::CorruptRow {
        table: "events",
        column: "payload",
        detail: format!("payload does not match {kind}: {e}"),
    })?;
    let ts_str: String = row_helpers::get(row, 6, "events", "ts")?;
    let ts = DateTime::parse_from_rfc3339(&ts_str)
        .map_err(|e| StoreError::CorruptRow {
            table: "events",
            column: "ts",
            detail: e.to_string(),
        })?
        .with_timezone(&Utc);

    Ok(Event {
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "events", "session_id")?),
        seq: row_helpers::get_seq(row, 1, "events", "seq")?,
        body,
        prompt_id: row_helpers::get_opt::<String>(row, 3, "events", "prompt_id")?.map(PromptId::from_raw),
        origin_connection_id: row_helpers::get_opt::<String>(row, 4, "events", "origin_connection_id")?
            .map(ConnectionId::from_raw),
        ts,
    })
}
