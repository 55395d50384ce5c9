//! WebSocket frames exchanged on `/api/sessions/{id}/ws`.
//!
//! Both directions are JSON text frames tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::events::Event;
use crate::ids::{ConnectionId, PromptId, SessionId};
use crate::state::{SubmitDisposition, TurnState};

/// Client -> server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Start (or restart) catch-up from `since_seq`, then go live.
    Subscribe {
        since_seq: u64,
        /// Unix millis of the client's last observed activity. Used for the
        /// staleness check on reconnect.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_activity_ms: Option<i64>,
    },
    Submit {
        prompt_id: PromptId,
        text: String,
    },
    Cancel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    Keepalive {
        client_time_ms: i64,
        last_seen_seq: u64,
    },
}

/// Server -> client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected {
        session_id: SessionId,
        connection_id: ConnectionId,
        state: TurnState,
        last_seq: u64,
        queue_length: usize,
        /// Most recent `user_prompt` in the log, so a reconnecting client can
        /// resolve a pending send without waiting for catch-up.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_user_prompt_id: Option<PromptId>,
    },
    SyncStarted {
        since_seq: u64,
        full_resync: bool,
    },
    Event {
        event: Event,
    },
    Live {
        last_seq: u64,
    },
    Accepted {
        prompt_id: PromptId,
        disposition: SubmitDisposition,
    },
    CancelResult {
        cancelled: bool,
    },
    KeepaliveAck {
        client_time_ms: i64,
        server_time_ms: i64,
        server_max_seq: u64,
        state: TurnState,
        queue_length: usize,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt_id: Option<PromptId>,
    },
    SessionClosed {
        reason: String,
    },
}

impl ServerFrame {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
            prompt_id: None,
        }
    }

    pub fn prompt_error(prompt_id: PromptId, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
            prompt_id: Some(prompt_id),
        }
    }

    pub fn to_json(&self) -> String {
        // Frames contain only strings, integers, and enums; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

impl ClientFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AgentChunk, EventBody};
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn subscribe_without_activity() {
        let frame: ClientFrame = serde_json::from_value(json!({"type": "subscribe", "since_seq": 12})).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Subscribe {
                since_seq: 12,
                last_activity_ms: None
            }
        );
    }

    #[test]
    fn cancel_session_is_optional() {
        let frame: ClientFrame = serde_json::from_value(json!({"type": "cancel"})).unwrap();
        assert_eq!(frame, ClientFrame::Cancel { session_id: None });
    }

    #[test]
    fn submit_shape() {
        let frame = ClientFrame::Submit {
            prompt_id: PromptId::from_raw("prm_1"),
            text: "hello".into(),
        };
        let v: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(v, json!({"type": "submit", "prompt_id": "prm_1", "text": "hello"}));
    }

    #[test]
    fn event_frame_nests_wire_event() {
        let frame = ServerFrame::Event {
            event: Event {
                seq: 4,
                session_id: SessionId::from_raw("sess_a"),
                body: EventBody::AgentChunk(AgentChunk { text: "x".into() }),
                prompt_id: None,
                origin_connection_id: None,
                ts: Utc::now(),
            },
        };
        let v: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(v["type"], "event");
        assert_eq!(v["event"]["type"], "agent_chunk");
        assert_eq!(v["event"]["seq"], 4);

        let back: ServerFrame = serde_json::from_value(v).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn prompt_error_carries_prompt_id() {
        let frame = ServerFrame::prompt_error(PromptId::from_raw("prm_9"), "not_found", "gone");
        let v: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(v["prompt_id"], "prm_9");
        assert_eq!(v["code"], "not_found");
    }

    #[test]
    fn unknown_frame_rejected() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"reboot"}"#).is_err());
    }
}
