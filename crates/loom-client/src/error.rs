use loom_core::{ErrorKind, PromptId};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Link-level failure; the session loop reconnects on its own.
    #[error("connection lost: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("server returned {status}: {message}")]
    Http { status: u16, code: String, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("prompt {0} was not confirmed in time")]
    Timeout(PromptId),

    #[error("client is shut down")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Http { status, .. } => match status {
                400 => ErrorKind::Invalid,
                404 => ErrorKind::NotFound,
                409 => ErrorKind::Conflict,
                503 | 504 => ErrorKind::Transient,
                _ => ErrorKind::Internal,
            },
            Self::Protocol(_) => ErrorKind::Invalid,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Closed | Self::Io(_) | Self::Serialization(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Self::Transient(e.to_string())
        } else if e.is_decode() {
            Self::Protocol(e.to_string())
        } else {
            Self::Transient(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::Http(resp) if resp.status().as_u16() == 404 => {
                Self::NotFound("session rejected by server".into())
            }
            WsError::Http(resp) => Self::Http {
                status: resp.status().as_u16(),
                code: String::new(),
                message: "WebSocket upgrade refused".into(),
            },
            WsError::Url(e) => Self::Protocol(e.to_string()),
            other => Self::Transient(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_maps_to_kind() {
        let e = ClientError::Http {
            status: 409,
            code: "conflict".into(),
            message: "queue is full".into(),
        };
        assert_eq!(e.kind(), ErrorKind::Conflict);
        assert!(!e.is_retryable());

        let e = ClientError::Http {
            status: 503,
            code: String::new(),
            message: String::new(),
        };
        assert!(e.is_retryable());
    }

    #[test]
    fn transient_retries_timeout_does_not() {
        assert!(ClientError::Transient("reset".into()).is_retryable());
        let e = ClientError::Timeout(PromptId::from_raw("prm_1"));
        assert_eq!(e.kind(), ErrorKind::Timeout);
        assert!(!e.is_retryable());
    }
}
