use serde::{Deserialize, Serialize};

/// Failure classes shared by every layer. Library error enums map onto this
/// so the server and client can decide how to surface them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown session, connection, or queued prompt.
    NotFound,
    /// Operation does not apply in the current state (cancel while idle, full queue).
    Conflict,
    /// Link loss or other condition that resolves by reconnecting.
    Transient,
    /// The agent backend failed mid-turn.
    BackendFailure,
    /// A local wait expired (pending-send confirmation).
    Timeout,
    /// Malformed request.
    Invalid,
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Short code for wire frames and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Transient => "transient",
            Self::BackendFailure => "backend_failure",
            Self::Timeout => "timeout",
            Self::Invalid => "invalid_request",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_retries() {
        assert!(ErrorKind::Transient.is_retryable());
        for kind in [
            ErrorKind::NotFound,
            ErrorKind::Conflict,
            ErrorKind::BackendFailure,
            ErrorKind::Timeout,
            ErrorKind::Invalid,
            ErrorKind::Internal,
        ] {
            assert!(!kind.is_retryable(), "{kind} should not retry");
        }
    }

    #[test]
    fn code_matches_serde() {
        let json = serde_json::to_string(&ErrorKind::BackendFailure).unwrap();
        assert_eq!(json, "\"backend_failure\"");
        assert_eq!(ErrorKind::Invalid.code(), "invalid_request");
    }
}
