use loom_core::{ErrorKind, SessionId};
use loom_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("session {0} is archived")]
    Archived(SessionId),

    #[error("session {0} is closed")]
    Closed(SessionId),

    #[error("queue is full ({max} prompts)")]
    QueueFull { max: usize },

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::Closed(_) => ErrorKind::NotFound,
            Self::Archived(_) | Self::QueueFull { .. } => ErrorKind::Conflict,
            Self::Invalid(_) => ErrorKind::Invalid,
            Self::Store(e) => e.kind(),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::QueueFull { max } => Self::QueueFull { max },
            other => Self::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_are_reclassified() {
        let e: EngineError = StoreError::NotFound("session x".into()).into();
        assert!(matches!(e, EngineError::NotFound(_)));
        assert_eq!(e.kind(), ErrorKind::NotFound);

        let e: EngineError = StoreError::QueueFull { max: 3 }.into();
        assert_eq!(e.kind(), ErrorKind::Conflict);

        let e: EngineError = StoreError::Database("locked".into()).into();
        assert_eq!(e.kind(), ErrorKind::Internal);
    }

    #[test]
    fn closed_reads_as_not_found() {
        assert_eq!(EngineError::Closed(SessionId::new()).kind(), ErrorKind::NotFound);
    }
}
