pub mod backends;
pub mod coordinator;
pub mod error;
pub mod queue;

pub use backends::{CommandBackend, ScriptedBackend, ScriptedTurn};
pub use coordinator::{
    CancelOutcome, CloseReason, CoordinatorConfig, SessionSnapshot, SubmitOutcome, SubmitRequest,
    TurnCoordinator,
};
pub use error::EngineError;
pub use queue::PromptQueue;
