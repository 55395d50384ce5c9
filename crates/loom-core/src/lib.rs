pub mod backend;
pub mod errors;
pub mod events;
pub mod ids;
pub mod protocol;
pub mod state;

pub use errors::ErrorKind;
pub use events::{Event, EventBody, EventKind, NewEvent};
pub use ids::{ConnectionId, PromptId, SessionId};
pub use state::{ConnectionMode, SubmitDisposition, TurnState};
