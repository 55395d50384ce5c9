pub mod database;
pub mod error;
pub mod events;
pub mod queue;
pub mod row_helpers;
pub mod schema;
pub mod sessions;

pub use database::Database;
pub use error::StoreError;
pub use events::{EventLog, ReadOrder};
pub use queue::{MoveDirection, QueueRepo, QueuedPrompt};
pub use sessions::{Session, SessionRepo, SessionStatus};
