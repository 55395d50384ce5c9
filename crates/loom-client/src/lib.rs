//! Client side of a loom session: a reconnecting WebSocket link, pending-send
//! reconciliation, and a REST client for history and session management.

pub mod backoff;
pub mod error;
pub mod pending;
pub mod rest;
pub mod session;

pub use backoff::ReconnectBackoff;
pub use error::{ClientError, Result};
pub use pending::{PendingLedger, PendingPrompt, PendingSendReconciler, PendingStatus, Resolution};
pub use rest::{EnqueueResult, HistoryCursor, RestClient, SessionSummary};
pub use session::{ClientConfig, ClientEvent, SessionClient, SessionHandle};
