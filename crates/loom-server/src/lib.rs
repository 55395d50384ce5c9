//! HTTP and WebSocket surface for loom sessions.
//!
//! The [`SyncHub`] owns every live connection and guarantees that each one
//! sees the session's event log gap-free and in order, across reconnects.

pub mod api;
pub mod connection;
pub mod error;
pub mod event_bridge;
pub mod hub;
pub mod server;
pub mod socket;

pub use connection::HubConfig;
pub use error::{ApiError, HubError};
pub use hub::SyncHub;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
