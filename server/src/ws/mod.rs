pub mod actor;
pub mod handler;
pub mod protocol;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Type alias for the sender half of a WebSocket connection's channel.
/// Other parts of the system can clone this to push messages to a specific client.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;

/// Connection registry: active WebSocket connections hosted by this
/// process, keyed by connection id. User -> connection resolution lives
/// in the routing store, not here.
/// Arc<DashMap<ConnectionId, ConnectionSender>>
pub type ConnectionRegistry = Arc<DashMap<String, ConnectionSender>>;

/// Create a new empty connection registry.
pub fn new_connection_registry() -> ConnectionRegistry {
    Arc::new(DashMap::new())
}

/// Per-connection state owned by the connection's actor. Handlers for a
/// connection run sequentially in its reader loop, so no lock is needed.
#[derive(Debug, Clone)]
pub struct ConnState {
    /// Process-local connection id (UUIDv7)
    pub conn_id: String,
    /// Authenticated user id (24 hex chars)
    pub user_id: String,
    /// Voice channel cached at join; None means Idle. Used for the fast
    /// local membership precondition before any store read.
    pub voice_channel: Option<String>,
}
