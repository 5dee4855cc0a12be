use std::sync::Arc;

use crate::relay::RelayBus;
use crate::routing::RoutingStore;
use crate::ws::ConnectionRegistry;

/// Shared application state passed to all handlers via axum State extractor.
/// The registry is process-scoped and explicit; the routing store is the
/// only state shared across processes.
#[derive(Clone)]
pub struct AppState {
    /// Active WebSocket connections hosted by this process, by connection id
    pub connections: ConnectionRegistry,
    /// Cross-process routing store (user -> connection/channel entries)
    pub store: Arc<dyn RoutingStore>,
    /// Cross-process relay bus
    pub bus: Arc<dyn RelayBus>,
    /// HS256 secret shared with the external auth service
    pub jwt_secret: Vec<u8>,
    /// This process's bus topic (`gw:<process-id>`)
    pub process_topic: String,
    /// TTL in seconds applied to routing entries
    pub route_ttl_secs: u64,
}
