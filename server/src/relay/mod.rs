//! Cross-process relay bus.
//!
//! `publish` fans a payload out to all current subscribers of a topic;
//! delivery is best-effort, at-most-once. Each gateway process
//! subscribes once at startup to its own topic (`gw:<process-id>`);
//! routing entries address that topic plus a connection id, and the
//! ingress task drops frames for connections the process no longer
//! hosts.

pub mod ingress;
pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::proto::ServerMessage;
use crate::routing::RouteTarget;

pub use memory::MemoryBus;
pub use redis::RedisBus;

/// Transient bus failure. The single message in flight is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    Unavailable,
    Timeout,
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusError::Unavailable => write!(f, "relay bus unavailable"),
            BusError::Timeout => write!(f, "relay bus operation timed out"),
        }
    }
}

/// Publish/subscribe transport shared across processes.
#[async_trait]
pub trait RelayBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError>;
    async fn subscribe(&self, topic: &str)
        -> Result<mpsc::UnboundedReceiver<Vec<u8>>, BusError>;
}

/// Bus payload: the target connection within the receiving process plus
/// the already-encoded wire frame for that connection's socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayFrame {
    pub conn: String,
    pub body: String,
}

/// Topic owned by a gateway process.
pub fn process_topic(process_id: &str) -> String {
    format!("gw:{process_id}")
}

/// Named result of a relay attempt. Everything except `Delivered` is a
/// silent drop toward the sender; the names exist so logs and tests can
/// tell the drops apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered,
    DropNoMembership,
    DropChannelMismatch,
    DropNoRoute,
    DropInfra,
}

impl RelayOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayOutcome::Delivered => "delivered",
            RelayOutcome::DropNoMembership => "drop-no-membership",
            RelayOutcome::DropChannelMismatch => "drop-channel-mismatch",
            RelayOutcome::DropNoRoute => "drop-no-route",
            RelayOutcome::DropInfra => "drop-infra",
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, RelayOutcome::Delivered)
    }
}

/// Encode a server envelope for `target` and publish it to the owning
/// process's topic. Fire-and-forget: no response is awaited.
pub async fn publish_to_route(
    bus: &dyn RelayBus,
    target: &RouteTarget,
    message: &ServerMessage,
) -> Result<(), BusError> {
    let body = message.to_wire().map_err(|_| BusError::Unavailable)?;
    let frame = RelayFrame {
        conn: target.conn.clone(),
        body,
    };
    let payload = serde_json::to_vec(&frame).map_err(|_| BusError::Unavailable)?;
    bus.publish(&target.topic, &payload).await
}
