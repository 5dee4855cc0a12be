//! Shared routing store: the only cross-process mutable state.
//!
//! Maps users to the connection currently serving them and to the voice
//! channel they occupy. Entries are written only by the owning
//! connection's lifecycle handlers (handshake, join, leave, disconnect)
//! and read by arbitrary peers. Reads may be up to one round-trip stale;
//! relay decisions re-read freshly before forwarding and treat the
//! unsafe outcome as a silent drop.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Transient store failure. The in-flight message is dropped; the
/// connection loop keeps serving subsequent messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    Unavailable,
    Timeout,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable => write!(f, "routing store unavailable"),
            StoreError::Timeout => write!(f, "routing store operation timed out"),
        }
    }
}

/// Key/value store shared across server processes. No transactions
/// across keys; every implementation bounds each call with the
/// configured operation timeout.
#[async_trait]
pub trait RoutingStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Where a user's connection currently lives: the owning process's bus
/// topic plus the connection id within that process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTarget {
    pub topic: String,
    pub conn: String,
}

impl RouteTarget {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a stored route value. A corrupt value reads as absent.
    pub fn decode(value: &str) -> Option<RouteTarget> {
        serde_json::from_str(value).ok()
    }
}

/// Delete a route entry only if it still points at `conn_id`. A newer
/// connection's entry is never clobbered by a stale teardown. The
/// read-then-delete window is accepted under the store's documented
/// staleness bound.
pub async fn delete_if_owned(
    store: &dyn RoutingStore,
    key: &str,
    conn_id: &str,
) -> Result<(), StoreError> {
    match store.get(key).await? {
        Some(value) => {
            if let Some(target) = RouteTarget::decode(&value) {
                if target.conn != conn_id {
                    return Ok(());
                }
            }
            // Ours, or corrupt: either way it must not outlive us.
            store.delete(key).await
        }
        None => Ok(()),
    }
}

/// Session route for a user's live connection, written at handshake.
pub fn session_key(user: &str) -> String {
    format!("ws:{user}")
}

/// Route of the specific connection that joined voice, written at join.
pub fn voice_ws_key(user: &str) -> String {
    format!("voice_ws:{user}")
}

/// The voice channel a user currently occupies, written at join.
pub fn voice_channel_key(user: &str) -> String {
    format!("voice_channel:{user}")
}

/// Advisory chunk record for file-transfer coordination.
pub fn file_chunk_key(file: &str, chunk: u32) -> String {
    format!("file_chunk:{file}:{chunk}")
}
