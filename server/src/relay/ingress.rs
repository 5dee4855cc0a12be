//! Bridges the process's bus subscription to local WebSocket senders.
//!
//! A frame addressed to a connection this process no longer hosts is
//! dropped silently: the connection closed or migrated mid-flight, and
//! the teardown path already cleared its routing entries.

use axum::extract::ws::Message;
use tokio::sync::mpsc;

use super::RelayFrame;
use crate::ws::ConnectionRegistry;

/// Drain the process topic subscription and forward frame bodies to the
/// targeted local connection. Runs until the bus subscription ends.
pub async fn run(mut rx: mpsc::UnboundedReceiver<Vec<u8>>, registry: ConnectionRegistry) {
    while let Some(payload) = rx.recv().await {
        let frame: RelayFrame = match serde_json::from_slice(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable relay frame dropped");
                continue;
            }
        };

        match registry.get(&frame.conn) {
            Some(sender) => {
                // Send failure means the connection is tearing down
                // concurrently; the frame becomes a drop.
                let _ = sender.send(Message::Text(frame.body.into()));
            }
            None => {
                tracing::debug!(
                    conn_id = %frame.conn,
                    "relay frame for connection no longer hosted here, dropped"
                );
            }
        }
    }
}
