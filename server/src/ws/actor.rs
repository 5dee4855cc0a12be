use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use uuid::Uuid;

use crate::routing::{self, session_key, RouteTarget};
use crate::state::AppState;
use crate::voice;
use crate::ws::protocol::{self, Handled};
use crate::ws::ConnState;

/// Ping interval: server sends WebSocket ping every 30 seconds.
/// Doubles as the liveness signal; routing-entry TTLs are refreshed on
/// their own cadence in the reader loop.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pong timeout: if pong not received within 10 seconds after ping, close.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// How long teardown waits for the writer to flush before giving up.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the actor-per-connection pattern for an authenticated WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards messages from an mpsc channel
/// - Reader task: processes incoming messages, dispatches to protocol
///   handlers, refreshes this connection's routing entries
///
/// The mpsc channel allows any part of the system (including the relay
/// ingress task) to send messages to this client by cloning the sender.
pub async fn run_connection(socket: WebSocket, state: AppState, user_id: String) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    let mut conn = ConnState {
        conn_id: Uuid::now_v7().to_string(),
        user_id,
        voice_channel: None,
    };

    // Register locally before the session route makes this connection
    // reachable from other processes.
    state.connections.insert(conn.conn_id.clone(), tx.clone());

    // Session route: user -> this process/connection. A failed write is
    // transient; the refresh cadence retries it.
    if let Err(e) = write_session_route(&state, &conn).await {
        tracing::warn!(
            user_id = %conn.user_id,
            error = %e,
            "session route write failed at handshake"
        );
    }

    tracing::info!(
        user_id = %conn.user_id,
        conn_id = %conn.conn_id,
        "WebSocket actor started"
    );

    // Spawn writer task: forwards mpsc messages to WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Track pong reception
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    // Spawn ping task: sends periodic pings and monitors pong responses
    let ping_tx = tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                // Writer task has died, connection is gone
                break;
            }

            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {
                    // Pong received, continue
                }
                _ => {
                    tracing::warn!("Pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    // Routing entries expire at route_ttl_secs; refresh at half that so
    // a crash bounds staleness without live connections ever expiring.
    let mut route_refresh = interval(Duration::from_secs((state.route_ttl_secs / 2).max(1)));
    route_refresh.tick().await;

    // Reader loop: process incoming WebSocket messages and refresh routes
    loop {
        tokio::select! {
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(msg)) => match msg {
                    Message::Text(text) => {
                        match protocol::handle_text_message(text.as_str(), &tx, &state, &mut conn).await {
                            Handled::Continue => {}
                            Handled::Close => break,
                        }
                    }
                    Message::Binary(_) => {
                        // The protocol is JSON text frames.
                        tracing::debug!(
                            user_id = %conn.user_id,
                            "Received binary message (expected text JSON), ignoring"
                        );
                    }
                    Message::Pong(_) => {
                        // Pong received, notify the ping task
                        let _ = pong_tx.send(());
                    }
                    Message::Ping(data) => {
                        // Respond to client pings with pong
                        let _ = tx.send(Message::Pong(data));
                    }
                    Message::Close(frame) => {
                        tracing::info!(
                            user_id = %conn.user_id,
                            reason = ?frame,
                            "Client initiated close"
                        );
                        break;
                    }
                },
                Some(Err(e)) => {
                    tracing::warn!(
                        user_id = %conn.user_id,
                        error = %e,
                        "WebSocket receive error"
                    );
                    break;
                }
                None => {
                    // Stream ended, client disconnected
                    tracing::info!(user_id = %conn.user_id, "WebSocket stream ended");
                    break;
                }
            },
            _ = route_refresh.tick() => {
                refresh_routes(&state, &mut conn).await;
            }
        }
    }

    ping_handle.abort();

    // Teardown must clear this connection's routing entries before it
    // completes, so a concurrent relay resolves to a drop instead of a
    // dead connection.
    teardown_routes(&state, &mut conn).await;
    state.connections.remove(&conn.conn_id);

    // Let the writer flush anything queued (close envelopes included),
    // then finish.
    drop(tx);
    let _ = timeout(WRITER_FLUSH_TIMEOUT, writer_handle).await;

    tracing::info!(
        user_id = %conn.user_id,
        conn_id = %conn.conn_id,
        "WebSocket actor stopped"
    );
}

/// Writer task: receives messages from mpsc channel and forwards them to the WebSocket sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed, connection is broken
            break;
        }
    }
}

/// Write the `ws:<user>` session route pointing at this connection.
async fn write_session_route(state: &AppState, conn: &ConnState) -> Result<(), routing::StoreError> {
    let route = RouteTarget {
        topic: state.process_topic.clone(),
        conn: conn.conn_id.clone(),
    };
    let value = route.encode().map_err(|_| routing::StoreError::Unavailable)?;
    state
        .store
        .set(&session_key(&conn.user_id), &value, state.route_ttl_secs)
        .await
}

/// Refresh the TTLs of every routing entry this connection owns. Each
/// refresh is guarded on the stored connection id, like the teardown
/// deletes: a connection never writes back an entry a newer connection
/// for the same user has taken over.
async fn refresh_routes(state: &AppState, conn: &mut ConnState) {
    let owns_session = match state.store.get(&session_key(&conn.user_id)).await {
        Ok(Some(value)) => match RouteTarget::decode(&value) {
            // The user reconnected; the session route belongs to the
            // newer connection now.
            Some(target) => target.conn == conn.conn_id,
            None => true,
        },
        // Our entry expired between ticks; rewrite it below.
        Ok(None) => true,
        Err(e) => {
            tracing::warn!(user_id = %conn.user_id, error = %e, "session route refresh read failed");
            false
        }
    };

    if owns_session {
        if let Err(e) = write_session_route(state, conn).await {
            tracing::warn!(user_id = %conn.user_id, error = %e, "session route refresh failed");
        }
    }

    // The voice entries carry their own ownership guard; a user can hold
    // the call on this connection while a newer one owns the session.
    if conn.voice_channel.is_some() {
        voice::signaling::refresh_membership(state, conn).await;
    }
}

/// Delete the routing entries owned by this connection. Each delete is
/// guarded on the stored connection id so a newer connection's entries
/// survive a teardown race.
async fn teardown_routes(state: &AppState, conn: &mut ConnState) {
    if conn.voice_channel.is_some() {
        voice::signaling::clear_membership(state, conn).await;
        conn.voice_channel = None;
    }

    if let Err(e) =
        routing::delete_if_owned(state.store.as_ref(), &session_key(&conn.user_id), &conn.conn_id)
            .await
    {
        // Entry is left to TTL expiry; staleness is bounded, not zero.
        tracing::warn!(
            user_id = %conn.user_id,
            error = %e,
            "session route delete failed at teardown"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MemoryBus;
    use crate::routing::MemoryStore;
    use crate::ws::new_connection_registry;
    use std::sync::Arc;

    const USER: &str = "aaaaaaaaaaaaaaaaaaaaaaaa";

    fn test_state() -> AppState {
        AppState {
            connections: new_connection_registry(),
            store: Arc::new(MemoryStore::new()),
            bus: Arc::new(MemoryBus::new()),
            jwt_secret: vec![0u8; 32],
            process_topic: "gw:test".to_string(),
            route_ttl_secs: 60,
        }
    }

    fn conn_for(conn_id: &str) -> ConnState {
        ConnState {
            conn_id: conn_id.to_string(),
            user_id: USER.to_string(),
            voice_channel: None,
        }
    }

    #[tokio::test]
    async fn refresh_spares_newer_session_route() {
        let state = test_state();
        let mut old_conn = conn_for("conn-old");
        let new_conn = conn_for("conn-new");

        write_session_route(&state, &old_conn).await.unwrap();
        // Reconnect: the newer connection overwrites the session route
        // at its handshake.
        write_session_route(&state, &new_conn).await.unwrap();

        refresh_routes(&state, &mut old_conn).await;

        let route = state.store.get(&session_key(USER)).await.unwrap().unwrap();
        assert_eq!(RouteTarget::decode(&route).unwrap().conn, "conn-new");
    }

    #[tokio::test]
    async fn refresh_rewrites_own_expired_session_route() {
        let state = test_state();
        let mut conn = conn_for("conn-a");

        // Nothing stored: the connection's entry expired between ticks.
        refresh_routes(&state, &mut conn).await;

        let route = state.store.get(&session_key(USER)).await.unwrap().unwrap();
        assert_eq!(RouteTarget::decode(&route).unwrap().conn, "conn-a");
    }
}
