//! Voice session coordinator: channel-membership lifecycle and call
//! signaling relay.
//!
//! Per-user phases run Idle -> Joining -> Active -> Idle. Joining is the
//! span of a `voiceStart` request inside the connection's actor (handlers
//! on one connection are sequential), so the connection's cached state is
//! simply the channel it occupies, or None for Idle.
//!
//! Relay handlers re-read the routing store before every forward and
//! never trust a claimed sender id: the outbound `user` field is always
//! rewritten to the authenticated identity.

use crate::proto::{ServerMessage, StreamIce, StreamSdp, VoiceStart};
use crate::relay::{publish_to_route, RelayOutcome};
use crate::routing::{voice_channel_key, voice_ws_key, RouteTarget};
use crate::state::AppState;
use crate::ws::ConnState;

/// Handle `voiceStart`: open channel membership for this connection.
///
/// If the user is already in another voice channel, they are
/// auto-disconnected from it first. The route entry is written before
/// the membership entry, so a peer racing between the two reads can
/// only observe a missing route (a drop), never a misdirected relay.
/// A partial failure rolls back and the user stays Idle.
pub async fn handle_voice_start(req: VoiceStart, state: &AppState, conn: &mut ConnState) {
    if conn.voice_channel.is_some() {
        handle_voice_stop(state, conn).await;
    }

    let route = RouteTarget {
        topic: state.process_topic.clone(),
        conn: conn.conn_id.clone(),
    };
    let Ok(route_value) = route.encode() else {
        return;
    };

    if let Err(e) = state
        .store
        .set(&voice_ws_key(&conn.user_id), &route_value, state.route_ttl_secs)
        .await
    {
        tracing::warn!(user_id = %conn.user_id, error = %e, "voice route write failed, join dropped");
        return;
    }

    if let Err(e) = state
        .store
        .set(&voice_channel_key(&conn.user_id), &req.channel, state.route_ttl_secs)
        .await
    {
        tracing::warn!(user_id = %conn.user_id, error = %e, "membership write failed, join dropped");
        let _ = state.store.delete(&voice_ws_key(&conn.user_id)).await;
        return;
    }

    // Active: membership is now visible to peers through the store.
    conn.voice_channel = Some(req.channel.clone());
    tracing::info!(
        user_id = %conn.user_id,
        channel = %req.channel,
        "voice channel joined"
    );
}

/// Handle `voiceStop`: close membership and return to Idle.
pub async fn handle_voice_stop(state: &AppState, conn: &mut ConnState) {
    if conn.voice_channel.is_none() {
        // Stale stop from a client that already left; nothing to do.
        return;
    }
    clear_membership(state, conn).await;
    conn.voice_channel = None;
    tracing::info!(user_id = %conn.user_id, "voice channel left");
}

/// Delete this connection's membership and voice-route entries. Guarded
/// on the stored connection id: if the user already re-joined from a
/// newer connection, that connection's entries are left alone.
pub async fn clear_membership(state: &AppState, conn: &ConnState) {
    let ws_key = voice_ws_key(&conn.user_id);
    match state.store.get(&ws_key).await {
        Ok(Some(value)) => {
            if let Some(target) = RouteTarget::decode(&value) {
                if target.conn != conn.conn_id {
                    return;
                }
            }
        }
        Ok(None) => {}
        Err(e) => {
            // Entries fall back to TTL expiry.
            tracing::warn!(
                user_id = %conn.user_id,
                error = %e,
                "membership cleanup failed, entries left to TTL"
            );
            return;
        }
    }

    if let Err(e) = state.store.delete(&ws_key).await {
        tracing::warn!(user_id = %conn.user_id, error = %e, "voice route delete failed");
    }
    if let Err(e) = state.store.delete(&voice_channel_key(&conn.user_id)).await {
        tracing::warn!(user_id = %conn.user_id, error = %e, "membership delete failed");
    }
}

/// Refresh the TTLs on this connection's voice entries. Called on the
/// route-refresh cadence while the connection is Active. Guarded the
/// same way as [`clear_membership`]: if the user already re-joined from
/// a newer connection, this one no longer owns the entries and must not
/// write them back.
pub async fn refresh_membership(state: &AppState, conn: &mut ConnState) {
    let Some(channel) = conn.voice_channel.clone() else {
        return;
    };
    let channel = channel.as_str();

    match state.store.get(&voice_ws_key(&conn.user_id)).await {
        Ok(Some(value)) => {
            if let Some(target) = RouteTarget::decode(&value) {
                if target.conn != conn.conn_id {
                    // Stale membership; the newer connection refreshes.
                    conn.voice_channel = None;
                    return;
                }
            }
        }
        // Our entry expired between ticks; rewrite it below.
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(user_id = %conn.user_id, error = %e, "voice route refresh read failed");
            return;
        }
    }

    let route = RouteTarget {
        topic: state.process_topic.clone(),
        conn: conn.conn_id.clone(),
    };
    let Ok(route_value) = route.encode() else {
        return;
    };
    if let Err(e) = state
        .store
        .set(&voice_ws_key(&conn.user_id), &route_value, state.route_ttl_secs)
        .await
    {
        tracing::warn!(user_id = %conn.user_id, error = %e, "voice route refresh failed");
    }
    if let Err(e) = state
        .store
        .set(&voice_channel_key(&conn.user_id), channel, state.route_ttl_secs)
        .await
    {
        tracing::warn!(user_id = %conn.user_id, error = %e, "membership refresh failed");
    }
}

/// Relay a local-track SDP offer/answer to a peer in the same channel.
pub async fn relay_stream_sdp(
    payload: StreamSdp,
    state: &AppState,
    conn: &ConnState,
) -> RelayOutcome {
    let target = match resolve_channel_peer(state, conn, &payload.user).await {
        Ok(target) => target,
        Err(outcome) => return outcome,
    };

    let mut out = payload;
    out.user = conn.user_id.clone();
    forward(state, conn, &target, ServerMessage::VoiceStreamSdp(out)).await
}

/// Relay a remote-track ICE candidate to a peer in the same channel.
pub async fn relay_stream_ice(
    payload: StreamIce,
    state: &AppState,
    conn: &ConnState,
) -> RelayOutcome {
    let target = match resolve_channel_peer(state, conn, &payload.user).await {
        Ok(target) => target,
        Err(outcome) => return outcome,
    };

    let mut out = payload;
    out.user = conn.user_id.clone();
    forward(state, conn, &target, ServerMessage::VoiceStreamIce(out)).await
}

/// Steps 1, 3 and 4 of the relay sequence: local membership
/// precondition, fresh re-read of the claimed target's membership, and
/// resolution of the target's current connection.
///
/// The membership comparison is what prevents cross-channel leakage
/// when a channel switch races an in-flight message, or when the target
/// id is spoofed: a mismatch is a silent drop, never an error.
async fn resolve_channel_peer(
    state: &AppState,
    conn: &ConnState,
    target_user: &str,
) -> Result<RouteTarget, RelayOutcome> {
    let Some(sender_channel) = conn.voice_channel.as_deref() else {
        return Err(RelayOutcome::DropNoMembership);
    };

    let target_channel = match state.store.get(&voice_channel_key(target_user)).await {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(target = %target_user, error = %e, "membership read failed");
            return Err(RelayOutcome::DropInfra);
        }
    };
    if target_channel.as_deref() != Some(sender_channel) {
        return Err(RelayOutcome::DropChannelMismatch);
    }

    match state.store.get(&voice_ws_key(target_user)).await {
        Ok(Some(value)) => match RouteTarget::decode(&value) {
            Some(target) => Ok(target),
            None => Err(RelayOutcome::DropNoRoute),
        },
        Ok(None) => Err(RelayOutcome::DropNoRoute),
        Err(e) => {
            tracing::warn!(target = %target_user, error = %e, "route read failed");
            Err(RelayOutcome::DropInfra)
        }
    }
}

/// Step 5: fire-and-forget publish to the target's owning process.
async fn forward(
    state: &AppState,
    conn: &ConnState,
    target: &RouteTarget,
    message: ServerMessage,
) -> RelayOutcome {
    match publish_to_route(state.bus.as_ref(), target, &message).await {
        Ok(()) => RelayOutcome::Delivered,
        Err(e) => {
            tracing::warn!(user_id = %conn.user_id, error = %e, "relay publish failed");
            RelayOutcome::DropInfra
        }
    }
}
