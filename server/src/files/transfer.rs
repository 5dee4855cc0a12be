//! File transfer coordinator.
//!
//! Relays chunk ownership/request/loss coordination and RTC negotiation
//! between transfer peers over the same routing/relay primitives as the
//! voice layer, with the same silent-drop-on-miss policy. No chunk
//! bytes ever pass through here; the advisory chunk records only hint
//! at whom to request from next; transfer completion is tracked by the
//! external durable store.

use serde::{Deserialize, Serialize};

use crate::proto::{ChunkLost, ChunkOwned, ChunkRequest, FileRtc, ServerMessage};
use crate::relay::{publish_to_route, RelayOutcome};
use crate::routing::{file_chunk_key, session_key, RouteTarget};
use crate::state::AppState;
use crate::ws::ConnState;

/// Advisory state of a chunk as last reported by some peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    Requested,
    Owned,
    Lost,
}

/// Stored chunk record: state plus the peer that reported it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub state: ChunkState,
    pub peer: String,
}

/// Handle `fileChunkOwned`: record the hint, relay to the target.
pub async fn handle_chunk_owned(
    payload: ChunkOwned,
    state: &AppState,
    conn: &ConnState,
) -> RelayOutcome {
    record_chunk(state, &payload.file, payload.chunk, ChunkState::Owned, &conn.user_id).await;

    let target = match resolve_session_route(state, &payload.user).await {
        Ok(target) => target,
        Err(outcome) => return outcome,
    };

    let mut out = payload;
    out.user = conn.user_id.clone();
    forward(state, conn, &target, ServerMessage::FileChunkOwned(out)).await
}

/// Handle `fileChunkLost`: record the hint, relay to the target.
pub async fn handle_chunk_lost(
    payload: ChunkLost,
    state: &AppState,
    conn: &ConnState,
) -> RelayOutcome {
    record_chunk(state, &payload.file, payload.chunk, ChunkState::Lost, &conn.user_id).await;

    let target = match resolve_session_route(state, &payload.user).await {
        Ok(target) => target,
        Err(outcome) => return outcome,
    };

    let mut out = payload;
    out.user = conn.user_id.clone();
    forward(state, conn, &target, ServerMessage::FileChunkLost(out)).await
}

/// Handle `fileChunkRequest`. When the downloader names no peer, the
/// current owner is resolved from the advisory chunk record; no record
/// means there is nobody to route to.
pub async fn handle_chunk_request(
    payload: ChunkRequest,
    state: &AppState,
    conn: &ConnState,
) -> RelayOutcome {
    let existing = match read_chunk_record(state, &payload.file, payload.chunk).await {
        Ok(record) => record,
        Err(outcome) => match &payload.user {
            // With an explicit target the record is only a hint;
            // resolve_session_route decides whether relay is possible.
            Some(_) => None,
            None => return outcome,
        },
    };

    let target_user = match &payload.user {
        Some(user) => user.clone(),
        None => match &existing {
            Some(record) if record.state == ChunkState::Owned => record.peer.clone(),
            _ => return RelayOutcome::DropNoRoute,
        },
    };

    // A live ownership hint outranks the request marker, so later
    // target-less requests for this chunk still resolve to the owner.
    if !matches!(&existing, Some(record) if record.state == ChunkState::Owned) {
        record_chunk(state, &payload.file, payload.chunk, ChunkState::Requested, &conn.user_id).await;
    }

    let target = match resolve_session_route(state, &target_user).await {
        Ok(target) => target,
        Err(outcome) => return outcome,
    };

    let mut out = payload;
    out.user = Some(conn.user_id.clone());
    forward(state, conn, &target, ServerMessage::FileChunkRequest(out)).await
}

/// Handle `fileStreamRtc`: relay the opaque negotiation blob.
pub async fn handle_file_rtc(
    payload: FileRtc,
    state: &AppState,
    conn: &ConnState,
) -> RelayOutcome {
    let target = match resolve_session_route(state, &payload.user).await {
        Ok(target) => target,
        Err(outcome) => return outcome,
    };

    let mut out = payload;
    out.user = conn.user_id.clone();
    forward(state, conn, &target, ServerMessage::FileStreamRtc(out)).await
}

/// Best-effort hint write. A failed write never blocks the relay.
async fn record_chunk(state: &AppState, file: &str, chunk: u32, chunk_state: ChunkState, peer: &str) {
    let record = ChunkRecord {
        state: chunk_state,
        peer: peer.to_string(),
    };
    let Ok(value) = serde_json::to_string(&record) else {
        return;
    };
    if let Err(e) = state
        .store
        .set(&file_chunk_key(file, chunk), &value, state.route_ttl_secs)
        .await
    {
        tracing::debug!(file = %file, chunk = chunk, error = %e, "chunk record write failed");
    }
}

async fn read_chunk_record(
    state: &AppState,
    file: &str,
    chunk: u32,
) -> Result<Option<ChunkRecord>, RelayOutcome> {
    match state.store.get(&file_chunk_key(file, chunk)).await {
        Ok(Some(value)) => Ok(serde_json::from_str(&value).ok()),
        Ok(None) => Ok(None),
        Err(e) => {
            tracing::warn!(file = %file, chunk = chunk, error = %e, "chunk record read failed");
            Err(RelayOutcome::DropInfra)
        }
    }
}

/// Resolve the target's live session route (`ws:<user>`).
async fn resolve_session_route(
    state: &AppState,
    target_user: &str,
) -> Result<RouteTarget, RelayOutcome> {
    match state.store.get(&session_key(target_user)).await {
        Ok(Some(value)) => match RouteTarget::decode(&value) {
            Some(target) => Ok(target),
            None => Err(RelayOutcome::DropNoRoute),
        },
        Ok(None) => Err(RelayOutcome::DropNoRoute),
        Err(e) => {
            tracing::warn!(target = %target_user, error = %e, "session route read failed");
            Err(RelayOutcome::DropInfra)
        }
    }
}

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{MemoryBus, RelayBus, RelayFrame};
    use crate::routing::MemoryStore;
    use crate::ws::new_connection_registry;
    use std::sync::Arc;

    const UPLOADER: &str = "aaaaaaaaaaaaaaaaaaaaaaaa";
    const DOWNLOADER: &str = "bbbbbbbbbbbbbbbbbbbbbbbb";
    const FILE: &str = "cccccccccccccccccccccccc";

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

    fn conn_for(user: &str, conn_id: &str) -> ConnState {
        ConnState {
            conn_id: conn_id.to_string(),
            user_id: user.to_string(),
            voice_channel: None,
        }
    }

    async fn register_session(state: &AppState, user: &str, conn_id: &str) {
        let route = RouteTarget {
            topic: "gw:test".to_string(),
            conn: conn_id.to_string(),
        };
        state
            .store
            .set(&session_key(user), &route.encode().unwrap(), 60)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn chunk_owned_records_hint_and_relays() {
        let state = test_state();
        register_session(&state, DOWNLOADER, "conn-b").await;
        let uploader = conn_for(UPLOADER, "conn-a");
        let mut rx = state.bus.subscribe("gw:test").await.unwrap();

        let outcome = handle_chunk_owned(
            ChunkOwned {
                file: FILE.to_string(),
                chunk: 3,
                user: DOWNLOADER.to_string(),
            },
            &state,
            &uploader,
        )
        .await;
        assert_eq!(outcome, RelayOutcome::Delivered);

        let frame: RelayFrame = serde_json::from_slice(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame.conn, "conn-b");
        let value: serde_json::Value = serde_json::from_str(&frame.body).unwrap();
        assert_eq!(value["t"], "fileChunkOwned");
        assert_eq!(value["d"]["user"], UPLOADER);

        let record: ChunkRecord = serde_json::from_str(
            &state
                .store
                .get(&file_chunk_key(FILE, 3))
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(record.state, ChunkState::Owned);
        assert_eq!(record.peer, UPLOADER);
    }

    #[tokio::test]
    async fn chunk_request_resolves_owner_from_record() {
        let state = test_state();
        register_session(&state, UPLOADER, "conn-a").await;
        let downloader = conn_for(DOWNLOADER, "conn-b");

        // The uploader announced ownership earlier; the downloader does
        // not name a peer.
        record_chunk(&state, FILE, 3, ChunkState::Owned, UPLOADER).await;
        let mut rx = state.bus.subscribe("gw:test").await.unwrap();

        let outcome = handle_chunk_request(
            ChunkRequest {
                file: FILE.to_string(),
                chunk: 3,
                user: None,
            },
            &state,
            &downloader,
        )
        .await;
        assert_eq!(outcome, RelayOutcome::Delivered);

        let frame: RelayFrame = serde_json::from_slice(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame.conn, "conn-a");
        let value: serde_json::Value = serde_json::from_str(&frame.body).unwrap();
        assert_eq!(value["t"], "fileChunkRequest");
        assert_eq!(value["d"]["user"], DOWNLOADER);
    }

    #[tokio::test]
    async fn repeated_requests_keep_resolving_the_owner() {
        let state = test_state();
        register_session(&state, UPLOADER, "conn-a").await;
        let downloader = conn_for(DOWNLOADER, "conn-b");

        record_chunk(&state, FILE, 3, ChunkState::Owned, UPLOADER).await;

        let request = ChunkRequest {
            file: FILE.to_string(),
            chunk: 3,
            user: None,
        };
        let outcome = handle_chunk_request(request.clone(), &state, &downloader).await;
        assert_eq!(outcome, RelayOutcome::Delivered);

        // The ownership hint survives the request, so a later
        // target-less request still finds the owner.
        let record: ChunkRecord = serde_json::from_str(
            &state
                .store
                .get(&file_chunk_key(FILE, 3))
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(record.state, ChunkState::Owned);
        assert_eq!(record.peer, UPLOADER);

        let outcome = handle_chunk_request(request, &state, &downloader).await;
        assert_eq!(outcome, RelayOutcome::Delivered);
    }

    #[tokio::test]
    async fn chunk_request_without_record_or_target_is_drop() {
        let state = test_state();
        let downloader = conn_for(DOWNLOADER, "conn-b");

        let outcome = handle_chunk_request(
            ChunkRequest {
                file: FILE.to_string(),
                chunk: 9,
                user: None,
            },
            &state,
            &downloader,
        )
        .await;
        assert_eq!(outcome, RelayOutcome::DropNoRoute);
    }

    #[tokio::test]
    async fn relay_to_disconnected_peer_is_drop() {
        let state = test_state();
        let uploader = conn_for(UPLOADER, "conn-a");

        let outcome = handle_file_rtc(
            FileRtc {
                file: FILE.to_string(),
                user: DOWNLOADER.to_string(),
                payload: vec![9, 9],
                initiator: true,
            },
            &state,
            &uploader,
        )
        .await;
        assert_eq!(outcome, RelayOutcome::DropNoRoute);
    }
}
