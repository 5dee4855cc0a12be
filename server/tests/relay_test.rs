//! Integration tests for voice channel membership and signaling relay
//! between peers, including teardown and stale-route behavior.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use switchboard_server::relay::{self, MemoryBus, RelayBus};
use switchboard_server::routing::{self, MemoryStore, RoutingStore};
use switchboard_server::state::AppState;
use switchboard_server::{auth, routes, ws};

const USER_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaa";
const USER_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbb";

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsWrite = futures_util::stream::SplitSink<WsStream, Message>;
type WsRead = futures_util::stream::SplitStream<WsStream>;

async fn start_test_server() -> (SocketAddr, AppState) {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();
    let jwt_secret =
        auth::jwt::load_or_generate_jwt_secret(&data_dir).expect("Failed to generate secret");

    let bus: Arc<dyn RelayBus> = Arc::new(MemoryBus::new());
    let connections = ws::new_connection_registry();
    let process_topic = relay::process_topic("test");
    let ingress_rx = bus.subscribe(&process_topic).await.unwrap();
    tokio::spawn(relay::ingress::run(ingress_rx, connections.clone()));

    let state = AppState {
        connections,
        store: Arc::new(MemoryStore::new()),
        bus,
        jwt_secret,
        process_topic,
        route_ttl_secs: 60,
    };

    let app = routes::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
        let _keep = tmp_dir;
    });

    (addr, state)
}

async fn connect_user(addr: SocketAddr, secret: &[u8], user: &str) -> (WsWrite, WsRead) {
    let token = auth::jwt::issue_access_token(secret, user).expect("token");
    let ws_url = format!("ws://{}/ws?token={}", addr, token);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect("Failed to connect to WebSocket");
    ws_stream.split()
}

async fn send_envelope(write: &mut WsWrite, t: &str, d: Value) {
    let frame = json!({ "t": t, "d": d }).to_string();
    write.send(Message::Text(frame.into())).await.expect("send");
}

async fn recv_envelope(read: &mut WsRead) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(2), read.next())
        .await
        .expect("Expected message within timeout")
        .expect("Stream ended")
        .expect("WebSocket error");
    match msg {
        Message::Text(text) => serde_json::from_str(text.as_str()).expect("valid JSON"),
        other => panic!("Expected text frame, got: {:?}", other),
    }
}

async fn assert_silent(read: &mut WsRead) {
    let result = tokio::time::timeout(Duration::from_millis(400), read.next()).await;
    assert!(result.is_err(), "Expected no delivery, got: {:?}", result);
}

async fn join_channel(write: &mut WsWrite, channel: &str) {
    send_envelope(write, "voiceStart", json!({ "channel": channel })).await;
}

// Joins are processed asynchronously on the server side.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn test_ice_candidate_relayed_between_channel_peers() {
    let (addr, state) = start_test_server().await;
    let (mut write_a, mut _read_a) = connect_user(addr, &state.jwt_secret, USER_A).await;
    let (mut write_b, mut read_b) = connect_user(addr, &state.jwt_secret, USER_B).await;

    join_channel(&mut write_a, "c1").await;
    join_channel(&mut write_b, "c1").await;
    settle().await;

    send_envelope(
        &mut write_a,
        "voiceStreamIce",
        json!({
            "user": USER_B,
            "type": "audio",
            "candidate": [1, 2, 3],
            "initiator": true,
        }),
    )
    .await;

    // B receives the candidate with the sender's identity substituted in
    let received = recv_envelope(&mut read_b).await;
    assert_eq!(
        received,
        json!({
            "t": "voiceStreamIce",
            "d": {
                "user": USER_A,
                "type": "audio",
                "candidate": [1, 2, 3],
                "initiator": true,
            }
        })
    );
}

#[tokio::test]
async fn test_sdp_offer_relayed_between_channel_peers() {
    let (addr, state) = start_test_server().await;
    let (mut write_a, mut read_a) = connect_user(addr, &state.jwt_secret, USER_A).await;
    let (mut write_b, mut _read_b) = connect_user(addr, &state.jwt_secret, USER_B).await;

    join_channel(&mut write_a, "buildroom").await;
    join_channel(&mut write_b, "buildroom").await;
    settle().await;

    send_envelope(
        &mut write_b,
        "voiceStreamSdp",
        json!({
            "user": USER_A,
            "type": "displayVideo",
            "sdp": [118, 61, 48],
            "initiator": false,
        }),
    )
    .await;

    let received = recv_envelope(&mut read_a).await;
    assert_eq!(received["t"], "voiceStreamSdp");
    assert_eq!(received["d"]["user"], USER_B);
    assert_eq!(received["d"]["type"], "displayVideo");
    assert_eq!(received["d"]["sdp"], json!([118, 61, 48]));
    assert_eq!(received["d"]["initiator"], false);
}

#[tokio::test]
async fn test_relay_to_departed_peer_is_dropped() {
    let (addr, state) = start_test_server().await;
    let (mut write_a, mut read_a) = connect_user(addr, &state.jwt_secret, USER_A).await;
    let (mut write_b, mut read_b) = connect_user(addr, &state.jwt_secret, USER_B).await;

    join_channel(&mut write_a, "c1").await;
    join_channel(&mut write_b, "c1").await;
    settle().await;

    send_envelope(&mut write_b, "voiceStop", json!({})).await;
    settle().await;

    send_envelope(
        &mut write_a,
        "voiceStreamIce",
        json!({
            "user": USER_B,
            "type": "audio",
            "candidate": [9],
            "initiator": true,
        }),
    )
    .await;

    // Well-formed but undeliverable: dropped silently, sender stays open
    assert_silent(&mut read_b).await;
    assert_silent(&mut read_a).await;
}

#[tokio::test]
async fn test_sender_outside_channel_is_dropped() {
    let (addr, state) = start_test_server().await;
    let (mut write_a, mut read_a) = connect_user(addr, &state.jwt_secret, USER_A).await;
    let (mut write_b, mut read_b) = connect_user(addr, &state.jwt_secret, USER_B).await;

    // Only B joins; A never did
    join_channel(&mut write_b, "c1").await;
    settle().await;

    send_envelope(
        &mut write_a,
        "voiceStreamIce",
        json!({
            "user": USER_B,
            "type": "audio",
            "candidate": [1],
            "initiator": true,
        }),
    )
    .await;

    assert_silent(&mut read_b).await;
    assert_silent(&mut read_a).await;
}

#[tokio::test]
async fn test_no_stale_delivery_after_rejoin_elsewhere() {
    let (addr, state) = start_test_server().await;
    let (mut write_a, mut _read_a) = connect_user(addr, &state.jwt_secret, USER_A).await;
    let (mut write_b, mut read_b) = connect_user(addr, &state.jwt_secret, USER_B).await;

    join_channel(&mut write_a, "c1").await;
    join_channel(&mut write_b, "c1").await;
    settle().await;

    // B moves to a different channel; a rejoin implies leaving the old one
    join_channel(&mut write_b, "c2").await;
    settle().await;

    send_envelope(
        &mut write_a,
        "voiceStreamIce",
        json!({
            "user": USER_B,
            "type": "audio",
            "candidate": [5, 6],
            "initiator": false,
        }),
    )
    .await;

    assert_silent(&mut read_b).await;
}

#[tokio::test]
async fn test_disconnect_clears_routing_entries() {
    let (addr, state) = start_test_server().await;
    let (mut write_a, mut _read_a) = connect_user(addr, &state.jwt_secret, USER_A).await;
    let (mut write_b, mut read_b) = connect_user(addr, &state.jwt_secret, USER_B).await;

    join_channel(&mut write_a, "c1").await;
    join_channel(&mut write_b, "c1").await;
    settle().await;

    write_a.send(Message::Close(None)).await.expect("close");
    settle().await;

    // Session and voice entries for A are gone from the store
    assert!(state
        .store
        .get(&routing::session_key(USER_A))
        .await
        .unwrap()
        .is_none());
    assert!(state
        .store
        .get(&routing::voice_ws_key(USER_A))
        .await
        .unwrap()
        .is_none());
    assert!(state
        .store
        .get(&routing::voice_channel_key(USER_A))
        .await
        .unwrap()
        .is_none());

    // A relay attempt toward A now drops without closing B
    send_envelope(
        &mut write_b,
        "voiceStreamIce",
        json!({
            "user": USER_A,
            "type": "audio",
            "candidate": [7],
            "initiator": true,
        }),
    )
    .await;
    assert_silent(&mut read_b).await;
}

#[tokio::test]
async fn test_voice_join_writes_membership_entries() {
    let (addr, state) = start_test_server().await;
    let (mut write_a, mut _read_a) = connect_user(addr, &state.jwt_secret, USER_A).await;

    join_channel(&mut write_a, "standup").await;
    settle().await;

    let channel = state
        .store
        .get(&routing::voice_channel_key(USER_A))
        .await
        .unwrap();
    assert_eq!(channel.as_deref(), Some("standup"));
    assert!(state
        .store
        .get(&routing::voice_ws_key(USER_A))
        .await
        .unwrap()
        .is_some());
}
