//! Inbound message dispatcher.
//!
//! Parses the `{t, d}` envelope, matches the client tag table, decodes
//! and validates the payload, and routes to the coordinator handlers.
//!
//! Failure handling is deliberately asymmetric: a structural or format
//! failure closes the connection with reason `"invalid-data"` (fail
//! closed against malformed or malicious input), while membership and
//! routing misses are silent drops (legitimate late-arriving signaling
//! during channel transitions must not be fatal).

use axum::extract::ws::{CloseFrame, Message};

use crate::files::transfer;
use crate::proto::{
    decode_payload, ChunkLost, ChunkOwned, ChunkRequest, ClientEnvelope, FileRtc, ServerMessage,
    StreamIce, StreamSdp, ValidationError, VoiceStart, VoiceStop, CLOSE_REASON_INVALID_DATA,
};
use crate::relay::RelayOutcome;
use crate::state::AppState;
use crate::voice::signaling;
use crate::ws::{ConnState, ConnectionSender};

/// What the actor should do after a message has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Continue,
    /// Fail-closed: the close envelope has been queued; terminate.
    Close,
}

/// Handle one inbound text frame.
pub async fn handle_text_message(
    text: &str,
    tx: &ConnectionSender,
    state: &AppState,
    conn: &mut ConnState,
) -> Handled {
    let envelope: ClientEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            return close_invalid(
                tx,
                conn,
                "<envelope>",
                &ValidationError {
                    field: "envelope",
                    detail: e.to_string(),
                },
            );
        }
    };

    let tag = envelope.t;
    match tag.as_str() {
        "voiceStart" => match decode_payload::<VoiceStart>(envelope.d) {
            Ok(payload) => {
                signaling::handle_voice_start(payload, state, conn).await;
                Handled::Continue
            }
            Err(e) => close_invalid(tx, conn, &tag, &e),
        },
        "voiceStop" => match decode_payload::<VoiceStop>(envelope.d) {
            Ok(_) => {
                signaling::handle_voice_stop(state, conn).await;
                Handled::Continue
            }
            Err(e) => close_invalid(tx, conn, &tag, &e),
        },
        "voiceStreamSdp" => match decode_payload::<StreamSdp>(envelope.d) {
            Ok(payload) => {
                let outcome = signaling::relay_stream_sdp(payload, state, conn).await;
                log_outcome(&tag, conn, outcome);
                Handled::Continue
            }
            Err(e) => close_invalid(tx, conn, &tag, &e),
        },
        "voiceStreamIce" => match decode_payload::<StreamIce>(envelope.d) {
            Ok(payload) => {
                let outcome = signaling::relay_stream_ice(payload, state, conn).await;
                log_outcome(&tag, conn, outcome);
                Handled::Continue
            }
            Err(e) => close_invalid(tx, conn, &tag, &e),
        },
        "fileChunkOwned" => match decode_payload::<ChunkOwned>(envelope.d) {
            Ok(payload) => {
                let outcome = transfer::handle_chunk_owned(payload, state, conn).await;
                log_outcome(&tag, conn, outcome);
                Handled::Continue
            }
            Err(e) => close_invalid(tx, conn, &tag, &e),
        },
        "fileChunkLost" => match decode_payload::<ChunkLost>(envelope.d) {
            Ok(payload) => {
                let outcome = transfer::handle_chunk_lost(payload, state, conn).await;
                log_outcome(&tag, conn, outcome);
                Handled::Continue
            }
            Err(e) => close_invalid(tx, conn, &tag, &e),
        },
        "fileChunkRequest" => match decode_payload::<ChunkRequest>(envelope.d) {
            Ok(payload) => {
                let outcome = transfer::handle_chunk_request(payload, state, conn).await;
                log_outcome(&tag, conn, outcome);
                Handled::Continue
            }
            Err(e) => close_invalid(tx, conn, &tag, &e),
        },
        "fileStreamRtc" => match decode_payload::<FileRtc>(envelope.d) {
            Ok(payload) => {
                let outcome = transfer::handle_file_rtc(payload, state, conn).await;
                log_outcome(&tag, conn, outcome);
                Handled::Continue
            }
            Err(e) => close_invalid(tx, conn, &tag, &e),
        },
        // No handler registered for this tag (includes server-namespace
        // tags a client must never send): drop, don't judge the payload.
        _ => {
            tracing::debug!(user_id = %conn.user_id, tag = %tag, "unhandled message type, dropped");
            Handled::Continue
        }
    }
}

fn log_outcome(tag: &str, conn: &ConnState, outcome: RelayOutcome) {
    // Drops short of infra failure are expected under membership races
    // and are not errors.
    tracing::debug!(
        user_id = %conn.user_id,
        tag = %tag,
        outcome = outcome.as_str(),
        "relay handled"
    );
}

/// Queue the close envelope and a WS close frame, then tell the actor
/// to terminate. Malformed input is never partially processed.
fn close_invalid(
    tx: &ConnectionSender,
    conn: &ConnState,
    tag: &str,
    err: &ValidationError,
) -> Handled {
    tracing::warn!(
        user_id = %conn.user_id,
        tag = %tag,
        error = %err,
        "payload failed validation, closing connection"
    );

    if let Ok(body) = ServerMessage::invalid_data_close().to_wire() {
        let _ = tx.send(Message::Text(body.into()));
    }
    let _ = tx.send(Message::Close(Some(CloseFrame {
        code: 1008,
        reason: CLOSE_REASON_INVALID_DATA.into(),
    })));
    Handled::Close
}
