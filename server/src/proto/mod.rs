//! Wire types for the `{t, d}` JSON envelope protocol.
//!
//! Client-originated and server-originated tags are distinct namespaces:
//! inbound frames are matched against the client tag table in the
//! dispatcher, outbound frames serialize through [`ServerMessage`].
//! Every inbound payload is decoded declaratively (serde struct with
//! `deny_unknown_fields`) and then format-checked via [`Validate`],
//! producing a structured [`ValidationError`] instead of ad hoc
//! per-field conditionals.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Close reason sent before terminating a connection that failed
/// structural or security validation.
pub const CLOSE_REASON_INVALID_DATA: &str = "invalid-data";

/// Maximum accepted length for a channel id.
const MAX_CHANNEL_ID_LEN: usize = 128;

/// Raw inbound envelope. The payload stays untyped until the tag has
/// been matched, so an unknown tag can be dropped without judging the
/// payload.
#[derive(Debug, Deserialize)]
pub struct ClientEnvelope {
    pub t: String,
    pub d: serde_json::Value,
}

/// Classification of a relayed media flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamKind {
    Audio,
    Video,
    DisplayVideo,
    DisplayAudio,
}

/// Local-track SDP offer/answer, relayed opaquely between call peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamSdp {
    /// Claimed target on the way in; rewritten to the authenticated
    /// sender on the way out.
    pub user: String,
    #[serde(rename = "type")]
    pub kind: StreamKind,
    pub sdp: Vec<u8>,
    pub initiator: bool,
}

/// Remote-track ICE candidate, relayed opaquely between call peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamIce {
    pub user: String,
    #[serde(rename = "type")]
    pub kind: StreamKind,
    pub candidate: Vec<u8>,
    pub initiator: bool,
}

/// Request to open a voice channel (Idle -> Joining -> Active).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VoiceStart {
    pub channel: String,
}

/// Request to leave the current voice channel (Active -> Idle).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VoiceStop {}

/// A peer announcing it holds a chunk of a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkOwned {
    pub file: String,
    pub chunk: u32,
    pub user: String,
}

/// A peer reporting a chunk it failed to obtain or no longer holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkLost {
    pub file: String,
    pub chunk: u32,
    pub user: String,
}

/// A downloader asking a peer for a chunk. When `user` is omitted the
/// coordinator resolves the current owner from the advisory chunk record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkRequest {
    pub file: String,
    pub chunk: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Opaque RTC-negotiation blob for a direct transfer channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileRtc {
    pub file: String,
    pub user: String,
    pub payload: Vec<u8>,
    pub initiator: bool,
}

/// Payload of the server-originated close envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseInfo {
    pub reason: String,
}

/// Server-originated envelope. Serializes to `{"t": <tag>, "d": <payload>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "d", rename_all = "camelCase")]
pub enum ServerMessage {
    VoiceStreamSdp(StreamSdp),
    VoiceStreamIce(StreamIce),
    FileChunkOwned(ChunkOwned),
    FileChunkLost(ChunkLost),
    FileChunkRequest(ChunkRequest),
    FileStreamRtc(FileRtc),
    Close(CloseInfo),
}

impl ServerMessage {
    /// Serialize to the wire text frame.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The close envelope sent before terminating a connection on
    /// validation failure.
    pub fn invalid_data_close() -> Self {
        ServerMessage::Close(CloseInfo {
            reason: CLOSE_REASON_INVALID_DATA.to_string(),
        })
    }
}

/// A structural or format failure in an inbound payload. Fatal to the
/// connection (closed with `"invalid-data"`), never to the process.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub field: &'static str,
    pub detail: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid field `{}`: {}", self.field, self.detail)
    }
}

/// Format checks applied after declarative decoding.
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationError>;
}

/// Protocol entity ids (users, files) are exactly 24 hex characters.
pub fn is_hex_id(s: &str) -> bool {
    s.len() == 24 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn check_hex_id(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if is_hex_id(value) {
        Ok(())
    } else {
        Err(ValidationError {
            field,
            detail: "expected exactly 24 hex characters".to_string(),
        })
    }
}

fn check_channel_id(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() || value.len() > MAX_CHANNEL_ID_LEN {
        return Err(ValidationError {
            field: "channel",
            detail: format!("expected 1..={} characters", MAX_CHANNEL_ID_LEN),
        });
    }
    Ok(())
}

impl Validate for StreamSdp {
    fn validate(&self) -> Result<(), ValidationError> {
        check_hex_id("user", &self.user)
    }
}

impl Validate for StreamIce {
    fn validate(&self) -> Result<(), ValidationError> {
        check_hex_id("user", &self.user)
    }
}

impl Validate for VoiceStart {
    fn validate(&self) -> Result<(), ValidationError> {
        check_channel_id(&self.channel)
    }
}

impl Validate for VoiceStop {
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

impl Validate for ChunkOwned {
    fn validate(&self) -> Result<(), ValidationError> {
        check_hex_id("file", &self.file)?;
        check_hex_id("user", &self.user)
    }
}

impl Validate for ChunkLost {
    fn validate(&self) -> Result<(), ValidationError> {
        check_hex_id("file", &self.file)?;
        check_hex_id("user", &self.user)
    }
}

impl Validate for ChunkRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        check_hex_id("file", &self.file)?;
        match &self.user {
            Some(user) => check_hex_id("user", user),
            None => Ok(()),
        }
    }
}

impl Validate for FileRtc {
    fn validate(&self) -> Result<(), ValidationError> {
        check_hex_id("file", &self.file)?;
        check_hex_id("user", &self.user)
    }
}

/// Decode a typed payload from the untyped envelope body and apply its
/// format checks. Any failure is a [`ValidationError`].
pub fn decode_payload<T>(d: serde_json::Value) -> Result<T, ValidationError>
where
    T: DeserializeOwned + Validate,
{
    let payload: T = serde_json::from_value(d).map_err(|e| ValidationError {
        field: "payload",
        detail: e.to_string(),
    })?;
    payload.validate()?;
    Ok(payload)
}
