//! Control and data frames exchanged over the bus.
//!
//! The wire format is JSON. Every request struct derives `Default` and
//! marks its fields `#[serde(default)]` so a frame with missing fields
//! still parses and is rejected by explicit validation rather than a
//! deserializer error; completely unparsable payloads fail in `decode` and
//! map to the invalid-request sentinels.

use serde::{Deserialize, Serialize};

/// Connect request sent to `<discover_prefix>.<cluster_id>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectRequest {
    #[serde(default)]
    pub client_id: String,
    /// Subject the broker pings for liveness; the client must reply.
    #[serde(default)]
    pub heartbeat_inbox: String,
}

/// Reply to a connect: the per-server control subjects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectResponse {
    #[serde(default)]
    pub pub_prefix: String,
    #[serde(default)]
    pub sub_requests: String,
    #[serde(default)]
    pub unsub_requests: String,
    #[serde(default)]
    pub close_requests: String,
    #[serde(default)]
    pub error: String,
}

/// Publish request sent to `<pub_prefix>.<channel>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PubMsg {
    #[serde(default)]
    pub client_id: String,
    /// Client-chosen correlation id, echoed back in the ack.
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PubAck {
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub error: String,
}

/// Where a new subscription starts reading the channel log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Only messages published after the subscribe.
    #[default]
    NewOnly,
    /// The current last message, then everything after it.
    LastReceived,
    /// Everything still in the log.
    First,
    /// From an explicit sequence.
    SequenceStart,
    /// From the oldest message younger than a delta.
    TimeDeltaStart,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub channel: String,
    /// Queue group name; empty for a plain subscription.
    #[serde(default)]
    pub queue_group: String,
    /// Durable name; empty for a non-durable subscription.
    #[serde(default)]
    pub durable_name: String,
    /// Subject the broker pushes data messages to.
    #[serde(default)]
    pub inbox: String,
    #[serde(default)]
    pub max_in_flight: i32,
    #[serde(default)]
    pub ack_wait_secs: i64,
    #[serde(default)]
    pub start_position: StartPosition,
    /// Used with `StartPosition::SequenceStart`.
    #[serde(default)]
    pub start_sequence: u64,
    /// Milliseconds back from now; used with `StartPosition::TimeDeltaStart`.
    #[serde(default)]
    pub start_time_delta_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionResponse {
    /// Subject the subscriber must send acks to.
    #[serde(default)]
    pub ack_inbox: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub channel: String,
    /// Identifies the subscription to remove.
    #[serde(default)]
    pub ack_inbox: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloseRequest {
    #[serde(default)]
    pub client_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloseResponse {
    #[serde(default)]
    pub error: String,
}

/// A data message pushed to a subscription's delivery inbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MsgProto {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub timestamp: i64,
    /// True on every retransmission.
    #[serde(default)]
    pub redelivered: bool,
}

/// Acknowledgement sent by a subscriber on its ack inbox. No reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AckProto {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub sequence: u64,
}

pub fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Client ids may only contain alphanumerics, `_` and `-`.
pub fn is_valid_client_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Channel names are dot-separated non-empty tokens without wildcards.
pub fn is_valid_channel(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|tok| {
            !tok.is_empty() && !tok.contains('*') && !tok.contains('>')
        })
}
