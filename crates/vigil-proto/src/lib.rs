//! Wire contract between the vigil client core and the alert backend.
//! Keeping this in a dedicated crate lets test harnesses speak the same
//! frames as the client without pulling in the runtime code.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of a subscribable event stream.
pub type ChannelId = String;

/// Per-channel sequence number assigned by the backend. Starts at 1;
/// `0` always means "nothing applied yet".
pub type Seq = u64;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("frame encode failed: {0}")]
    Encode(serde_json::Error),
    #[error("frame decode failed: {0}")]
    Decode(serde_json::Error),
    #[error("frame is not valid utf-8")]
    NotUtf8,
}

/// One event as it travels on the wire. The payload is opaque to the
/// sync layer; only `channel` and `seq` participate in routing and
/// dedup decisions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventFrame {
    pub channel: ChannelId,
    pub seq: Seq,
    pub payload: serde_json::Value,
    pub timestamp_ms: i64,
}

/// Resume cursor for one channel, sent inside a subscribe frame. The
/// backend replays everything after `resume_from_seq`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResumePoint {
    pub channel: ChannelId,
    pub resume_from_seq: Seq,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        client: String,
        channels: Vec<ResumePoint>,
    },
    Unsubscribe {
        channel: ChannelId,
    },
    BackfillRequest {
        channel: ChannelId,
        from_seq: Seq,
        to_seq: Seq,
    },
    Ping {
        timestamp_ms: i64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Event(EventFrame),
    Backfill {
        channel: ChannelId,
        from_seq: Seq,
        to_seq: Seq,
        events: Vec<EventFrame>,
        /// False when the backend truncated the range; the client is
        /// expected to re-request the remainder.
        complete: bool,
    },
    SubscribeAck {
        channels: Vec<ChannelId>,
    },
    Pong {
        timestamp_ms: i64,
    },
    Error {
        code: ErrorCode,
        message: String,
        recoverable: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    pub const INVALID_FRAME: Self = Self(1001);
    pub const UNKNOWN_CHANNEL: Self = Self(1002);

    pub const BACKFILL_UNAVAILABLE: Self = Self(2001);
    pub const BACKFILL_RANGE_TOO_LARGE: Self = Self(2002);

    pub const TOO_MANY_CHANNELS: Self = Self(4001);
    pub const RATE_LIMIT_EXCEEDED: Self = Self(4002);

    pub const INTERNAL_ERROR: Self = Self(5001);
}

impl Serialize for ErrorCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let code = u16::deserialize(deserializer)?;
        Ok(ErrorCode(code))
    }
}

pub fn encode_client(frame: &ClientFrame) -> Result<String, ProtoError> {
    serde_json::to_string(frame).map_err(ProtoError::Encode)
}

pub fn encode_server(frame: &ServerFrame) -> Result<String, ProtoError> {
    serde_json::to_string(frame).map_err(ProtoError::Encode)
}

pub fn decode_client(raw: &[u8]) -> Result<ClientFrame, ProtoError> {
    let text = std::str::from_utf8(raw).map_err(|_| ProtoError::NotUtf8)?;
    serde_json::from_str(text).map_err(ProtoError::Decode)
}

pub fn decode_server(raw: &[u8]) -> Result<ServerFrame, ProtoError> {
    let text = std::str::from_utf8(raw).map_err(|_| ProtoError::NotUtf8)?;
    serde_json::from_str(text).map_err(ProtoError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subscribe_frame_shape() {
        let frame = ClientFrame::Subscribe {
            client: "client-1".into(),
            channels: vec![ResumePoint {
                channel: "front-door".into(),
                resume_from_seq: 42,
            }],
        };
        let encoded = encode_client(&frame).expect("encode");
        let value: serde_json::Value = serde_json::from_str(&encoded).expect("json");
        assert_eq!(value["type"], "subscribe");
        assert_eq!(value["channels"][0]["channel"], "front-door");
        assert_eq!(value["channels"][0]["resume_from_seq"], 42);
    }

    #[test]
    fn event_frame_round_trip() {
        let raw = json!({
            "type": "event",
            "channel": "garage",
            "seq": 7,
            "payload": {"kind": "motion", "zone": 2},
            "timestamp_ms": 1700000000000_i64,
        })
        .to_string();
        match decode_server(raw.as_bytes()).expect("decode") {
            ServerFrame::Event(event) => {
                assert_eq!(event.channel, "garage");
                assert_eq!(event.seq, 7);
                assert_eq!(event.payload["kind"], "motion");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn backfill_response_round_trip() {
        let frame = ServerFrame::Backfill {
            channel: "garage".into(),
            from_seq: 3,
            to_seq: 4,
            events: vec![
                EventFrame {
                    channel: "garage".into(),
                    seq: 3,
                    payload: json!({"kind": "motion"}),
                    timestamp_ms: 1,
                },
                EventFrame {
                    channel: "garage".into(),
                    seq: 4,
                    payload: json!({"kind": "person"}),
                    timestamp_ms: 2,
                },
            ],
            complete: true,
        };
        let encoded = encode_server(&frame).expect("encode");
        let decoded = decode_server(encoded.as_bytes()).expect("decode");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn error_codes_survive_serialization() {
        let frame = ServerFrame::Error {
            code: ErrorCode::BACKFILL_UNAVAILABLE,
            message: "range expired".into(),
            recoverable: true,
        };
        let encoded = encode_server(&frame).expect("encode");
        let value: serde_json::Value = serde_json::from_str(&encoded).expect("json");
        assert_eq!(value["code"], 2001);
        match decode_server(encoded.as_bytes()).expect("decode") {
            ServerFrame::Error { code, .. } => assert_eq!(code, ErrorCode::BACKFILL_UNAVAILABLE),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(decode_server(b"{\"type\":\"mystery\"}").is_err());
        assert!(decode_server(b"not json at all").is_err());
        assert!(decode_client(&[0xff, 0xfe]).is_err());
    }
}
