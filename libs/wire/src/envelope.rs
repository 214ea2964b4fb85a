//! Port Envelopes
//!
//! Every transport frame carries exactly one envelope. Envelopes are tagged
//! unions discriminated by a `type` field; each variant carries enough of
//! {endpoint, id, payload, error} to be routed without looking inside the
//! payload.
//!
//! ## Wire Shape
//!
//! ```json
//! { "type": "rpcCall", "endpoint": "echo", "callId": 3, "parameter": { "x": 1 } }
//! { "type": "signalUpdate", "subscribeId": 1, "patches": [], "tags": [] }
//! { "type": "keepAlive" }
//! ```

use crate::error::{SerializedError, WireError};
use crate::patch::Patch;
use crate::tag::WriteTag;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelopes sent by a client port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientToServerMessage {
    ChannelCreate {
        endpoint: String,
        channel_id: u64,
        creation_parameter: Value,
    },
    ChannelSend {
        channel_id: u64,
        message: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
    },
    ChannelAck {
        channel_id: u64,
        ack_id: u64,
    },
    ChannelCancel {
        channel_id: u64,
    },
    RpcCall {
        endpoint: String,
        call_id: u64,
        parameter: Value,
    },
    RpcCancel {
        call_id: u64,
    },
    SignalSubscribe {
        endpoint: String,
        subscribe_id: u64,
        creation_parameter: Value,
    },
    SignalUnsubscribe {
        subscribe_id: u64,
    },
    WritableSignalSubscribe {
        endpoint: String,
        subscribe_id: u64,
        creation_parameter: Value,
    },
    WritableSignalUnsubscribe {
        subscribe_id: u64,
    },
    WritableSignalUpdate {
        subscribe_id: u64,
        patches: Vec<Patch>,
        tags: Vec<WriteTag>,
    },
    CommunicationWarning {
        warning: String,
    },
    KeepAlive,
}

/// Envelopes sent by a server port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerToClientMessage {
    ChannelSend {
        channel_id: u64,
        message: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
    },
    ChannelAck {
        channel_id: u64,
        ack_id: u64,
    },
    ChannelClose {
        channel_id: u64,
    },
    ChannelError {
        channel_id: u64,
        error: SerializedError,
    },
    RpcResult {
        call_id: u64,
        result: Value,
    },
    RpcError {
        call_id: u64,
        error: SerializedError,
    },
    SignalUpdate {
        subscribe_id: u64,
        patches: Vec<Patch>,
        tags: Vec<WriteTag>,
    },
    SignalError {
        subscribe_id: u64,
        error: SerializedError,
    },
    WritableSignalUpdate {
        subscribe_id: u64,
        patches: Vec<Patch>,
        tags: Vec<WriteTag>,
    },
    /// A single rejected write; the subscription stays open
    WritableSignalWriteError {
        subscribe_id: u64,
        tags: Vec<WriteTag>,
        error: SerializedError,
    },
    WritableSignalError {
        subscribe_id: u64,
        error: SerializedError,
    },
    CommunicationWarning {
        warning: String,
    },
    KeepAliveAck,
}

macro_rules! impl_frame_codec {
    ($message:ty) => {
        impl $message {
            /// Encode into a single transport frame
            pub fn to_frame(&self) -> Result<Bytes, WireError> {
                serde_json::to_vec(self)
                    .map(Bytes::from)
                    .map_err(|e| WireError::encode_with_source("Failed to encode envelope", e))
            }

            /// Decode one transport frame
            pub fn from_frame(frame: &[u8]) -> Result<Self, WireError> {
                serde_json::from_slice(frame)
                    .map_err(|e| WireError::decode_with_source("Malformed envelope", e))
            }
        }
    };
}

impl_frame_codec!(ClientToServerMessage);
impl_frame_codec!(ServerToClientMessage);

impl ClientToServerMessage {
    /// Short variant name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChannelCreate { .. } => "channelCreate",
            Self::ChannelSend { .. } => "channelSend",
            Self::ChannelAck { .. } => "channelAck",
            Self::ChannelCancel { .. } => "channelCancel",
            Self::RpcCall { .. } => "rpcCall",
            Self::RpcCancel { .. } => "rpcCancel",
            Self::SignalSubscribe { .. } => "signalSubscribe",
            Self::SignalUnsubscribe { .. } => "signalUnsubscribe",
            Self::WritableSignalSubscribe { .. } => "writableSignalSubscribe",
            Self::WritableSignalUnsubscribe { .. } => "writableSignalUnsubscribe",
            Self::WritableSignalUpdate { .. } => "writableSignalUpdate",
            Self::CommunicationWarning { .. } => "communicationWarning",
            Self::KeepAlive => "keepAlive",
        }
    }
}

impl ServerToClientMessage {
    /// Short variant name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChannelSend { .. } => "channelSend",
            Self::ChannelAck { .. } => "channelAck",
            Self::ChannelClose { .. } => "channelClose",
            Self::ChannelError { .. } => "channelError",
            Self::RpcResult { .. } => "rpcResult",
            Self::RpcError { .. } => "rpcError",
            Self::SignalUpdate { .. } => "signalUpdate",
            Self::SignalError { .. } => "signalError",
            Self::WritableSignalUpdate { .. } => "writableSignalUpdate",
            Self::WritableSignalWriteError { .. } => "writableSignalWriteError",
            Self::WritableSignalError { .. } => "writableSignalError",
            Self::CommunicationWarning { .. } => "communicationWarning",
            Self::KeepAliveAck => "keepAliveAck",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PathKey;
    use serde_json::json;

    #[test]
    fn test_rpc_call_wire_shape() {
        let message = ClientToServerMessage::RpcCall {
            endpoint: "echo".into(),
            call_id: 3,
            parameter: json!({ "x": 1 }),
        };
        let encoded = serde_json::to_value(&message).unwrap();
        assert_eq!(
            encoded,
            json!({ "type": "rpcCall", "endpoint": "echo", "callId": 3, "parameter": { "x": 1 } })
        );
    }

    #[test]
    fn test_unit_variants_and_optional_ack() {
        let keep_alive = serde_json::to_value(ClientToServerMessage::KeepAlive).unwrap();
        assert_eq!(keep_alive, json!({ "type": "keepAlive" }));

        let send = ServerToClientMessage::ChannelSend {
            channel_id: 7,
            message: json!("hi"),
            ack_id: None,
        };
        assert_eq!(
            serde_json::to_value(&send).unwrap(),
            json!({ "type": "channelSend", "channelId": 7, "message": "hi" })
        );
    }

    #[test]
    fn test_frame_round_trip_preserves_patches() {
        let message = ServerToClientMessage::SignalUpdate {
            subscribe_id: 1,
            patches: vec![Patch::replace(vec![PathKey::from("count")], json!(1))],
            tags: vec!["abc".into()],
        };
        let frame = message.to_frame().unwrap();
        assert_eq!(ServerToClientMessage::from_frame(&frame).unwrap(), message);
    }

    #[test]
    fn test_unknown_type_is_a_decode_error() {
        let err = ClientToServerMessage::from_frame(br#"{"type":"teleport"}"#).unwrap_err();
        assert!(matches!(err, WireError::Decode { .. }));
    }
}
