//! Binary channel protocol between clients and the shared-state server.
//!
//! Wire format (bincode-encoded `ChannelMessage`, one per WebSocket binary frame):
//! ```text
//! ┌──────────┬───────────┬──────────┬────────────┬───────────┬──────────┐
//! │ kind     │ peer_id   │ doc_id   │ request_id │ timestamp │ payload  │
//! │ 1 byte   │ 16 bytes  │ string   │ varint     │ varint    │ variable │
//! └──────────┴───────────┴──────────┴────────────┴───────────┴──────────┘
//! ```
//!
//! `request_id == 0` marks a message that expects no acknowledgement.
//! Document bodies travel inside `payload` as JSON; the channel layer never
//! looks inside them.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Message kinds for the channel protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Subscribe to a document channel
    Join = 1,
    /// Release the document subscription
    Leave = 2,
    /// Server acknowledgement of a request
    Ack = 3,
    /// Whole-document change blob
    Update = 4,
    /// Peer count after someone joined
    PeerJoined = 5,
    /// Peer count after someone left
    PeerLeft = 6,
    /// The document was deleted by a peer
    DocumentDeleted = 7,
    /// Server hint that clients should persist now
    SaveRequested = 8,
    Create = 9,
    Get = 10,
    UpdateMetadata = 11,
    UpdateNodes = 12,
    UpdateEdges = 13,
    UpdateViewport = 14,
    Save = 15,
    /// Bulk replace of the server-side document
    Load = 16,
    /// Lobby-scoped deletion notice (no subscription required)
    NotifyDeleted = 17,
    Ping = 18,
    Pong = 19,
}

/// Result carried by an `Ack`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AckBody {
    /// Accepted; optionally the resulting full document state (JSON).
    Ok(Option<Vec<u8>>),
    /// Refused, with a reason.
    Rejected(String),
}

/// Title/description carried by `Create` and `UpdateMetadata`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Acknowledged document operations a client may push.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOp {
    Create { title: String, description: Option<String> },
    Get,
    UpdateMetadata(MetadataUpdate),
    /// JSON array of nodes
    UpdateNodes(Vec<u8>),
    /// JSON array of edges
    UpdateEdges(Vec<u8>),
    /// JSON viewport object
    UpdateViewport(Vec<u8>),
    Save,
    /// JSON document payload replacing the server copy
    Load(Vec<u8>),
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub kind: MessageKind,
    pub peer_id: Uuid,
    /// Document scope; empty for connection-level messages
    pub doc_id: String,
    pub request_id: u64,
    /// Milliseconds since epoch, set by the originator
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

fn encode_payload<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).unwrap_or_default()
}

impl ChannelMessage {
    fn new(kind: MessageKind, peer_id: Uuid, doc_id: impl Into<String>) -> Self {
        Self {
            kind,
            peer_id,
            doc_id: doc_id.into(),
            request_id: 0,
            timestamp: loom_core::now_millis(),
            payload: Vec::new(),
        }
    }

    pub fn join(peer_id: Uuid, doc_id: &str) -> Self {
        Self::new(MessageKind::Join, peer_id, doc_id)
    }

    pub fn leave(peer_id: Uuid, doc_id: &str) -> Self {
        Self::new(MessageKind::Leave, peer_id, doc_id)
    }

    /// Create a change broadcast.
    pub fn update(peer_id: Uuid, doc_id: &str, change: Vec<u8>, timestamp: u64) -> Self {
        Self {
            timestamp,
            payload: change,
            ..Self::new(MessageKind::Update, peer_id, doc_id)
        }
    }

    /// Server acknowledgement for `request_id`.
    pub fn ack(doc_id: &str, request_id: u64, body: &AckBody) -> Self {
        Self {
            request_id,
            payload: encode_payload(body),
            ..Self::new(MessageKind::Ack, Uuid::nil(), doc_id)
        }
    }

    pub fn peer_joined(peer_id: Uuid, doc_id: &str, peer_count: u32) -> Self {
        Self {
            payload: encode_payload(&peer_count),
            ..Self::new(MessageKind::PeerJoined, peer_id, doc_id)
        }
    }

    pub fn peer_left(peer_id: Uuid, doc_id: &str, peer_count: u32) -> Self {
        Self {
            payload: encode_payload(&peer_count),
            ..Self::new(MessageKind::PeerLeft, peer_id, doc_id)
        }
    }

    pub fn document_deleted(peer_id: Uuid, doc_id: &str) -> Self {
        Self::new(MessageKind::DocumentDeleted, peer_id, doc_id)
    }

    pub fn save_requested(doc_id: &str) -> Self {
        Self::new(MessageKind::SaveRequested, Uuid::nil(), doc_id)
    }

    pub fn notify_deleted(peer_id: Uuid, doc_id: &str) -> Self {
        Self::new(MessageKind::NotifyDeleted, peer_id, doc_id)
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageKind::Ping, peer_id, "")
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageKind::Pong, peer_id, "")
    }

    /// Build the message for a document operation.
    pub fn push(peer_id: Uuid, doc_id: &str, op: PushOp) -> Self {
        let (kind, payload) = match op {
            PushOp::Create { title, description } => (
                MessageKind::Create,
                encode_payload(&MetadataUpdate {
                    title: Some(title),
                    description,
                }),
            ),
            PushOp::Get => (MessageKind::Get, Vec::new()),
            PushOp::UpdateMetadata(update) => (MessageKind::UpdateMetadata, encode_payload(&update)),
            PushOp::UpdateNodes(json) => (MessageKind::UpdateNodes, json),
            PushOp::UpdateEdges(json) => (MessageKind::UpdateEdges, json),
            PushOp::UpdateViewport(json) => (MessageKind::UpdateViewport, json),
            PushOp::Save => (MessageKind::Save, Vec::new()),
            PushOp::Load(json) => (MessageKind::Load, json),
        };
        Self {
            payload,
            ..Self::new(kind, peer_id, doc_id)
        }
    }

    /// Whether the server must answer this kind with an `Ack`.
    pub fn expects_ack(&self) -> bool {
        matches!(
            self.kind,
            MessageKind::Join
                | MessageKind::Update
                | MessageKind::Create
                | MessageKind::Get
                | MessageKind::UpdateMetadata
                | MessageKind::UpdateNodes
                | MessageKind::UpdateEdges
                | MessageKind::UpdateViewport
                | MessageKind::Save
                | MessageKind::Load
                | MessageKind::NotifyDeleted
        )
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the acknowledgement body.
    pub fn ack_body(&self) -> Result<AckBody, ProtocolError> {
        if self.kind != MessageKind::Ack {
            return Err(ProtocolError::InvalidMessageType);
        }
        self.decode_payload()
    }

    /// Parse the peer count of a join/leave notification.
    pub fn peer_count(&self) -> Result<u32, ProtocolError> {
        if !matches!(self.kind, MessageKind::PeerJoined | MessageKind::PeerLeft) {
            return Err(ProtocolError::InvalidMessageType);
        }
        self.decode_payload()
    }

    /// Parse the metadata of a `Create`/`UpdateMetadata` request.
    pub fn metadata(&self) -> Result<MetadataUpdate, ProtocolError> {
        if !matches!(self.kind, MessageKind::Create | MessageKind::UpdateMetadata) {
            return Err(ProtocolError::InvalidMessageType);
        }
        self.decode_payload()
    }

    fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let (value, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(value)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Request timed out")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_roundtrip() {
        let peer = Uuid::new_v4();
        let change = br#"{"nodes":[],"edges":[]}"#.to_vec();

        let msg = ChannelMessage::update(peer, "doc-1", change.clone(), 42);
        let decoded = ChannelMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, MessageKind::Update);
        assert_eq!(decoded.peer_id, peer);
        assert_eq!(decoded.doc_id, "doc-1");
        assert_eq!(decoded.timestamp, 42);
        assert_eq!(decoded.payload, change);
        assert_eq!(decoded.request_id, 0);
    }

    #[test]
    fn test_ack_bodies() {
        let ok = ChannelMessage::ack("d", 7, &AckBody::Ok(Some(b"{}".to_vec())));
        let decoded = ChannelMessage::decode(&ok.encode().unwrap()).unwrap();
        assert_eq!(decoded.request_id, 7);
        assert_eq!(decoded.peer_id, Uuid::nil());
        assert_eq!(decoded.ack_body().unwrap(), AckBody::Ok(Some(b"{}".to_vec())));

        let rejected = ChannelMessage::ack("d", 8, &AckBody::Rejected("room full".into()));
        assert_eq!(
            rejected.ack_body().unwrap(),
            AckBody::Rejected("room full".into())
        );
    }

    #[test]
    fn test_peer_count_payload() {
        let peer = Uuid::new_v4();
        let joined = ChannelMessage::peer_joined(peer, "d", 3);
        let decoded = ChannelMessage::decode(&joined.encode().unwrap()).unwrap();
        assert_eq!(decoded.peer_count().unwrap(), 3);

        let left = ChannelMessage::peer_left(peer, "d", 2);
        assert_eq!(left.peer_count().unwrap(), 2);
    }

    #[test]
    fn test_push_create_carries_metadata() {
        let msg = ChannelMessage::push(
            Uuid::new_v4(),
            "d",
            PushOp::Create {
                title: "Flow".into(),
                description: None,
            },
        );
        assert_eq!(msg.kind, MessageKind::Create);
        let meta = msg.metadata().unwrap();
        assert_eq!(meta.title.as_deref(), Some("Flow"));
        assert!(meta.description.is_none());
    }

    #[test]
    fn test_push_json_ops_pass_bytes_through() {
        let json = br#"[{"id":"n1"}]"#.to_vec();
        let msg = ChannelMessage::push(Uuid::new_v4(), "d", PushOp::UpdateNodes(json.clone()));
        assert_eq!(msg.kind, MessageKind::UpdateNodes);
        assert_eq!(msg.payload, json);
        assert!(msg.expects_ack());
    }

    #[test]
    fn test_expects_ack() {
        let peer = Uuid::new_v4();
        assert!(ChannelMessage::join(peer, "d").expects_ack());
        assert!(ChannelMessage::notify_deleted(peer, "d").expects_ack());
        assert!(!ChannelMessage::leave(peer, "d").expects_ack());
        assert!(!ChannelMessage::ping(peer).expects_ack());
        assert!(!ChannelMessage::save_requested("d").expects_ack());
    }

    #[test]
    fn test_invalid_message_type_error() {
        let msg = ChannelMessage::ping(Uuid::new_v4());
        assert_eq!(msg.ack_body(), Err(ProtocolError::InvalidMessageType));
        assert_eq!(msg.peer_count(), Err(ProtocolError::InvalidMessageType));
        assert_eq!(msg.metadata(), Err(ProtocolError::InvalidMessageType));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(ChannelMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_message_kind_values() {
        assert_eq!(MessageKind::Join as u8, 1);
        assert_eq!(MessageKind::Update as u8, 4);
        assert_eq!(MessageKind::NotifyDeleted as u8, 17);
        assert_eq!(MessageKind::Pong as u8, 19);
    }
}
