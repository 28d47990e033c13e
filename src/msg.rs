// File: msg.rs
//
// The purpose of this file is to define the message envelope exchanged
// between nodes: a tagged union over the application-layer and
// ring-control message types, each carrying its own typed payload.
// Decoding an unrecognized `type` tag is a hard error, not a silent drop.

use crate::hash::NodeId;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A reachable (ip, port) pair. Two addresses are equal iff they name the
/// same socket; `NodeInfo` pairs an address with the ring identifier it
/// hashes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    pub ip: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(ip: impl Into<String>, port: u16) -> PeerAddr {
        PeerAddr {
            ip: ip.into(),
            port,
        }
    }

    pub fn as_node_name(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// The triple (ip, port, id) that appears in `successor`, `predecessor`,
/// finger table entries, and the neighbor cache. A plain value: no shared
/// ownership, no internal cycles (only logical ones via identifiers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub addr: PeerAddr,
    pub id: NodeId,
}

impl NodeInfo {
    pub fn new(addr: PeerAddr, id: NodeId) -> NodeInfo {
        NodeInfo { addr, id }
    }

    /// An address is self-referential when its id equals `self_id`.
    pub fn is_self(&self, self_id: NodeId) -> bool {
        self.id == self_id
    }
}

pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// The message envelope exchanged between nodes. Each variant carries its
/// own typed payload; unknown `type` tags fail to deserialize instead of
/// being routed anywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    // ---- Application-layer types (§6) ----
    #[serde(rename = "JOIN")]
    Join {
        sender_id: String,
        sender_addr: PeerAddr,
        name: String,
        timestamp: f64,
    },
    #[serde(rename = "UPDATE")]
    Update {
        sender_id: String,
        successor: NodeInfo,
        timestamp: f64,
    },
    #[serde(rename = "PUT")]
    Put {
        sender_id: String,
        sender_addr: PeerAddr,
        request_id: u64,
        key: String,
        value: String,
        timestamp: f64,
    },
    #[serde(rename = "GET")]
    Get {
        sender_id: String,
        sender_addr: PeerAddr,
        request_id: u64,
        key: String,
        timestamp: f64,
    },
    #[serde(rename = "RESULT")]
    Result {
        sender_id: String,
        request_id: u64,
        key: String,
        value: Option<String>,
        found: bool,
        node: String,
        timestamp: f64,
    },
    #[serde(rename = "REPLICATE")]
    Replicate {
        sender_id: String,
        sender_addr: PeerAddr,
        request_id: u64,
        key: String,
        value: String,
        timestamp: f64,
    },
    #[serde(rename = "HEARTBEAT")]
    Heartbeat {
        sender_id: String,
        sender_addr: PeerAddr,
        timestamp: f64,
    },
    #[serde(rename = "ERROR")]
    Error {
        sender_id: String,
        request_id: Option<u64>,
        error: String,
        timestamp: f64,
    },

    // ---- Ring-control types (§4.2) ----
    #[serde(rename = "FIND_SUCCESSOR")]
    FindSuccessor {
        sender_id: String,
        sender_addr: PeerAddr,
        key_id: NodeId,
        /// Remote hop count so far; bounds recursion to at most the
        /// finger table width before falling back to the resolving
        /// node's own successor.
        hops: u32,
    },
    #[serde(rename = "SUCCESSOR_RESPONSE")]
    SuccessorResponse {
        sender_id: String,
        key_id: NodeId,
        successor: NodeInfo,
    },
    #[serde(rename = "JOIN_REQUEST")]
    JoinRequest {
        sender_id: String,
        new_node: NodeInfo,
    },
    #[serde(rename = "JOIN_RESPONSE")]
    JoinResponse {
        sender_id: String,
        successor: NodeInfo,
    },
    #[serde(rename = "NOTIFY")]
    Notify {
        sender_id: String,
        candidate: NodeInfo,
    },
    #[serde(rename = "GET_PREDECESSOR")]
    GetPredecessor {
        sender_id: String,
        sender_addr: PeerAddr,
    },
    #[serde(rename = "PREDECESSOR_RESPONSE")]
    PredecessorResponse {
        sender_id: String,
        predecessor: Option<NodeInfo>,
    },
    #[serde(rename = "UPDATE_PREDECESSOR")]
    UpdatePredecessor {
        sender_id: String,
        node: NodeInfo,
    },
    #[serde(rename = "UPDATE_SUCCESSOR")]
    UpdateSuccessor {
        sender_id: String,
        node: NodeInfo,
    },
    #[serde(rename = "ACK")]
    Ack {
        sender_id: String,
        request_id: Option<u64>,
        ok: bool,
        error: Option<String>,
    },
    #[serde(rename = "HEARTBEAT_ACK")]
    HeartbeatAck {
        sender_id: String,
        timestamp: f64,
    },
}

impl Message {
    /// A short name for this variant, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Join { .. } => "JOIN",
            Message::Update { .. } => "UPDATE",
            Message::Put { .. } => "PUT",
            Message::Get { .. } => "GET",
            Message::Result { .. } => "RESULT",
            Message::Replicate { .. } => "REPLICATE",
            Message::Heartbeat { .. } => "HEARTBEAT",
            Message::Error { .. } => "ERROR",
            Message::FindSuccessor { .. } => "FIND_SUCCESSOR",
            Message::SuccessorResponse { .. } => "SUCCESSOR_RESPONSE",
            Message::JoinRequest { .. } => "JOIN_REQUEST",
            Message::JoinResponse { .. } => "JOIN_RESPONSE",
            Message::Notify { .. } => "NOTIFY",
            Message::GetPredecessor { .. } => "GET_PREDECESSOR",
            Message::PredecessorResponse { .. } => "PREDECESSOR_RESPONSE",
            Message::UpdatePredecessor { .. } => "UPDATE_PREDECESSOR",
            Message::UpdateSuccessor { .. } => "UPDATE_SUCCESSOR",
            Message::Ack { .. } => "ACK",
            Message::HeartbeatAck { .. } => "HEARTBEAT_ACK",
        }
    }

    /// The explicit reply address carried by messages that need a response
    /// routed back regardless of which socket accepted the connection
    /// (required on GET so RESULT can bypass NAT; preserved verbatim
    /// through any forwarding hop).
    pub fn sender_addr(&self) -> Option<&PeerAddr> {
        match self {
            Message::Join { sender_addr, .. }
            | Message::Put { sender_addr, .. }
            | Message::Get { sender_addr, .. }
            | Message::Replicate { sender_addr, .. }
            | Message::Heartbeat { sender_addr, .. }
            | Message::FindSuccessor { sender_addr, .. }
            | Message::GetPredecessor { sender_addr, .. } => Some(sender_addr),
            _ => None,
        }
    }

    /// The correlation id used to resolve a pending request, if any.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Message::Put { request_id, .. }
            | Message::Get { request_id, .. }
            | Message::Result { request_id, .. }
            | Message::Replicate { request_id, .. } => Some(*request_id),
            Message::Ack { request_id, .. } | Message::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }

    /// Whether this message type terminates at the sender recorded in the
    /// inbound message rather than being forwarded to the responsible node.
    pub fn is_terminal_reply(&self) -> bool {
        matches!(
            self,
            Message::Result { .. }
                | Message::Ack { .. }
                | Message::SuccessorResponse { .. }
                | Message::JoinResponse { .. }
                | Message::PredecessorResponse { .. }
                | Message::HeartbeatAck { .. }
                | Message::Error { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;

    // R2: serializing a message and deserializing it yields a structurally
    // equal message, with the timestamp preserved.
    #[test]
    fn round_trips_through_json() {
        let msg = Message::Get {
            sender_id: "node-a".into(),
            sender_addr: PeerAddr::new("127.0.0.1", 5000),
            request_id: 42,
            key: "k1".into(),
            timestamp: 123.456,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        match back {
            Message::Get {
                sender_id,
                sender_addr,
                request_id,
                key,
                timestamp,
            } => {
                assert_eq!(sender_id, "node-a");
                assert_eq!(sender_addr, PeerAddr::new("127.0.0.1", 5000));
                assert_eq!(request_id, 42);
                assert_eq!(key, "k1");
                assert_eq!(timestamp, 123.456);
            }
            other => panic!("wrong variant decoded: {:?}", other),
        }
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        let json = r#"{"type":"BOGUS","sender_id":"x"}"#;
        let result: Result<Message, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn node_info_round_trips_with_full_width_id() {
        let info = NodeInfo::new(PeerAddr::new("10.0.0.1", 6000), hash::hash("node-name"));
        let json = serde_json::to_string(&info).unwrap();
        let back: NodeInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(info, back);
    }

    #[test]
    fn sender_addr_present_only_on_reply_carrying_variants() {
        let get = Message::Get {
            sender_id: "a".into(),
            sender_addr: PeerAddr::new("127.0.0.1", 1),
            request_id: 1,
            key: "k".into(),
            timestamp: 0.0,
        };
        assert!(get.sender_addr().is_some());

        let result = Message::Result {
            sender_id: "a".into(),
            request_id: 1,
            key: "k".into(),
            value: None,
            found: false,
            node: "a".into(),
            timestamp: 0.0,
        };
        assert!(result.sender_addr().is_none());
        assert!(result.is_terminal_reply());
    }
}
