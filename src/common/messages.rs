//! Logical RPC messages exchanged between nodes.
//!
//! Messages are correlated by a `transaction_id` chosen by the requester and
//! echoed back in the response. The byte framing is plain bincode; anything
//! that fails to decode is dropped by the socket layer without an error
//! reaching the handlers.

use std::net::SocketAddrV4;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::common::{Contact, Id};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Chosen by the requester, echoed in the response.
    pub transaction_id: u16,
    /// The identifier of the node this message originates from.
    pub sender_id: Id,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    Request(RequestSpecific),
    Response(ResponseSpecific),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestSpecific {
    /// Liveness probe; also drives the full bucket eviction decision.
    Ping,
    FindNode {
        target: Id,
    },
    FindValue {
        key: Id,
    },
    Store {
        key: Id,
        value: Bytes,
        /// Relative TTL in seconds; the receiver computes the absolute expiry.
        /// Peer clocks are not assumed to be synchronized.
        expires_in_secs: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseSpecific {
    Pong,
    FindNode { nodes: Vec<PeerInfo> },
    FindValue { result: FindValueResult },
    Stored,
}

/// A `FindValue` response either carries the value itself, or the closest
/// contacts the responder knows to the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FindValueResult {
    Value(Bytes),
    Nodes(Vec<PeerInfo>),
}

/// Wire representation of a [Contact]; `last_seen` is local knowledge and
/// never crosses the network.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: Id,
    pub address: SocketAddrV4,
}

impl From<&Contact> for PeerInfo {
    fn from(contact: &Contact) -> PeerInfo {
        PeerInfo {
            id: *contact.id(),
            address: contact.address(),
        }
    }
}

impl From<&PeerInfo> for Contact {
    fn from(info: &PeerInfo) -> Contact {
        Contact::new(info.id, info.address)
    }
}

impl Message {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Message, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// The contacts a response claims are close to the request's target.
    pub fn closer_nodes(&self) -> Option<&[PeerInfo]> {
        match &self.body {
            MessageBody::Response(ResponseSpecific::FindNode { nodes }) => Some(nodes),
            MessageBody::Response(ResponseSpecific::FindValue {
                result: FindValueResult::Nodes(nodes),
            }) => Some(nodes),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        let message = Message {
            transaction_id: 120,
            sender_id: Id::random(),
            body: MessageBody::Request(RequestSpecific::Store {
                key: Id::random(),
                value: Bytes::from(vec![1, 2, 3]),
                expires_in_secs: 3600,
            }),
        };

        let decoded =
            Message::from_bytes(&message.to_bytes().expect("encodes")).expect("decodes");

        assert_eq!(decoded, message);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Message::from_bytes(&[0xff; 7]).is_err());
    }
}
