//! Best effort replication of a record to the closest nodes to its key.

use bytes::Bytes;
use tracing::{debug, trace};

use crate::common::messages::RequestSpecific;
use crate::common::{Contact, Id};

use super::socket::RpcSocket;

/// Replication errors. Partial success is still success; only zero
/// acknowledgments is reported as a failure.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PutError {
    /// Usually means the routing table is empty because the node failed to
    /// bootstrap.
    #[error("Could not find any nodes close to the key to store at")]
    NoClosestNodes,

    /// Every STORE request timed out without an acknowledgment.
    #[error("No node acknowledged storing the record")]
    Unacknowledged,

    #[error(transparent)]
    Shutdown(#[from] crate::dht::DhtWasShutdown),
}

/// How a publish went: how many of the queried nodes acknowledged the STORE.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreReport {
    pub key: Id,
    /// Nodes that acknowledged storing the record.
    pub acks: usize,
    /// Nodes the record was sent to.
    pub queried: usize,
}

/// Sends STORE requests to the closest nodes found by a preceding lookup and
/// counts acknowledgments.
///
/// Created when a caller publishes, parked until the lookup for the same
/// target finishes, then started with that lookup's responders.
#[derive(Debug)]
pub struct StoreQuery {
    key: Id,
    value: Bytes,
    expires_in_secs: u64,

    started: bool,
    queried: usize,
    acks: usize,
    inflight_requests: Vec<u16>,

    sender: Option<flume::Sender<Result<StoreReport, PutError>>>,
}

impl StoreQuery {
    pub fn new(
        key: Id,
        value: Bytes,
        expires_in_secs: u64,
        sender: Option<flume::Sender<Result<StoreReport, PutError>>>,
    ) -> Self {
        Self {
            key,
            value,
            expires_in_secs,
            started: false,
            queried: 0,
            acks: 0,
            inflight_requests: Vec::new(),
            sender,
        }
    }

    // === Getters ===

    pub fn started(&self) -> bool {
        self.started
    }

    /// Returns true if a response with this transaction id belongs to this
    /// query, removing it from the inflight set.
    pub fn settle(&mut self, tid: u16) -> bool {
        if let Some(index) = self.inflight_requests.iter().position(|&t| t == tid) {
            self.inflight_requests.remove(index);
            return true;
        }

        false
    }

    // === Public Methods ===

    /// Sends the STORE request to each of `nodes` in parallel.
    pub fn start(&mut self, socket: &mut RpcSocket, nodes: &[Contact]) {
        let key = self.key;
        trace!(%key, nodes = nodes.len(), "Starting store query");

        self.started = true;
        self.queried = nodes.len();

        for node in nodes {
            let tid = socket.request(
                node.address(),
                RequestSpecific::Store {
                    key: self.key,
                    value: self.value.clone(),
                    expires_in_secs: self.expires_in_secs,
                },
            );

            self.inflight_requests.push(tid);
        }
    }

    /// Records one acknowledgment.
    pub fn ack(&mut self) {
        self.acks += 1;
    }

    /// Drops timed out requests; returns true once started and settled.
    pub fn tick(&mut self, socket: &RpcSocket) -> bool {
        self.inflight_requests.retain(|tid| socket.inflight(tid));

        self.started && self.inflight_requests.is_empty()
    }

    /// Reports the outcome to the waiting channel, if any.
    pub fn finalize(self) {
        let result = if self.queried == 0 {
            Err(PutError::NoClosestNodes)
        } else if self.acks == 0 {
            Err(PutError::Unacknowledged)
        } else {
            Ok(StoreReport {
                key: self.key,
                acks: self.acks,
                queried: self.queried,
            })
        };

        debug!(key = %self.key, ?result, "Store query done");

        if let Some(sender) = self.sender {
            let _ = sender.send(result);
        }
    }
}
