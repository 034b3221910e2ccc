//! Iterative FIND_NODE / FIND_VALUE lookups.

use std::collections::HashSet;
use std::net::SocketAddrV4;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::common::messages::RequestSpecific;
use crate::common::{Contact, Id};

use super::closest_contacts::ClosestContacts;
use super::socket::RpcSocket;

/// What a lookup is after: the closest nodes to the target, or the value
/// stored under the target key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LookupKind {
    FindNode,
    FindValue,
}

/// Channels waiting for a lookup's outcome.
#[derive(Debug)]
pub enum LookupSender {
    ClosestNodes(flume::Sender<Box<[Contact]>>),
    Value(flume::Sender<Option<Bytes>>),
}

/// An iterative process of querying the closest known nodes to a target,
/// feeding closer nodes discovered in responses back into the candidate
/// shortlist, until no closer unqueried candidates remain.
///
/// At most `alpha` requests are outstanding at any time. Contacts that fail
/// to respond leave the candidate shortlist and are never retried, but they
/// are not evicted from the routing table here; eviction is the buckets'
/// business.
#[derive(Debug)]
pub struct Lookup {
    target: Id,
    kind: LookupKind,
    k: usize,
    alpha: usize,

    /// Every live contact discovered, sorted by distance to the target. Only
    /// the k closest are eligible for querying.
    candidates: ClosestContacts,
    /// Contacts that responded to us; the lookup's result set.
    responders: ClosestContacts,
    /// Identifiers we sent a request to, including those that failed.
    queried: HashSet<Id>,
    /// Contacts whose request timed out. They give their shortlist slot up to
    /// farther candidates and are never re-admitted.
    failed: HashSet<Id>,
    /// Addresses visited directly, without knowing an identifier (bootstrap).
    visited: HashSet<SocketAddrV4>,
    /// Outstanding transaction ids, along with the candidate they went to
    /// (None for direct address visits).
    inflight_requests: Vec<(u16, Option<Id>)>,

    /// The value, once a FIND_VALUE lookup sees one.
    value: Option<Bytes>,
    /// Every responder that returned the value itself rather than nodes.
    value_holders: HashSet<Id>,

    senders: Vec<LookupSender>,
}

impl Lookup {
    pub fn new(target: Id, kind: LookupKind, k: usize, alpha: usize) -> Self {
        trace!(?target, ?kind, "New lookup");

        Self {
            target,
            kind,
            k,
            alpha,
            candidates: ClosestContacts::new(target),
            responders: ClosestContacts::new(target),
            queried: HashSet::new(),
            failed: HashSet::new(),
            visited: HashSet::new(),
            inflight_requests: Vec::new(),
            value: None,
            value_holders: HashSet::new(),
            senders: Vec::new(),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    /// The k closest nodes that actually responded.
    pub fn closest_responders(&self) -> Vec<Contact> {
        self.responders.take(self.k)
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    /// The closest responder that returned a node list rather than the value
    /// itself; where a found value should be cached against expiration.
    pub fn cache_candidate(&self) -> Option<&Contact> {
        if self.value_holders.is_empty() {
            return None;
        }

        self.responders
            .contacts()
            .iter()
            .find(|contact| !self.value_holders.contains(contact.id()))
    }

    /// Returns true if a response with this transaction id belongs to this
    /// lookup, removing it from the inflight set.
    pub fn settle(&mut self, tid: u16) -> bool {
        if let Some(index) = self.inflight_requests.iter().position(|(t, _)| *t == tid) {
            self.inflight_requests.remove(index);
            return true;
        }

        false
    }

    // === Public Methods ===

    /// Makes a running FIND_NODE lookup ask for the value from here on, so a
    /// late FIND_VALUE caller can share the traversal.
    pub fn upgrade_to_find_value(&mut self) {
        if self.kind == LookupKind::FindNode {
            self.kind = LookupKind::FindValue;
        }
    }

    /// Adds a channel interested in this lookup's outcome, so concurrent
    /// callers share one traversal of the network.
    pub fn add_sender(&mut self, sender: LookupSender) {
        // A late subscriber to an already successful FIND_VALUE.
        if let (LookupSender::Value(sender), Some(value)) = (&sender, &self.value) {
            let _ = sender.send(Some(value.clone()));
            return;
        }

        self.senders.push(sender);
    }

    /// Adds a contact learned from a response. It only becomes eligible for
    /// querying; it is not added to the routing table until it responds to us
    /// directly. Rediscovering a contact that already failed is a no-op.
    pub fn add_candidate(&mut self, contact: Contact) {
        if self.failed.contains(contact.id()) {
            return;
        }

        self.candidates.add(contact);
    }

    /// Records a contact that responded to one of our requests.
    pub fn add_responder(&mut self, contact: Contact) {
        self.responders.add(contact);
    }

    /// Records the value for a FIND_VALUE lookup.
    ///
    /// The first value terminates the lookup for its callers immediately;
    /// outstanding requests are left to resolve or time out on their own.
    pub fn found_value(&mut self, value: Bytes, holder: Id) {
        self.value_holders.insert(holder);

        if self.value.is_some() {
            return;
        }

        debug!(target = %self.target, %holder, "Lookup found value");

        for sender in &self.senders {
            if let LookupSender::Value(sender) = sender {
                let _ = sender.send(Some(value.clone()));
            }
        }

        self.value = Some(value);
    }

    /// Visits an address directly without a known identifier; used to query
    /// bootstrap nodes.
    pub fn visit_address(&mut self, socket: &mut RpcSocket, address: SocketAddrV4) {
        if self.visited.contains(&address) {
            return;
        }

        let tid = socket.request(address, self.request());
        self.inflight_requests.push((tid, None));
        self.visited.insert(address);
    }

    /// Advances the lookup: drops timed out requests and fills the request
    /// window back up to `alpha` from the closest unqueried candidates.
    ///
    /// Returns true once the lookup is done.
    pub fn tick(&mut self, socket: &mut RpcSocket) -> bool {
        // A request no longer inflight in the socket either got a response
        // (settled earlier) or timed out; either way it is not coming back.
        let mut timed_out = Vec::new();
        self.inflight_requests.retain(|(tid, contact)| {
            if socket.inflight(tid) {
                return true;
            }

            if let Some(id) = contact {
                timed_out.push(*id);
            }
            false
        });

        // A failed contact gives its shortlist slot up, so candidates beyond
        // the k closest can still be promoted and queried.
        for id in timed_out {
            self.failed.insert(id);
            self.candidates.remove(&id);
        }

        // A found value stops the traversal; no new requests.
        if self.value.is_none() {
            self.visit_closest(socket);
        }

        let done = self.inflight_requests.is_empty();

        if done {
            debug!(
                target = %self.target,
                candidates = self.candidates.len(),
                responders = self.responders.len(),
                queried = self.queried.len(),
                "Lookup done"
            );
        }

        done
    }

    /// Reports the final outcome to all waiting channels.
    pub fn finalize(self) {
        let closest = self.responders.take(self.k);

        for sender in &self.senders {
            match sender {
                LookupSender::ClosestNodes(sender) => {
                    let _ = sender.send(closest.clone().into_boxed_slice());
                }
                LookupSender::Value(sender) => {
                    // Successful FIND_VALUE callers were already answered in
                    // found_value; anyone left gets a "not found".
                    if self.value.is_none() {
                        let _ = sender.send(None);
                    }
                }
            }
        }
    }

    // === Private Methods ===

    fn request(&self) -> RequestSpecific {
        match self.kind {
            LookupKind::FindNode => RequestSpecific::FindNode {
                target: self.target,
            },
            LookupKind::FindValue => RequestSpecific::FindValue { key: self.target },
        }
    }

    /// Queries up to `alpha - inflight` of the k closest unqueried candidates.
    ///
    /// When no unqueried candidate remains among the k closest, the previous
    /// round made no progress towards the target and the lookup winds down as
    /// the inflight requests drain.
    fn visit_closest(&mut self, socket: &mut RpcSocket) {
        let slots = self.alpha.saturating_sub(self.inflight_requests.len());

        let to_visit = self
            .candidates
            .contacts()
            .iter()
            .take(self.k)
            .filter(|contact| !self.queried.contains(contact.id()))
            .take(slots)
            .cloned()
            .collect::<Vec<_>>();

        for contact in to_visit {
            self.queried.insert(*contact.id());

            if self.visited.contains(&contact.address()) {
                continue;
            }

            let tid = socket.request(contact.address(), self.request());
            self.inflight_requests.push((tid, Some(*contact.id())));
            self.visited.insert(contact.address());
        }
    }
}
