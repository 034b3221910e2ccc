//! The single threaded state machine tying the socket, routing table,
//! lookups, and record store together.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info};

use crate::common::messages::{
    FindValueResult, Message, MessageBody, PeerInfo, RequestSpecific, ResponseSpecific,
};
use crate::common::{BucketInsert, Contact, Id, RoutingTable};
use crate::store::RecordStore;

mod closest_contacts;
pub(crate) mod config;
mod lookup;
mod socket;
mod store_query;

pub use closest_contacts::ClosestContacts;
pub use config::Config;
pub use store_query::{PutError, StoreReport};

use lookup::{Lookup, LookupKind, LookupSender};
use socket::RpcSocket;
use store_query::StoreQuery;

/// Interval of refreshing the routing table with a lookup of our own id.
const REFRESH_TABLE_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Interval of pinging contacts we haven't heard from in a while.
const PING_TABLE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Interval of sweeping expired records and checking for records that are
/// due for republishing.
const MAINTAIN_RECORDS_INTERVAL: Duration = Duration::from_secs(60);

/// Information and statistics about this node.
#[derive(Debug, Clone, PartialEq)]
pub struct Info {
    /// The identifier this node joined the network under.
    pub id: Id,
    /// The address the node is listening on.
    pub local_addr: SocketAddrV4,
    /// The number of contacts in the routing table.
    pub routing_table_size: usize,
    /// The number of records currently stored, own and replicated.
    pub records: usize,
}

/// The main node state machine.
///
/// Everything runs on the thread calling [Rpc::tick] in a loop; per bucket
/// and per record operations are trivially sequential.
#[derive(Debug)]
pub struct Rpc {
    socket: RpcSocket,
    routing_table: RoutingTable,
    records: RecordStore,

    /// Running lookups, deduplicated by target.
    lookups: HashMap<Id, Lookup>,
    /// Pending and running publishes, by record key.
    store_queries: HashMap<Id, StoreQuery>,
    /// Outstanding full bucket eviction pings: transaction id of the ping to
    /// the contact being probed.
    eviction_probes: HashMap<u16, Id>,
    /// Caller initiated pings waiting for a pong or a timeout.
    pending_pings: HashMap<u16, flume::Sender<bool>>,

    k: usize,
    alpha: usize,
    record_ttl: Duration,
    republish_interval: Duration,
    bootstrap: Vec<SocketAddrV4>,

    last_table_refresh: Instant,
    last_table_ping: Instant,
    last_record_maintenance: Instant,
}

impl Rpc {
    pub fn new(config: Config) -> Result<Rpc, std::io::Error> {
        let id = Id::random();
        let socket = RpcSocket::new(id, &config)?;

        info!(%id, address = ?socket.local_addr(), "Starting node");

        Ok(Rpc {
            socket,
            routing_table: RoutingTable::with_k(id, config.k),
            records: RecordStore::new(id, config.max_records),
            lookups: HashMap::new(),
            store_queries: HashMap::new(),
            eviction_probes: HashMap::new(),
            pending_pings: HashMap::new(),
            k: config.k,
            alpha: config.alpha,
            record_ttl: config.record_ttl,
            republish_interval: config.republish_interval,
            bootstrap: config.bootstrap,
            last_table_refresh: Instant::now(),
            last_table_ping: Instant::now(),
            last_record_maintenance: Instant::now(),
        })
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        self.routing_table.id()
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.socket.local_addr()
    }

    pub fn info(&self) -> Info {
        Info {
            id: *self.routing_table.id(),
            local_addr: self.socket.local_addr(),
            routing_table_size: self.routing_table.size(),
            records: self.records.len(),
        }
    }

    // === Public Methods ===

    /// Advances the node: progresses queries, runs periodic maintenance, and
    /// handles one incoming message if any arrived.
    pub fn tick(&mut self) {
        self.tick_lookups();
        self.tick_store_queries();
        self.tick_eviction_probes();
        self.tick_pending_pings();
        self.periodic_maintenance();

        if let Some((message, from)) = self.socket.recv_from() {
            self.observe(Contact::new(message.sender_id, from));

            match &message.body {
                MessageBody::Request(request) => self.handle_request(from, &message, request),
                MessageBody::Response(_) => self.handle_response(from, &message),
            }
        }
    }

    /// Starts (or joins) a lookup for the closest nodes to `target`,
    /// reporting the result to `sender` when it settles.
    pub fn find_node(&mut self, target: Id, sender: flume::Sender<Box<[Contact]>>) {
        self.lookup(
            target,
            LookupKind::FindNode,
            Some(LookupSender::ClosestNodes(sender)),
        );
    }

    /// Resolves the value stored under `key`, answering from the local store
    /// when it holds a fresh record and querying the network otherwise.
    pub fn get(&mut self, key: Id, sender: flume::Sender<Option<Bytes>>) {
        if let Some(record) = self.records.get(&key) {
            let _ = sender.send(Some(record.value.clone()));
            return;
        }

        self.lookup(key, LookupKind::FindValue, Some(LookupSender::Value(sender)));
    }

    /// Pings `address`, reporting whether a pong arrived within the request
    /// timeout.
    pub fn ping(&mut self, address: SocketAddrV4, sender: flume::Sender<bool>) {
        let tid = self.socket.request(address, RequestSpecific::Ping);
        self.pending_pings.insert(tid, sender);
    }

    /// Publishes `value` under `key`: stores it locally, then looks up the
    /// closest nodes to `key` and replicates the record to them.
    pub fn put(
        &mut self,
        key: Id,
        value: Bytes,
        sender: Option<flume::Sender<Result<StoreReport, PutError>>>,
    ) {
        let publisher = *self.routing_table.id();
        self.records.put(key, value.clone(), publisher, self.record_ttl);

        let query = StoreQuery::new(key, value, self.record_ttl.as_secs(), sender);
        // A new publish for the same key supersedes an unfinished one.
        self.store_queries.insert(key, query);

        self.lookup(key, LookupKind::FindNode, None);
    }

    // === Private Methods ===

    fn tick_lookups(&mut self) {
        let socket = &mut self.socket;
        let done: Vec<Id> = self
            .lookups
            .iter_mut()
            .filter_map(|(target, lookup)| lookup.tick(socket).then_some(*target))
            .collect();

        for target in done {
            if let Some(lookup) = self.lookups.remove(&target) {
                self.finalize_lookup(lookup);
            }
        }
    }

    /// Wraps up a settled lookup: caches a found value near the key, starts
    /// the publish that was waiting for this lookup, and reports the outcome.
    fn finalize_lookup(&mut self, lookup: Lookup) {
        let target = lookup.target();
        let closest = lookup.closest_responders();

        // Cache a found value at the closest responder that didn't hold it,
        // spreading popular records towards the nodes lookups visit first.
        // Fire and forget; the ack doesn't change anything for the caller.
        if let (Some(value), Some(cache)) = (lookup.value(), lookup.cache_candidate()) {
            debug!(key = %target, at = %cache.id(), "Caching found value");

            self.socket.request(
                cache.address(),
                RequestSpecific::Store {
                    key: target,
                    value: value.clone(),
                    expires_in_secs: self.record_ttl.as_secs(),
                },
            );
        }

        if let Some(query) = self.store_queries.get_mut(&target) {
            if !query.started() {
                query.start(&mut self.socket, &closest);
            }
        }

        lookup.finalize();
    }

    fn tick_store_queries(&mut self) {
        let socket = &self.socket;
        let done: Vec<Id> = self
            .store_queries
            .iter_mut()
            .filter_map(|(key, query)| query.tick(socket).then_some(*key))
            .collect();

        for key in done {
            if let Some(query) = self.store_queries.remove(&key) {
                query.finalize();
            }
        }
    }

    /// Turns timed out eviction pings into failed probe verdicts.
    fn tick_eviction_probes(&mut self) {
        let timed_out: Vec<(u16, Id)> = self
            .eviction_probes
            .iter()
            .filter(|(tid, _)| !self.socket.inflight(tid))
            .map(|(tid, old)| (*tid, *old))
            .collect();

        for (tid, old) in timed_out {
            self.eviction_probes.remove(&tid);
            self.routing_table.probe_result(&old, false);
        }
    }

    /// Reports caller pings whose request timed out as failed.
    fn tick_pending_pings(&mut self) {
        let socket = &self.socket;
        self.pending_pings.retain(|tid, sender| {
            if socket.inflight(tid) {
                return true;
            }

            let _ = sender.send(false);
            false
        });
    }

    fn periodic_maintenance(&mut self) {
        // An empty table bootstraps on the very first tick; lookup
        // deduplication makes repeated calls while that lookup runs a no-op.
        if self.routing_table.is_empty()
            || self.last_table_refresh.elapsed() >= REFRESH_TABLE_INTERVAL
        {
            self.last_table_refresh = Instant::now();
            self.populate();
        }

        if self.last_table_ping.elapsed() >= PING_TABLE_INTERVAL {
            self.last_table_ping = Instant::now();

            for address in self.routing_table.questionable_contacts() {
                self.socket.request(address, RequestSpecific::Ping);
            }
        }

        if self.last_record_maintenance.elapsed() >= MAINTAIN_RECORDS_INTERVAL {
            self.last_record_maintenance = Instant::now();

            self.records.sweep();

            for record in self.records.due_for_republish(self.republish_interval) {
                debug!(key = %record.key, "Republishing record");
                self.put(record.key, record.value, None);
            }
        }
    }

    /// Refreshes the routing table with a lookup of our own id, querying the
    /// bootstrap nodes if the table can't seed the lookup on its own.
    fn populate(&mut self) {
        let id = *self.routing_table.id();

        if self.lookups.contains_key(&id) {
            return;
        }

        debug!(
            size = self.routing_table.size(),
            "Refreshing the routing table"
        );

        self.lookup(id, LookupKind::FindNode, None);
    }

    /// Starts a lookup, or joins an already running lookup for the same
    /// target instead of traversing the network twice.
    fn lookup(&mut self, target: Id, kind: LookupKind, sender: Option<LookupSender>) {
        if let Some(existing) = self.lookups.get_mut(&target) {
            if kind == LookupKind::FindValue {
                existing.upgrade_to_find_value();
            }
            if let Some(sender) = sender {
                existing.add_sender(sender);
            }

            return;
        }

        let mut lookup = Lookup::new(target, kind, self.k, self.alpha);
        if let Some(sender) = sender {
            lookup.add_sender(sender);
        }

        let closest = self.routing_table.closest_known(&target, self.k);

        if closest.len() < self.k {
            for address in self.bootstrap.clone() {
                lookup.visit_address(&mut self.socket, address);
            }
        }

        for contact in closest {
            lookup.add_candidate(contact);
        }

        self.lookups.insert(target, lookup);
    }

    /// Records that a peer messaged us directly, issuing an eviction ping
    /// when its bucket is full.
    fn observe(&mut self, contact: Contact) {
        if let BucketInsert::ProbeOldest(oldest) = self.routing_table.observe(contact) {
            let tid = self.socket.request(oldest.address(), RequestSpecific::Ping);
            self.eviction_probes.insert(tid, *oldest.id());
        }
    }

    fn handle_request(&mut self, from: SocketAddrV4, message: &Message, request: &RequestSpecific) {
        let transaction_id = message.transaction_id;

        match request {
            RequestSpecific::Ping => {
                self.socket.response(from, transaction_id, ResponseSpecific::Pong);
            }
            RequestSpecific::FindNode { target } => {
                let nodes = self.closest_peers(target);
                self.socket
                    .response(from, transaction_id, ResponseSpecific::FindNode { nodes });
            }
            RequestSpecific::FindValue { key } => {
                let result = match self.records.get(key) {
                    Some(record) => FindValueResult::Value(record.value.clone()),
                    None => FindValueResult::Nodes(self.closest_peers(key)),
                };

                self.socket
                    .response(from, transaction_id, ResponseSpecific::FindValue { result });
            }
            RequestSpecific::Store {
                key,
                value,
                expires_in_secs,
            } => {
                // Cap the requested lifetime; peers don't get to pin records
                // in our bounded store for longer than we would ourselves.
                let ttl = Duration::from_secs(*expires_in_secs).min(self.record_ttl);
                self.records.put(*key, value.clone(), message.sender_id, ttl);

                self.socket
                    .response(from, transaction_id, ResponseSpecific::Stored);
            }
        }
    }

    fn handle_response(&mut self, from: SocketAddrV4, message: &Message) {
        let tid = message.transaction_id;

        // An eviction probe; any response from the probed contact counts as
        // proof of life.
        if let Some(old) = self.eviction_probes.remove(&tid) {
            self.routing_table.probe_result(&old, true);
            return;
        }

        if let Some(sender) = self.pending_pings.remove(&tid) {
            let _ = sender.send(true);
            return;
        }

        let acknowledged = matches!(
            message.body,
            MessageBody::Response(ResponseSpecific::Stored)
        );
        if let Some(query) = self
            .store_queries
            .iter_mut()
            .find_map(|(_, query)| query.settle(tid).then_some(query))
        {
            if acknowledged {
                query.ack();
            }
            return;
        }

        if let Some(lookup) = self
            .lookups
            .iter_mut()
            .find_map(|(_, lookup)| lookup.settle(tid).then_some(lookup))
        {
            let local_id = *self.routing_table.id();

            if let Some(nodes) = message.closer_nodes() {
                for node in nodes {
                    if node.id != local_id {
                        lookup.add_candidate(Contact::from(node));
                    }
                }
            }

            lookup.add_responder(Contact::new(message.sender_id, from));

            if let MessageBody::Response(ResponseSpecific::FindValue {
                result: FindValueResult::Value(value),
            }) = &message.body
            {
                lookup.found_value(value.clone(), message.sender_id);
            }
        }
    }

    fn closest_peers(&self, target: &Id) -> Vec<PeerInfo> {
        self.routing_table
            .closest_known(target, self.k)
            .iter()
            .map(PeerInfo::from)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::ID_SIZE;

    /// An id that lands in the same low bucket of `local` for every
    /// `last_byte_xor` with the same highest set bit.
    fn sibling_id(local: &Id, last_byte_xor: u8) -> Id {
        let mut bytes = *local.as_bytes();
        bytes[ID_SIZE - 1] ^= last_byte_xor;
        Id(bytes)
    }

    fn tick_until(rpc: &mut Rpc, reached: impl Fn(&Rpc) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);

        while !reached(rpc) {
            assert!(Instant::now() < deadline, "condition not reached in time");
            rpc.tick();
        }
    }

    #[test]
    fn full_bucket_eviction_ack_keeps_the_old_contact() {
        let config = Config {
            k: 1,
            request_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let mut rpc = Rpc::new(config.clone()).expect("bind node");

        // Both land in bucket 1 of the node under test.
        let old_id = sibling_id(rpc.id(), 0b10);
        let new_id = sibling_id(rpc.id(), 0b11);

        let mut old_peer = RpcSocket::new(old_id, &config).expect("bind old peer");
        let mut new_peer = RpcSocket::new(new_id, &config).expect("bind new peer");

        old_peer.request(rpc.local_addr(), RequestSpecific::Ping);
        tick_until(&mut rpc, |rpc| rpc.routing_table.contains(&old_id));

        // The bucket is full (k = 1); the newcomer triggers a probe of the
        // old contact.
        new_peer.request(rpc.local_addr(), RequestSpecific::Ping);

        // Answer the eviction ping on the old peer's behalf.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            assert!(Instant::now() < deadline, "no eviction ping arrived");
            rpc.tick();

            if let Some((message, from)) = old_peer.recv_from() {
                if let MessageBody::Request(RequestSpecific::Ping) = message.body {
                    old_peer.response(from, message.transaction_id, ResponseSpecific::Pong);
                    break;
                }
            }
        }

        tick_until(&mut rpc, |rpc| rpc.eviction_probes.is_empty());

        // The old contact answered, so it stays and the newcomer is dropped.
        assert!(rpc.routing_table.contains(&old_id));
        assert!(!rpc.routing_table.contains(&new_id));
    }

    #[test]
    fn full_bucket_eviction_timeout_replaces_the_old_contact() {
        let config = Config {
            k: 1,
            request_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let mut rpc = Rpc::new(config.clone()).expect("bind node");

        let old_id = sibling_id(rpc.id(), 0b10);
        let new_id = sibling_id(rpc.id(), 0b11);

        let mut old_peer = RpcSocket::new(old_id, &config).expect("bind old peer");
        let mut new_peer = RpcSocket::new(new_id, &config).expect("bind new peer");

        old_peer.request(rpc.local_addr(), RequestSpecific::Ping);
        tick_until(&mut rpc, |rpc| rpc.routing_table.contains(&old_id));

        new_peer.request(rpc.local_addr(), RequestSpecific::Ping);

        // The old peer never answers the eviction ping; once it times out
        // the newcomer takes the slot.
        tick_until(&mut rpc, |rpc| rpc.routing_table.contains(&new_id));

        assert!(!rpc.routing_table.contains(&old_id));
    }

    #[test]
    fn bootstrap_fills_both_routing_tables() {
        let first = Rpc::new(Config::default()).expect("bind first node");

        let second = Rpc::new(Config {
            bootstrap: vec![first.local_addr()],
            request_timeout: Duration::from_millis(200),
            ..Default::default()
        })
        .expect("bind second node");

        let mut nodes = [first, second];
        let started = Instant::now();

        // The second node's first tick looks up its own id against the
        // bootstrap node; the first node learns about it from that request.
        while started.elapsed() < Duration::from_secs(2) {
            for node in nodes.iter_mut() {
                node.tick();
            }

            if nodes.iter().all(|node| !node.routing_table.is_empty()) {
                break;
            }
        }

        let [first, second] = &nodes;
        assert!(second.routing_table.contains(first.id()));
        assert!(first.routing_table.contains(second.id()));
    }

    #[test]
    fn put_answers_get_locally() {
        let mut node = Rpc::new(Config::default()).expect("bind node");

        let key = Id::random();
        node.put(key, Bytes::from("value"), None);

        let (sender, receiver) = flume::unbounded();
        node.get(key, sender);

        assert_eq!(receiver.try_recv(), Ok(Some(Bytes::from("value"))));
    }

    #[test]
    fn concurrent_lookups_for_the_same_target_are_shared() {
        let mut node = Rpc::new(Config::default()).expect("bind node");

        let target = Id::random();
        let (first, _keep) = flume::unbounded();
        let (second, _keep2) = flume::unbounded();

        node.find_node(target, first);
        node.find_node(target, second);

        assert_eq!(node.lookups.len(), 1);
    }
}
