//! XOR routing table: k-buckets indexed by the distance's highest set bit.

use std::net::SocketAddrV4;
use std::slice::Iter;

use tracing::trace;

use crate::common::{Contact, Id, MAX_DISTANCE};
use crate::rpc::ClosestContacts;

/// K = the default maximum size of a k-bucket, and the replication factor.
pub const DEFAULT_K: usize = 20;

/// Outcome of inserting a contact into a [Bucket].
#[derive(Debug, Clone, PartialEq)]
pub enum BucketInsert {
    /// The bucket had room; the contact was appended as most recently seen.
    Added,
    /// A contact with this identifier was already present; its `last_seen`
    /// and address were refreshed and it moved to most recently seen.
    Refreshed,
    /// The bucket is full. The returned contact is its least recently seen
    /// entry, which must be pinged before the eviction decision: a reply keeps
    /// it and discards the candidate, a timeout replaces it with the candidate
    /// (reported back through [Bucket::apply_probe]).
    ProbeOldest(Contact),
    /// The contact was dropped: either it is the local node itself, or the
    /// bucket is full while an eviction probe is already outstanding.
    Discarded,
}

#[derive(Debug, Clone)]
struct PendingEviction {
    old: Id,
    candidate: Contact,
}

/// A bounded set of [Contact]s for one distance range, ordered from least to
/// most recently seen.
///
/// Buckets never drop a responsive contact in favor of an unverified new one:
/// long-lived stable peers are protected from eviction by churn.
#[derive(Debug, Clone)]
pub struct Bucket {
    k: usize,
    /// Sorted by `last_seen` ascending; index 0 is the eviction candidate.
    contacts: Vec<Contact>,
    pending: Option<PendingEviction>,
}

impl Bucket {
    pub fn new(k: usize) -> Bucket {
        Bucket {
            k,
            contacts: Vec::with_capacity(k),
            pending: None,
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() >= self.k
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.position(id).is_some()
    }

    pub fn iter(&self) -> Iter<'_, Contact> {
        self.contacts.iter()
    }

    // === Public Methods ===

    /// Inserts or refreshes a contact, deciding the full-bucket case.
    ///
    /// Inserting an already present identifier is never an error; it resolves
    /// to a liveness refresh.
    pub fn insert(&mut self, contact: Contact) -> BucketInsert {
        if let Some(index) = self.position(contact.id()) {
            let mut existing = self.contacts.remove(index);
            existing.touch();
            existing.set_address(contact.address());
            self.contacts.push(existing);

            return BucketInsert::Refreshed;
        }

        if !self.is_full() {
            let mut contact = contact;
            contact.touch();
            self.contacts.push(contact);

            return BucketInsert::Added;
        }

        if self.pending.is_some() {
            // At most one eviction probe per bucket; later candidates lose.
            return BucketInsert::Discarded;
        }

        let oldest = self.contacts[0].clone();
        self.pending = Some(PendingEviction {
            old: *oldest.id(),
            candidate: contact,
        });

        BucketInsert::ProbeOldest(oldest)
    }

    /// Removes and returns the contact with this identifier.
    ///
    /// # Panics
    ///
    /// Calling this for an identifier that is not in the bucket is a
    /// programming error in the caller, not a network condition, and panics.
    pub fn remove(&mut self, id: &Id) -> Contact {
        match self.position(id) {
            Some(index) => self.contacts.remove(index),
            None => panic!("Bucket::remove called for {id} which is not in the bucket"),
        }
    }

    /// Settles a pending eviction after the probe of the least recently seen
    /// contact resolved.
    ///
    /// If the old contact answered it is refreshed to most recently seen and
    /// the candidate is discarded; otherwise the old contact is replaced by
    /// the candidate.
    pub fn apply_probe(&mut self, old: &Id, alive: bool) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        if pending.old != *old {
            self.pending = Some(pending);
            return;
        }

        if alive {
            if let Some(index) = self.position(old) {
                let mut contact = self.contacts.remove(index);
                contact.touch();
                self.contacts.push(contact);
            }
        } else {
            let _ = self.remove(&pending.old);

            let mut candidate = pending.candidate;
            candidate.touch();
            self.contacts.push(candidate);
        }
    }

    /// Up to `limit` contacts ordered by ascending distance to `target`.
    /// Read only; no liveness side effect.
    pub fn closest(&self, target: &Id, limit: usize) -> Vec<Contact> {
        let mut contacts = self.contacts.clone();
        contacts.sort_by_key(|contact| contact.id().xor(target));
        contacts.truncate(limit);
        contacts
    }

    // === Private Methods ===

    fn position(&self, id: &Id) -> Option<usize> {
        self.contacts.iter().position(|contact| contact.id() == id)
    }
}

/// The routing table: one [Bucket] per possible distance bucket index, owned
/// exclusively by the local node.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    id: Id,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    /// Creates a routing table centered on `id` with [DEFAULT_K] sized buckets.
    pub fn new(id: Id) -> RoutingTable {
        RoutingTable::with_k(id, DEFAULT_K)
    }

    pub fn with_k(id: Id, k: usize) -> RoutingTable {
        RoutingTable {
            id,
            buckets: (0..MAX_DISTANCE).map(|_| Bucket::new(k)).collect(),
        }
    }

    // === Getters ===

    /// The [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_empty())
    }

    /// The number of contacts in this routing table.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    pub fn contains(&self, id: &Id) -> bool {
        match self.id.xor(id).bucket_index() {
            Some(index) => self.buckets[index].contains(id),
            None => false,
        }
    }

    /// Iterates over all contacts, bucket by bucket.
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.buckets.iter().flat_map(|bucket| bucket.iter())
    }

    // === Public Methods ===

    /// Records that we heard from a peer directly, routing it to the bucket
    /// for its distance. Called for the originator of every received message.
    ///
    /// Never stores a contact for the local identifier.
    pub fn observe(&mut self, contact: Contact) -> BucketInsert {
        match self.id.xor(contact.id()).bucket_index() {
            Some(index) => {
                let outcome = self.buckets[index].insert(contact);

                if let BucketInsert::ProbeOldest(oldest) = &outcome {
                    trace!(bucket = index, old = %oldest.id(), "Full bucket, probing oldest contact");
                }

                outcome
            }
            None => BucketInsert::Discarded,
        }
    }

    /// Settles a pending eviction in the bucket of the probed contact.
    pub fn probe_result(&mut self, old: &Id, alive: bool) {
        if let Some(index) = self.id.xor(old).bucket_index() {
            self.buckets[index].apply_probe(old, alive);
        }
    }

    /// Up to `limit` known contacts ordered by ascending distance to
    /// `target`, merged across buckets. This is the seed source for lookups.
    pub fn closest_known(&self, target: &Id, limit: usize) -> Vec<Contact> {
        let mut closest = ClosestContacts::new(*target);

        for contact in self.contacts() {
            closest.add(contact.clone());
        }

        closest.take(limit)
    }

    /// Addresses of contacts that have not been heard from recently, worth
    /// confirming with a ping during periodic maintenance.
    pub fn questionable_contacts(&self) -> Vec<SocketAddrV4> {
        self.contacts()
            .filter(|contact| contact.should_ping())
            .map(|contact| contact.address())
            .collect()
    }

    // === Private Methods ===

    #[cfg(test)]
    fn bucket(&self, index: usize) -> &Bucket {
        &self.buckets[index]
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddrV4;
    use std::time::Duration;

    use super::*;

    fn contact(n: u16) -> Contact {
        Contact::new(Id::random(), SocketAddrV4::new([127, 0, 0, 1].into(), n))
    }

    fn insert_settled(bucket: &mut Bucket, contact: Contact) {
        assert_eq!(bucket.insert(contact), BucketInsert::Added);
        // Keep last_seen strictly ordered for eviction tests.
        std::thread::sleep(Duration::from_millis(2));
    }

    #[test]
    fn insert_into_non_full_bucket() {
        let mut bucket = Bucket::new(2);
        let contact = contact(1);
        let id = *contact.id();

        assert_eq!(bucket.insert(contact), BucketInsert::Added);
        assert_eq!(bucket.len(), 1);
        assert!(bucket.contains(&id));
    }

    #[test]
    fn reinsert_refreshes_and_moves_to_most_recent() {
        let mut bucket = Bucket::new(2);

        let first = contact(1);
        insert_settled(&mut bucket, first.clone());
        insert_settled(&mut bucket, contact(2));

        let refreshed = Contact::new(*first.id(), SocketAddrV4::new([127, 0, 0, 1].into(), 99));
        assert_eq!(bucket.insert(refreshed), BucketInsert::Refreshed);

        assert_eq!(bucket.len(), 2);
        // Moved to the most recently seen end, with the new endpoint.
        let last = bucket.iter().last().expect("non-empty");
        assert_eq!(last.id(), first.id());
        assert_eq!(last.address().port(), 99);
    }

    #[test]
    fn full_bucket_probes_least_recently_seen() {
        let mut bucket = Bucket::new(2);

        let x = contact(1);
        let y = contact(2);
        insert_settled(&mut bucket, x.clone());
        insert_settled(&mut bucket, y.clone());

        let z = contact(3);
        match bucket.insert(z.clone()) {
            BucketInsert::ProbeOldest(oldest) => assert_eq!(oldest.id(), x.id()),
            other => panic!("expected ProbeOldest, got {other:?}"),
        }

        // A second candidate while the probe is outstanding is dropped.
        assert_eq!(bucket.insert(contact(4)), BucketInsert::Discarded);
    }

    #[test]
    fn probe_ack_keeps_old_contact_and_discards_candidate() {
        let mut bucket = Bucket::new(2);

        let x = contact(1);
        let y = contact(2);
        insert_settled(&mut bucket, x.clone());
        insert_settled(&mut bucket, y.clone());

        let z = contact(3);
        bucket.insert(z.clone());
        bucket.apply_probe(x.id(), true);

        assert_eq!(bucket.len(), 2);
        assert!(bucket.contains(x.id()));
        assert!(bucket.contains(y.id()));
        assert!(!bucket.contains(z.id()));

        // X answered, so it is now the most recently seen.
        assert_eq!(bucket.iter().last().expect("non-empty").id(), x.id());
    }

    #[test]
    fn probe_timeout_replaces_old_contact_with_candidate() {
        let mut bucket = Bucket::new(2);

        let x = contact(1);
        let y = contact(2);
        insert_settled(&mut bucket, x.clone());
        insert_settled(&mut bucket, y.clone());

        let z = contact(3);
        bucket.insert(z.clone());
        bucket.apply_probe(x.id(), false);

        assert_eq!(bucket.len(), 2);
        assert!(!bucket.contains(x.id()));
        assert!(bucket.contains(y.id()));
        assert!(bucket.contains(z.id()));
    }

    #[test]
    #[should_panic(expected = "not in the bucket")]
    fn remove_missing_contact_is_fatal() {
        let mut bucket = Bucket::new(2);
        bucket.insert(contact(1));

        bucket.remove(&Id::random());
    }

    #[test]
    fn observe_routes_by_bucket_index() {
        let mut local = [0_u8; crate::common::ID_SIZE];
        local[crate::common::ID_SIZE - 1] = 0;
        let mut table = RoutingTable::new(Id(local));

        let mut far = local;
        far[crate::common::ID_SIZE - 1] = 0b1000_0000;
        let mut near = local;
        near[crate::common::ID_SIZE - 1] = 0b0000_0001;

        table.observe(Contact::new(
            Id(far),
            SocketAddrV4::new([127, 0, 0, 1].into(), 1),
        ));
        table.observe(Contact::new(
            Id(near),
            SocketAddrV4::new([127, 0, 0, 1].into(), 2),
        ));

        assert!(table.bucket(7).contains(&Id(far)));
        assert!(table.bucket(0).contains(&Id(near)));
    }

    #[test]
    fn never_stores_self() {
        let id = Id::random();
        let mut table = RoutingTable::new(id);

        let outcome = table.observe(Contact::new(id, SocketAddrV4::new([127, 0, 0, 1].into(), 1)));

        assert_eq!(outcome, BucketInsert::Discarded);
        assert!(table.is_empty());
    }

    #[test]
    fn closest_known_is_sorted_and_bounded() {
        let local = Id::random();
        let mut table = RoutingTable::new(local);

        for n in 0..50 {
            table.observe(contact(n));
        }

        let target = Id::random();
        let closest = table.closest_known(&target, 10);

        assert_eq!(closest.len(), 10);
        assert!(closest.iter().all(|c| c.id() != &local));

        let distances: Vec<_> = closest.iter().map(|c| c.id().xor(&target)).collect();
        let mut sorted = distances.clone();
        sorted.sort();
        assert_eq!(distances, sorted);
    }

    #[test]
    fn duplicate_observe_does_not_grow_the_table() {
        let mut table = RoutingTable::new(Id::random());

        let contact = contact(1);
        table.observe(contact.clone());
        table.observe(contact);

        assert_eq!(table.size(), 1);
    }
}
