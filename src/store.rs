//! Key/value records with expiration and republish bookkeeping.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use tracing::debug;

use crate::common::Id;

/// A stored key/value pair.
///
/// Mutated only by [RecordStore::put] refreshing the expiry; destroyed when
/// `expires_at` elapses, either lazily on access or by a periodic sweep.
#[derive(Debug, Clone)]
pub struct Record {
    pub key: Id,
    pub value: Bytes,
    /// The node that published the record; replica holders rely on it to
    /// keep the record alive.
    pub publisher: Id,
    pub expires_at: Instant,
    /// Last time this node re-published the record; only meaningful when the
    /// local node is the publisher.
    last_republished: Instant,
}

impl Record {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Instant::now()
    }
}

/// Local record storage, bounded in size and lazily expiring.
///
/// Expiration is correct even without an active sweep: every read re-checks
/// `expires_at`.
#[derive(Debug)]
pub struct RecordStore {
    /// Identifier of the owning node; records it published are the ones
    /// eligible for republishing.
    local_id: Id,
    records: LruCache<Id, Record>,
}

impl RecordStore {
    pub fn new(local_id: Id, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            local_id,
            records: LruCache::new(capacity),
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    // === Public Methods ===

    /// Inserts a record, or refreshes an existing one by extending its expiry
    /// and updating the publisher if it changed.
    pub fn put(&mut self, key: Id, value: Bytes, publisher: Id, ttl: Duration) {
        let now = Instant::now();

        if let Some(record) = self.records.get_mut(&key) {
            record.value = value;
            record.publisher = publisher;
            record.expires_at = now + ttl;
            return;
        }

        self.records.put(
            key,
            Record {
                key,
                value,
                publisher,
                expires_at: now + ttl,
                last_republished: now,
            },
        );
    }

    /// Returns a fresh record for this key; an expired record is treated as
    /// absent and dropped.
    pub fn get(&mut self, key: &Id) -> Option<&Record> {
        if self.records.get(key).is_some_and(|r| r.is_expired()) {
            self.records.pop(key);
            return None;
        }

        self.records.get(key)
    }

    /// Drops all expired records.
    pub fn sweep(&mut self) {
        let expired: Vec<Id> = self
            .records
            .iter()
            .filter(|(_, record)| record.is_expired())
            .map(|(key, _)| *key)
            .collect();

        if !expired.is_empty() {
            debug!(count = expired.len(), "Sweeping expired records");
        }

        for key in expired {
            self.records.pop(&key);
        }
    }

    /// Fresh records published by the local node that haven't been
    /// republished within `interval`, marking them republished now.
    ///
    /// Replica holders never republish; they rely on the publisher.
    pub fn due_for_republish(&mut self, interval: Duration) -> Vec<Record> {
        let now = Instant::now();

        let mut due = Vec::new();
        for (_, record) in self.records.iter_mut() {
            if record.publisher == self.local_id
                && !record.is_expired()
                && now.duration_since(record.last_republished) >= interval
            {
                record.last_republished = now;
                due.push(record.clone());
            }
        }

        due
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn put_then_get() {
        let mut store = RecordStore::new(Id::random(), 10);
        let key = Id::random();

        store.put(key, Bytes::from("value"), Id::random(), Duration::from_secs(60));

        let record = store.get(&key).expect("fresh record");
        assert_eq!(record.value, Bytes::from("value"));

        assert!(store.get(&Id::random()).is_none());
    }

    #[test]
    fn expired_record_is_absent() {
        let mut store = RecordStore::new(Id::random(), 10);
        let key = Id::random();

        store.put(key, Bytes::from("value"), Id::random(), Duration::from_millis(10));

        std::thread::sleep(Duration::from_millis(20));

        assert!(store.get(&key).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn refresh_extends_expiry_and_updates_publisher() {
        let mut store = RecordStore::new(Id::random(), 10);
        let key = Id::random();

        store.put(key, Bytes::from("value"), Id::random(), Duration::from_millis(30));

        let new_publisher = Id::random();
        store.put(key, Bytes::from("value"), new_publisher, Duration::from_secs(60));

        std::thread::sleep(Duration::from_millis(40));

        let record = store.get(&key).expect("refreshed record");
        assert_eq!(record.publisher, new_publisher);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn sweep_drops_expired_records() {
        let mut store = RecordStore::new(Id::random(), 10);

        store.put(
            Id::random(),
            Bytes::from("short"),
            Id::random(),
            Duration::from_millis(10),
        );
        store.put(
            Id::random(),
            Bytes::from("long"),
            Id::random(),
            Duration::from_secs(60),
        );

        std::thread::sleep(Duration::from_millis(20));
        store.sweep();

        assert_eq!(store.len(), 1);
    }

    #[test]
    fn only_the_publisher_republishes() {
        let local_id = Id::random();
        let mut store = RecordStore::new(local_id, 10);

        let own_key = Id::random();
        store.put(own_key, Bytes::from("own"), local_id, Duration::from_secs(60));
        store.put(
            Id::random(),
            Bytes::from("replica"),
            Id::random(),
            Duration::from_secs(60),
        );

        let due = store.due_for_republish(Duration::ZERO);

        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key, own_key);

        // Marked republished; not due again until the interval elapses.
        assert!(store.due_for_republish(Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn capacity_is_bounded() {
        let mut store = RecordStore::new(Id::random(), 2);

        for _ in 0..5 {
            store.put(Id::random(), Bytes::from("v"), Id::random(), Duration::from_secs(60));
        }

        assert_eq!(store.len(), 2);
    }
}
