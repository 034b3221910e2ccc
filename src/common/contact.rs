//! A remembered peer: identifier, address, and last seen time.

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use crate::common::Id;

/// Age of a contact's `last_seen` after which routine maintenance should
/// confirm it is still alive with a ping.
const QUESTIONABLE_AGE: Duration = Duration::from_secs(10 * 60);

/// Entry in a routing table [Bucket][crate::Bucket].
///
/// Equality is by identifier only; the address and `last_seen` time of a
/// contact may change without it becoming a different contact.
#[derive(Debug, Clone)]
pub struct Contact {
    id: Id,
    address: SocketAddrV4,
    last_seen: Instant,
}

impl Contact {
    pub fn new(id: Id, address: SocketAddrV4) -> Contact {
        Contact {
            id,
            address,
            last_seen: Instant::now(),
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Returns `true` if this contact hasn't been heard from in a while and is
    /// worth pinging during table maintenance.
    pub fn should_ping(&self) -> bool {
        self.last_seen.elapsed() > QUESTIONABLE_AGE
    }

    // === Public Methods ===

    /// Refreshes `last_seen` to now.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Updates the network endpoint, keeping the identity.
    pub(crate) fn set_address(&mut self, address: SocketAddrV4) {
        self.address = address;
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn equality_is_by_id_only() {
        let id = Id::random();

        let a = Contact::new(id, SocketAddrV4::new([127, 0, 0, 1].into(), 4444));
        let b = Contact::new(id, SocketAddrV4::new([10, 0, 0, 9].into(), 6881));

        assert_eq!(a, b);
        assert_ne!(
            a,
            Contact::new(Id::random(), SocketAddrV4::new([127, 0, 0, 1].into(), 4444))
        );
    }

    #[test]
    fn touch_advances_last_seen() {
        let mut contact = Contact::new(Id::random(), SocketAddrV4::new([127, 0, 0, 1].into(), 0));
        let before = contact.last_seen();

        contact.touch();

        assert!(contact.last_seen() >= before);
    }
}
