//! A set of contacts kept sorted by distance to a target.

use crate::common::{Contact, Id};

/// Contacts ordered by ascending XOR distance to a target, unique per
/// identifier.
///
/// Under the XOR metric two distinct identifiers never share a distance to the
/// same target, so insertion order only matters for re-discovered contacts:
/// the first discovered entry wins.
#[derive(Debug, Clone)]
pub struct ClosestContacts {
    target: Id,
    contacts: Vec<Contact>,
}

impl ClosestContacts {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            contacts: Vec::with_capacity(200),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    // === Public Methods ===

    pub fn add(&mut self, contact: Contact) {
        let distance = contact.id().xor(&self.target);

        let result = self.contacts.binary_search_by(|probe| {
            if probe.id() == contact.id() {
                std::cmp::Ordering::Equal
            } else {
                probe.id().xor(&self.target).cmp(&distance)
            }
        });

        if let Err(position) = result {
            self.contacts.insert(position, contact);
        }
    }

    /// Removes and returns the contact with this identifier, if present.
    pub fn remove(&mut self, id: &Id) -> Option<Contact> {
        let index = self
            .contacts
            .iter()
            .position(|contact| contact.id() == id)?;

        Some(self.contacts.remove(index))
    }

    /// The `limit` closest contacts seen so far.
    pub fn take(&self, limit: usize) -> Vec<Contact> {
        self.contacts[..limit.min(self.contacts.len())].to_vec()
    }
}

impl<'a> IntoIterator for &'a ClosestContacts {
    type Item = &'a Contact;
    type IntoIter = std::slice::Iter<'a, Contact>;

    fn into_iter(self) -> Self::IntoIter {
        self.contacts.iter()
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddrV4;

    use super::*;

    fn contact() -> Contact {
        Contact::new(Id::random(), SocketAddrV4::new([127, 0, 0, 1].into(), 0))
    }

    #[test]
    fn sorted_and_unique() {
        let target = Id::random();
        let mut closest = ClosestContacts::new(target);

        for _ in 0..10 {
            let contact = contact();
            closest.add(contact.clone());
            closest.add(contact);
        }

        assert_eq!(closest.len(), 10);

        let distances: Vec<_> = closest
            .contacts()
            .iter()
            .map(|c| c.id().xor(&target))
            .collect();

        let mut sorted = distances.clone();
        sorted.sort();
        assert_eq!(distances, sorted);
    }

    #[test]
    fn first_discovered_entry_wins() {
        let mut closest = ClosestContacts::new(Id::random());

        let first = contact();
        let relocated = Contact::new(*first.id(), SocketAddrV4::new([127, 0, 0, 1].into(), 9));

        closest.add(first.clone());
        closest.add(relocated);

        assert_eq!(closest.len(), 1);
        assert_eq!(closest.contacts()[0].address(), first.address());
    }

    #[test]
    fn remove_keeps_the_rest_sorted() {
        let target = Id::random();
        let mut closest = ClosestContacts::new(target);

        let contacts: Vec<Contact> = (0..5).map(|_| contact()).collect();
        for contact in &contacts {
            closest.add(contact.clone());
        }

        let removed = closest.remove(contacts[2].id()).expect("present");
        assert_eq!(removed.id(), contacts[2].id());
        assert_eq!(closest.len(), 4);
        assert!(closest.remove(contacts[2].id()).is_none());

        let distances: Vec<_> = closest
            .contacts()
            .iter()
            .map(|c| c.id().xor(&target))
            .collect();
        let mut sorted = distances.clone();
        sorted.sort();
        assert_eq!(distances, sorted);
    }

    #[test]
    fn take_is_bounded() {
        let mut closest = ClosestContacts::new(Id::random());

        for _ in 0..5 {
            closest.add(contact());
        }

        assert_eq!(closest.take(3).len(), 3);
        assert_eq!(closest.take(20).len(), 5);
    }
}
