use std::{collections::HashMap, net::IpAddr, sync::Arc};

use tokio::sync::Mutex;
use tracing::trace;

use crate::types::{Contact, NodeId};

const NUMBER_OF_BUCKETS: usize = 160;

/// What happened to a contact offered to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New entry, stored in the given bucket.
    Inserted { bucket: usize },
    /// Already present; moved to the freshest position of its bucket.
    Refreshed { bucket: usize },
    /// Bucket full; the offered contact was dropped. Pinging the oldest
    /// entry before evicting is out of scope.
    Discarded { bucket: usize },
    /// The local node's own id is never stored.
    SelfEntry,
}

#[derive(Debug, Clone, Default)]
struct Bucket {
    entries: Vec<Contact>,
}

impl Bucket {
    /// Records a sighting of `contact`. Duplicates refresh to the tail,
    /// which keeps the head the least recently seen entry.
    fn saw_contact(&mut self, contact: Contact, k: usize) -> bool {
        if let Some(position) = self.entries.iter().position(|c| c.id == contact.id) {
            let existing = self.entries.remove(position);
            self.entries.push(existing);
            return true;
        }
        if self.entries.len() < k {
            self.entries.push(contact);
            return true;
        }
        false
    }
}

/// The node's view of the overlay: 160 k-buckets ordered by XOR distance
/// from the local id. All methods take `&mut self`; concurrent access goes
/// through [`Kademlia`], which wraps the table in an async mutex.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize) -> Self {
        Self {
            local_id,
            k,
            buckets: vec![Bucket::default(); NUMBER_OF_BUCKETS],
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn insert(&mut self, contact: Contact) -> InsertOutcome {
        if contact.id == self.local_id {
            return InsertOutcome::SelfEntry;
        }
        let bucket = self.local_id.distance_to(&contact.id).bucket_index();
        let already_known = self.buckets[bucket]
            .entries
            .iter()
            .any(|c| c.id == contact.id);
        if self.buckets[bucket].saw_contact(contact, self.k) {
            if already_known {
                InsertOutcome::Refreshed { bucket }
            } else {
                trace!(local = %self.local_id, contact = %contact, bucket, "Inserted contact");
                InsertOutcome::Inserted { bucket }
            }
        } else {
            InsertOutcome::Discarded { bucket }
        }
    }

    /// The `n` known contacts closest to `target`: the target's bucket
    /// first, then widening to adjacent buckets until enough candidates are
    /// collected, sorted by XOR distance.
    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<Contact> {
        let mut out = Vec::with_capacity(n);
        let index = self.local_id.distance_to(target).bucket_index();
        out.extend(self.buckets[index].entries.iter().copied());

        let mut delta = 1;
        while out.len() < n {
            let mut widened = false;
            if index >= delta {
                widened = true;
                out.extend(self.buckets[index - delta].entries.iter().copied());
            }
            if index + delta < NUMBER_OF_BUCKETS {
                widened = true;
                out.extend(self.buckets[index + delta].entries.iter().copied());
            }
            if !widened {
                break;
            }
            delta += 1;
        }

        out.sort_by_key(|c| target.distance_to(&c.id));
        out.truncate(n);
        out
    }

    /// Visits every stored contact with its bucket index, closest buckets
    /// first.
    pub fn walk<F>(&self, mut f: F)
    where
        F: FnMut(usize, &Contact),
    {
        for (index, bucket) in self.buckets.iter().enumerate() {
            for contact in &bucket.entries {
                f(index, contact);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stored values: a key resolves to the UDP endpoint that published it.
#[derive(Debug, Default)]
pub struct ValueStore {
    values: HashMap<NodeId, (IpAddr, u16)>,
}

impl ValueStore {
    pub fn insert(&mut self, key: NodeId, ip: IpAddr, port: u16) {
        self.values.insert(key, (ip, port));
    }

    pub fn get(&self, key: &NodeId) -> Option<(IpAddr, u16)> {
        self.values.get(key).copied()
    }
}

/// Shared handle over the routing table and the value store. Every
/// operation takes the lock for exactly one table call.
#[derive(Debug, Clone)]
pub struct Kademlia {
    pub table: Arc<Mutex<RoutingTable>>,
    pub store: Arc<Mutex<ValueStore>>,
}

impl Kademlia {
    pub fn new(local_id: NodeId, k: usize) -> Self {
        Self {
            table: Arc::new(Mutex::new(RoutingTable::new(local_id, k))),
            store: Arc::new(Mutex::new(ValueStore::default())),
        }
    }

    pub async fn insert(&self, contact: Contact) -> InsertOutcome {
        self.table.lock().await.insert(contact)
    }

    pub async fn closest(&self, target: &NodeId, n: usize) -> Vec<Contact> {
        self.table.lock().await.closest(target, n)
    }

    pub async fn alpha_closest(&self, target: &NodeId, alpha: usize) -> Vec<Contact> {
        self.table.lock().await.closest(target, alpha)
    }

    pub async fn store_value(&self, key: NodeId, ip: IpAddr, port: u16) {
        self.store.lock().await.insert(key, ip, port);
    }

    pub async fn find_value(&self, key: &NodeId) -> Option<(IpAddr, u16)> {
        self.store.lock().await.get(key)
    }

    pub async fn contact_count(&self) -> usize {
        self.table.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn contact(id: NodeId) -> Contact {
        Contact::new(id, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 5050)
    }

    #[test]
    fn insert_and_refresh() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local, 20);

        let peer = contact(NodeId::random());
        assert!(matches!(
            table.insert(peer),
            InsertOutcome::Inserted { .. }
        ));
        assert!(matches!(
            table.insert(peer),
            InsertOutcome::Refreshed { .. }
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn rejects_self() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local, 20);
        assert_eq!(table.insert(contact(local)), InsertOutcome::SelfEntry);
        assert!(table.is_empty());
    }

    #[test]
    fn full_bucket_discards() {
        let local = NodeId::ZERO;
        let mut table = RoutingTable::new(local, 2);

        // Three ids in the same bucket (highest bit set).
        for low in 0..3u8 {
            let mut bytes = [0u8; 20];
            bytes[0] = 0x80;
            bytes[19] = low + 1;
            let outcome = table.insert(contact(NodeId::from_bytes(bytes)));
            if low < 2 {
                assert!(matches!(outcome, InsertOutcome::Inserted { .. }));
            } else {
                assert!(matches!(outcome, InsertOutcome::Discarded { .. }));
            }
        }
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn closest_sorts_by_distance() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local, 20);
        let target = NodeId::random();

        for _ in 0..50 {
            table.insert(contact(NodeId::random()));
        }

        let closest = table.closest(&target, 20);
        assert_eq!(closest.len(), 20);
        let distances: Vec<_> = closest
            .iter()
            .map(|c| target.distance_to(&c.id))
            .collect();
        let mut sorted = distances.clone();
        sorted.sort();
        assert_eq!(distances, sorted);

        // No stored contact outside the result is closer than the furthest
        // inside it.
        let furthest = distances.last().copied().expect("non-empty");
        table.walk(|_, c| {
            if !closest.iter().any(|sel| sel.id == c.id) {
                assert!(target.distance_to(&c.id) >= furthest);
            }
        });
    }

    #[test]
    fn walk_visits_everything() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local, 20);
        for _ in 0..7 {
            table.insert(contact(NodeId::random()));
        }
        let mut seen = 0;
        table.walk(|_, _| seen += 1);
        assert_eq!(seen, 7);
    }
}
