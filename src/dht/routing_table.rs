//! K-bucket routing table. Buckets are ordered oldest-to-newest; capacity
//! `K = 20`. Insertion follows a ping-the-head eviction rule, split into a
//! pure decision (`try_insert`) and an explicit resolution step
//! (`resolve_full_bucket`) so the network I/O (pinging the head) never
//! happens while the table's mutex is held.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Instant;

use super::{bucket_index, NUM_BUCKETS, K};

#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub node_id: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub last_seen: Instant,
}

#[derive(Debug)]
pub enum InsertOutcome {
    /// Inserted directly (new contact, bucket had room, or contact already present and refreshed).
    Inserted,
    /// The bucket is full of live contacts; the caller should PING `head`
    /// and then call [`RoutingTable::resolve_full_bucket`] with the result.
    BucketFull { bucket: usize, head: Contact, candidate: Contact },
}

#[derive(Default)]
struct Bucket {
    contacts: VecDeque<Contact>,
}

pub struct RoutingTable {
    local_id: [u8; 20],
    buckets: Vec<Mutex<Bucket>>,
    bucket_refreshed_at: Vec<Mutex<Instant>>,
}

impl RoutingTable {
    pub fn new(local_id: [u8; 20]) -> Self {
        let now = Instant::now();
        Self {
            local_id,
            buckets: (0..NUM_BUCKETS).map(|_| Mutex::new(Bucket::default())).collect(),
            bucket_refreshed_at: (0..NUM_BUCKETS).map(|_| Mutex::new(now)).collect(),
        }
    }

    fn bucket_for(&self, peer_id: &[u8; 20]) -> usize {
        bucket_index(&self.local_id, peer_id)
    }

    /// Attempts to insert/refresh `contact`. See [`InsertOutcome`].
    pub fn try_insert(&self, peer_id: [u8; 20], contact: Contact) -> InsertOutcome {
        let idx = self.bucket_for(&peer_id);
        let mut bucket = self.buckets[idx].lock().unwrap();

        if let Some(pos) = bucket.contacts.iter().position(|c| c.node_id == contact.node_id) {
            let mut c = bucket.contacts.remove(pos).unwrap();
            c.last_seen = contact.last_seen;
            c.ip = contact.ip;
            c.port = contact.port;
            bucket.contacts.push_back(c);
            return InsertOutcome::Inserted;
        }

        if bucket.contacts.len() < K {
            bucket.contacts.push_back(contact);
            return InsertOutcome::Inserted;
        }

        let head = bucket.contacts.front().cloned().expect("bucket at capacity is non-empty");
        InsertOutcome::BucketFull {
            bucket: idx,
            head,
            candidate: contact,
        }
    }

    /// Resolves a [`InsertOutcome::BucketFull`]: if the head replied to
    /// the ping, it moves to the tail and the candidate is discarded;
    /// otherwise the head is evicted and the candidate appended.
    pub fn resolve_full_bucket(&self, bucket: usize, head_replied: bool, head: Contact, candidate: Contact) {
        let mut b = self.buckets[bucket].lock().unwrap();
        if head_replied {
            if let Some(pos) = b.contacts.iter().position(|c| c.node_id == head.node_id) {
                let mut c = b.contacts.remove(pos).unwrap();
                c.last_seen = Instant::now();
                b.contacts.push_back(c);
            }
        } else if let Some(pos) = b.contacts.iter().position(|c| c.node_id == head.node_id) {
            b.contacts.remove(pos);
            b.contacts.push_back(candidate);
        }
    }

    pub fn mark_bucket_refreshed(&self, bucket: usize) {
        *self.bucket_refreshed_at[bucket].lock().unwrap() = Instant::now();
    }

    /// The stalest bucket that has actually ever held a contact, if its
    /// last refresh is older than `max_age`.
    pub fn stalest_bucket_over(&self, max_age: std::time::Duration) -> Option<usize> {
        let now = Instant::now();
        self.bucket_refreshed_at
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.buckets[*i].lock().unwrap().contacts.is_empty())
            .map(|(i, t)| (i, *t.lock().unwrap()))
            .filter(|(_, t)| now.duration_since(*t) > max_age)
            .max_by_key(|(_, t)| now.duration_since(*t))
            .map(|(i, _)| i)
    }

    /// All contacts across all buckets, sorted by XOR distance to
    /// `target`, closest first, truncated to `K`. Single-hop lookup over
    /// the local view; callers needing the full iterative lookup compose
    /// this with their own round-trips.
    pub fn closest_to(&self, target: &[u8; 20], limit: usize) -> Vec<Contact> {
        let mut all: Vec<(([u8; 20]), Contact)> = Vec::new();
        for bucket in &self.buckets {
            for c in bucket.lock().unwrap().contacts.iter() {
                if let Ok(id) = super::parse_id(&c.node_id) {
                    all.push((super::xor_distance(&id, target), c.clone()));
                }
            }
        }
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all.truncate(limit);
        all.into_iter().map(|(_, c)| c).collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().unwrap().contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_len(&self, idx: usize) -> usize {
        self.buckets[idx].lock().unwrap().contacts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(id: &str, port: u16) -> ([u8; 20], Contact) {
        let bytes = super::super::parse_id(id).unwrap();
        (
            bytes,
            Contact {
                node_id: id.to_string(),
                ip: Ipv4Addr::LOCALHOST,
                port,
                last_seen: Instant::now(),
            },
        )
    }

    #[test]
    fn bucket_never_exceeds_k() {
        let local = [0u8; 20];
        let table = RoutingTable::new(local);
        // All share the same top byte so they land in the same bucket as
        // each other (not bucket 0, since none of them equal `local`).
        for i in 0..(K + 5) {
            let id = format!("{:02x}{}", 1, "0".repeat(38 - 2) + &format!("{i:02x}"));
            let (bytes, c) = contact(&id, 1000 + i as u16);
            let _ = table.try_insert(bytes, c);
        }
        assert!(table.len() <= K * NUM_BUCKETS); // sanity: never unbounded
        for i in 0..NUM_BUCKETS {
            assert!(table.bucket_len(i) <= K);
        }
    }

    #[test]
    fn reinserting_known_contact_moves_to_tail_without_growing() {
        let local = [0u8; 20];
        let table = RoutingTable::new(local);
        let (bytes, c) = contact(&"1".repeat(40), 1);
        table.try_insert(bytes, c.clone());
        table.try_insert(bytes, c);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn closest_to_sorts_by_xor_distance() {
        let local = [0u8; 20];
        let table = RoutingTable::new(local);
        let ids = ["f".repeat(40), "1".repeat(40), "8".repeat(40)];
        for (i, id) in ids.iter().enumerate() {
            let (bytes, c) = contact(id, i as u16);
            table.try_insert(bytes, c);
        }
        let target = super::super::parse_id(&"0".repeat(40)).unwrap();
        let closest = table.closest_to(&target, 10);
        assert_eq!(closest[0].node_id, "1".repeat(40));
    }
}
