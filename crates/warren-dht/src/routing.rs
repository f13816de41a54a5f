//! Kademlia routing table.
//!
//! Buckets hold up to [`K`](crate::K) contacts each and cover progressively
//! longer prefixes of the local node id: bucket `i` holds contacts whose
//! common prefix with the local id is exactly `i` bits, except the last
//! bucket, which holds everything deeper. Only the last bucket (the one the
//! local id itself falls into) splits, by appending a new bucket for the
//! next prefix bit.
//!
//! ## Contact lifecycle
//!
//! A contact is *good* while it has replied recently, *questionable* after
//! 15 minutes of silence, and *bad* after two failed pings. Inserting into
//! a full bucket replaces a bad contact if there is one; otherwise the new
//! contact parks in the bucket's replacement cache and the oldest
//! questionable contact gets pinged through the injected [`Pinger`]; when
//! it fails out, the replacement is promoted.
//!
//! The table never pings by itself; the pinger is a callback supplied by
//! the node, which keeps the table ↔ node dependency one-directional.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::node_id::{NodeContact, NodeId};
use crate::K;

/// Silence interval after which a contact becomes questionable.
const QUESTIONABLE_AFTER: Duration = Duration::from_secs(15 * 60);

/// Failed pings after which a contact is bad.
const MAX_FAILURES: u32 = 2;

/// Replacement-cache capacity per bucket.
const REPLACEMENT_CAP: usize = K;

/// Fire-and-forget ping requester injected by the owning node.
pub type Pinger = Box<dyn Fn(NodeContact) + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ContactState {
    Good,
    Questionable,
    Bad,
}

struct Entry {
    contact: NodeContact,
    last_seen: Instant,
    failures: u32,
    ping_in_flight: bool,
}

impl Entry {
    fn new(contact: NodeContact) -> Self {
        Self {
            contact,
            last_seen: Instant::now(),
            failures: 0,
            ping_in_flight: false,
        }
    }

    fn state(&self) -> ContactState {
        if self.failures >= MAX_FAILURES {
            ContactState::Bad
        } else if self.failures > 0 || self.last_seen.elapsed() > QUESTIONABLE_AFTER {
            ContactState::Questionable
        } else {
            ContactState::Good
        }
    }
}

#[derive(Default)]
struct Bucket {
    entries: Vec<Entry>,
    replacements: Vec<NodeContact>,
}

/// The Kademlia routing table.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
    pinger: Pinger,
}

impl RoutingTable {
    /// Create a table for `local_id`; `pinger` is invoked to probe
    /// questionable contacts when buckets fill up.
    pub fn new(local_id: NodeId, pinger: Pinger) -> Self {
        Self {
            local_id,
            buckets: vec![Bucket::default()],
            pinger,
        }
    }

    /// The id this table is centred on.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Total number of live contacts.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    /// Whether the table holds no contacts at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.local_id
            .common_prefix_len(id)
            .min(self.buckets.len() - 1)
    }

    /// Record activity from `contact`.
    ///
    /// `confirmed` distinguishes a reply to one of our queries from a
    /// merely observed incoming query; only replies refresh liveness and
    /// clear failure counts.
    pub fn try_add_node(&mut self, contact: NodeContact, confirmed: bool) {
        if contact.id == self.local_id {
            return;
        }
        if crate::martian::is_martian(&contact.endpoint) {
            return;
        }

        loop {
            let idx = self.bucket_index(&contact.id);
            let buckets_len = self.buckets.len();
            let local_bucket = idx == buckets_len - 1;
            let bucket = &mut self.buckets[idx];

            if let Some(e) = bucket.entries.iter_mut().find(|e| e.contact.id == contact.id) {
                // Same id, maybe new endpoint: the newcomer wins only if
                // the incumbent is not good.
                if e.contact.endpoint != contact.endpoint {
                    if e.state() != ContactState::Good {
                        e.contact = contact;
                        e.failures = 0;
                    } else {
                        return;
                    }
                }
                if confirmed {
                    e.last_seen = Instant::now();
                    e.failures = 0;
                    e.ping_in_flight = false;
                }
                return;
            }

            if bucket.entries.len() < K {
                trace!(id = %contact.id, "routing: insert");
                bucket.entries.push(Entry::new(contact));
                return;
            }

            if let Some(pos) = bucket.entries.iter().position(|e| e.state() == ContactState::Bad) {
                trace!(id = %contact.id, "routing: replacing bad contact");
                bucket.entries[pos] = Entry::new(contact);
                return;
            }

            if local_bucket && buckets_len < crate::node_id::NODE_ID_LEN * 8 {
                self.split_last_bucket();
                continue; // retry against the finer buckets
            }

            // Full of good/questionable contacts: park the newcomer and
            // probe the most suspect incumbent.
            if !bucket.replacements.iter().any(|c| c.id == contact.id)
                && bucket.replacements.len() < REPLACEMENT_CAP
            {
                bucket.replacements.push(contact);
            }
            if let Some(e) = bucket
                .entries
                .iter_mut()
                .filter(|e| e.state() == ContactState::Questionable && !e.ping_in_flight)
                .min_by_key(|e| e.last_seen)
            {
                e.ping_in_flight = true;
                (self.pinger)(e.contact);
            }
            return;
        }
    }

    fn split_last_bucket(&mut self) {
        let split_prefix = self.buckets.len() - 1;
        let last = self.buckets.last_mut().unwrap();
        let mut moved = Vec::new();
        let mut kept = Vec::new();
        for e in last.entries.drain(..) {
            // Contacts matching the local id beyond the old prefix go to
            // the new deeper bucket.
            if self.local_id.common_prefix_len(&e.contact.id) > split_prefix {
                moved.push(e);
            } else {
                kept.push(e);
            }
        }
        last.entries = kept;
        let replacements = std::mem::take(&mut last.replacements);
        self.buckets.push(Bucket {
            entries: moved,
            replacements: Vec::new(),
        });
        // Re-file parked contacts now that there may be room.
        for c in replacements {
            self.try_add_node(c, false);
        }
    }

    /// Record a failed exchange with `contact`. Two failures make it bad;
    /// a bad contact is evicted on the spot if a replacement is parked.
    pub fn fail_node(&mut self, contact: NodeContact) {
        let idx = self.bucket_index(&contact.id);
        let bucket = &mut self.buckets[idx];
        let Some(pos) = bucket.entries.iter().position(|e| e.contact.id == contact.id) else {
            return;
        };
        let e = &mut bucket.entries[pos];
        e.failures += 1;
        e.ping_in_flight = false;
        if e.state() == ContactState::Bad {
            if let Some(replacement) = bucket.replacements.pop() {
                trace!(evicted = %contact.id, promoted = %replacement.id, "routing: evict + promote");
                bucket.entries[pos] = Entry::new(replacement);
            }
        }
    }

    /// Up to `count` known contacts closest to `target` by XOR distance,
    /// excluding bad ones.
    pub fn find_closest(&self, target: &NodeId, count: usize) -> Vec<NodeContact> {
        let mut all: Vec<&Entry> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter())
            .filter(|e| e.state() != ContactState::Bad)
            .collect();
        all.sort_by(|a, b| {
            target
                .distance(&a.contact.id)
                .cmp(&target.distance(&b.contact.id))
        });
        all.into_iter().take(count).map(|e| e.contact).collect()
    }

    /// Whether our own id is among the `count` ids closest to `target`,
    /// given what the table knows. Servers use this for the
    /// "not my responsibility" check.
    pub fn is_closer_than_known(&self, target: &NodeId, count: usize) -> bool {
        let closest = self.find_closest(target, count);
        closest.len() < count
            || closest
                .iter()
                .any(|c| target.closer_to(&self.local_id, &c.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn contact(id: [u8; 20], port: u16) -> NodeContact {
        NodeContact {
            id: NodeId::from_bytes(id),
            endpoint: format!("83.97.12.34:{port}").parse().unwrap(),
        }
    }

    fn id_with_prefix(first: u8, tail: u8) -> [u8; 20] {
        let mut id = [tail; 20];
        id[0] = first;
        id
    }

    fn table() -> (RoutingTable, Arc<AtomicUsize>) {
        let pings = Arc::new(AtomicUsize::new(0));
        let p = pings.clone();
        let table = RoutingTable::new(
            NodeId::zero(),
            Box::new(move |_| {
                p.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (table, pings)
    }

    #[test]
    fn test_insert_and_find() {
        let (mut t, _) = table();
        for i in 1..=5u8 {
            t.try_add_node(contact(id_with_prefix(0x80, i), 2000 + i as u16), true);
        }
        assert_eq!(t.len(), 5);
        let closest = t.find_closest(&NodeId::from_bytes(id_with_prefix(0x80, 1)), 3);
        assert_eq!(closest.len(), 3);
        assert_eq!(closest[0].id, NodeId::from_bytes(id_with_prefix(0x80, 1)));
    }

    #[test]
    fn test_closest_sorted_by_distance() {
        let (mut t, _) = table();
        for i in 1..=10u8 {
            t.try_add_node(contact(id_with_prefix(i, 0), 2000 + i as u16), true);
        }
        let target = NodeId::from_bytes(id_with_prefix(0x05, 0));
        let closest = t.find_closest(&target, 5);
        for pair in closest.windows(2) {
            assert!(target.distance(&pair[0].id) <= target.distance(&pair[1].id));
        }
    }

    #[test]
    fn test_full_bucket_pings_questionable() {
        let (mut t, pings) = table();
        // Fill one far bucket (prefix length 0: top bit set).
        for i in 0..K as u8 {
            t.try_add_node(contact(id_with_prefix(0x80, i + 1), 3000 + i as u16), true);
        }
        assert_eq!(pings.load(Ordering::SeqCst), 0);

        // Bucket is full of good contacts and cannot split (not the local
        // bucket once split): overflow parks and nothing is pinged while
        // everyone is still good.
        // Age one contact artificially by failing it once (questionable).
        t.fail_node(contact(id_with_prefix(0x80, 1), 3000));
        t.try_add_node(contact(id_with_prefix(0x80, 99), 3999), true);
        assert_eq!(pings.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bad_contact_replaced() {
        let (mut t, _) = table();
        for i in 0..K as u8 {
            t.try_add_node(contact(id_with_prefix(0x80, i + 1), 3000 + i as u16), true);
        }
        let victim = contact(id_with_prefix(0x80, 1), 3000);
        t.fail_node(victim);
        t.fail_node(victim);

        let newcomer = contact(id_with_prefix(0x80, 200), 4200);
        t.try_add_node(newcomer, true);
        let closest = t.find_closest(&newcomer.id, K);
        assert!(closest.iter().any(|c| c.id == newcomer.id));
        assert!(!closest.iter().any(|c| c.id == victim.id));
    }

    #[test]
    fn test_eviction_promotes_replacement() {
        let (mut t, _) = table();
        for i in 0..K as u8 {
            t.try_add_node(contact(id_with_prefix(0x80, i + 1), 3000 + i as u16), true);
        }
        let parked = contact(id_with_prefix(0x80, 123), 4123);
        t.try_add_node(parked, true); // bucket full -> parked

        let victim = contact(id_with_prefix(0x80, 1), 3000);
        t.fail_node(victim);
        t.fail_node(victim);
        let closest = t.find_closest(&parked.id, K);
        assert!(closest.iter().any(|c| c.id == parked.id));
    }

    #[test]
    fn test_local_bucket_splits() {
        let (mut t, _) = table();
        // More than K contacts close to the local (zero) id: forces splits
        // instead of overflow.
        for i in 0..(2 * K) as u8 {
            t.try_add_node(contact(id_with_prefix(0x00, i + 1), 5000 + i as u16), true);
        }
        assert!(t.len() > K, "local-side contacts must survive via splitting");
        assert!(t.buckets.len() > 1);
    }

    #[test]
    fn test_martian_never_added() {
        let (mut t, _) = table();
        let mut c = contact(id_with_prefix(0x80, 1), 3000);
        c.endpoint = "10.0.0.1:6881".parse().unwrap();
        t.try_add_node(c, true);
        assert!(t.is_empty());
    }

    #[test]
    fn test_same_id_new_endpoint_needs_unresponsive_incumbent() {
        let (mut t, _) = table();
        let a = contact(id_with_prefix(0x80, 1), 3000);
        t.try_add_node(a, true);

        // Good incumbent keeps its endpoint.
        let mut b = a;
        b.endpoint = "83.97.12.35:3333".parse().unwrap();
        t.try_add_node(b, false);
        assert_eq!(t.find_closest(&a.id, 1)[0].endpoint, a.endpoint);

        // Once the incumbent fails, the new endpoint wins.
        t.fail_node(a);
        t.try_add_node(b, false);
        assert_eq!(t.find_closest(&a.id, 1)[0].endpoint, b.endpoint);
    }
}
