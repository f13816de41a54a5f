//! Iterative α-parallel Kademlia traversal, as a sans-IO state machine.
//!
//! The node drives the traversal: it pops candidates to query (at most
//! [`ALPHA`](crate::ALPHA) in flight), feeds replies back, and marks
//! responders it accepted as responsible. The machine keeps:
//!
//! - the unexplored candidate set, ordered identified-before-bootstrap and
//!   then by XOR distance to the target
//! - the set of already-contacted endpoints, so nothing is queried twice
//! - the accepted responder set, capped at
//!   [`RESPONSIBLE_NODES`](crate::RESPONSIBLE_NODES) closest
//!
//! A candidate that could not beat the worst accepted responder is
//! discarded instead of queried, which is what terminates the traversal.

use std::collections::{BTreeSet, HashSet};
use std::net::SocketAddr;

use crate::node_id::{NodeContact, NodeId};
use crate::{ALPHA, RESPONSIBLE_NODES};

/// A traversal candidate: bootstrap endpoints have no id yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub id: Option<NodeId>,
    pub endpoint: SocketAddr,
}

impl From<NodeContact> for Candidate {
    fn from(c: NodeContact) -> Self {
        Candidate {
            id: Some(c.id),
            endpoint: c.endpoint,
        }
    }
}

/// Ordering wrapper: identified candidates first (closest first),
/// bootstrap endpoints last, ordered by address for determinism.
#[derive(PartialEq, Eq)]
struct Ordered {
    key: (u8, Option<[u8; 20]>, (std::net::IpAddr, u16)),
    candidate: Candidate,
}

impl Ord for Ordered {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

impl PartialOrd for Ordered {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The traversal state machine.
pub struct Traversal {
    target: NodeId,
    candidates: BTreeSet<Ordered>,
    contacted: HashSet<SocketAddr>,
    accepted: Vec<NodeId>,
    in_flight: usize,
    max_in_flight: usize,
}

impl Traversal {
    /// Start a traversal towards `target` from `seeds`.
    pub fn new(target: NodeId, seeds: impl IntoIterator<Item = Candidate>) -> Self {
        let mut t = Self {
            target,
            candidates: BTreeSet::new(),
            contacted: HashSet::new(),
            accepted: Vec::new(),
            in_flight: 0,
            max_in_flight: ALPHA,
        };
        t.add_candidates(seeds);
        t
    }

    fn ordered(&self, c: Candidate) -> Ordered {
        let rank = if c.id.is_some() { 0 } else { 1 };
        let distance = c.id.map(|id| self.target.distance(&id));
        Ordered {
            key: (rank, distance, (c.endpoint.ip(), c.endpoint.port())),
            candidate: c,
        }
    }

    /// Insert new candidates; endpoints already contacted or queued are
    /// ignored.
    pub fn add_candidates(&mut self, new: impl IntoIterator<Item = Candidate>) {
        for c in new {
            if self.contacted.contains(&c.endpoint) {
                continue;
            }
            let o = self.ordered(c);
            self.candidates.insert(o);
        }
    }

    /// Whether `id` would still make it into the accepted responder set.
    pub fn would_accept(&self, id: &NodeId) -> bool {
        if self.accepted.len() < RESPONSIBLE_NODES {
            return true;
        }
        let worst = self.accepted.last().unwrap();
        self.target.closer_to(id, worst)
    }

    /// Record a responder among the closest accepted set.
    pub fn accept(&mut self, id: NodeId) {
        if !self.would_accept(&id) || self.accepted.contains(&id) {
            return;
        }
        self.accepted.push(id);
        let target = self.target;
        self.accepted
            .sort_by(|a, b| target.distance(a).cmp(&target.distance(b)));
        self.accepted.truncate(RESPONSIBLE_NODES);
    }

    /// The accepted responders, closest first.
    pub fn accepted(&self) -> &[NodeId] {
        &self.accepted
    }

    /// Pop the next candidate worth querying, if the parallelism budget
    /// allows. Hopeless candidates are dropped on the way.
    pub fn next_candidate(&mut self) -> Option<Candidate> {
        if self.in_flight >= self.max_in_flight {
            return None;
        }
        while let Some(first) = self.candidates.pop_first() {
            let c = first.candidate;
            if self.contacted.contains(&c.endpoint) {
                continue;
            }
            if let Some(id) = c.id {
                if !self.would_accept(&id) {
                    continue;
                }
            } else if self.accepted.len() >= RESPONSIBLE_NODES {
                // Bootstrap endpoints are pointless once the set is full.
                continue;
            }
            self.contacted.insert(c.endpoint);
            self.in_flight += 1;
            return Some(c);
        }
        None
    }

    /// Mark one in-flight query as finished.
    pub fn complete_one(&mut self) {
        debug_assert!(self.in_flight > 0);
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Queries currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Whether the traversal has converged: nothing worth querying is left
    /// and nothing is in flight.
    pub fn is_done(&mut self) -> bool {
        if self.in_flight > 0 {
            return false;
        }
        // Purge hopeless candidates so emptiness is meaningful.
        while let Some(first) = self.candidates.first() {
            let c = first.candidate;
            let hopeless = match c.id {
                Some(id) => !self.would_accept(&id),
                None => self.accepted.len() >= RESPONSIBLE_NODES,
            } || self.contacted.contains(&c.endpoint);
            if hopeless {
                self.candidates.pop_first();
            } else {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn ident(byte: u8, port: u16) -> Candidate {
        Candidate {
            id: Some(NodeId::from_bytes([byte; 20])),
            endpoint: ep(port),
        }
    }

    fn bootstrap(port: u16) -> Candidate {
        Candidate {
            id: None,
            endpoint: ep(port),
        }
    }

    #[test]
    fn test_identified_before_bootstrap() {
        let target = NodeId::zero();
        let mut t = Traversal::new(target, [bootstrap(1000), ident(0x10, 1001)]);
        assert_eq!(t.next_candidate().unwrap().endpoint, ep(1001));
        assert_eq!(t.next_candidate().unwrap().endpoint, ep(1000));
    }

    #[test]
    fn test_closest_first() {
        let target = NodeId::zero();
        let mut t = Traversal::new(target, [ident(0x80, 1000), ident(0x01, 1001)]);
        assert_eq!(t.next_candidate().unwrap().endpoint, ep(1001));
    }

    #[test]
    fn test_parallelism_cap() {
        let target = NodeId::zero();
        let seeds: Vec<_> = (0..10u8).map(|i| ident(i + 1, 1000 + i as u16)).collect();
        let mut t = Traversal::new(target, seeds);
        for _ in 0..ALPHA {
            assert!(t.next_candidate().is_some());
        }
        assert!(t.next_candidate().is_none());
        t.complete_one();
        assert!(t.next_candidate().is_some());
    }

    #[test]
    fn test_no_requery() {
        let target = NodeId::zero();
        let mut t = Traversal::new(target, [ident(0x10, 1000)]);
        assert!(t.next_candidate().is_some());
        // Same endpoint fed back from a reply: must not be queried again.
        t.add_candidates([ident(0x10, 1000)]);
        t.complete_one();
        assert!(t.next_candidate().is_none());
        assert!(t.is_done());
    }

    #[test]
    fn test_convergence_with_acceptance() {
        let target = NodeId::zero();
        let seeds: Vec<_> = (0..4u8).map(|i| ident(0x40 + i, 1000 + i as u16)).collect();
        let mut t = Traversal::new(target, seeds);

        let mut queried = 0u16;
        while !t.is_done() {
            let Some(c) = t.next_candidate() else {
                unreachable!("queries are completed synchronously here");
            };
            queried += 1;
            t.accept(c.id.unwrap());
            // Every responder advertises the same two closer nodes; the
            // contacted-endpoint set keeps the frontier finite.
            t.add_candidates((0..2u8).map(|j| ident(0x01 + j, 2000 + j as u16)));
            t.complete_one();
        }
        assert!(queried >= 4);
        assert!(!t.accepted().is_empty());
        assert!(t.accepted().len() <= RESPONSIBLE_NODES);
        // Closest responders are sorted first.
        let d0 = target.distance(&t.accepted()[0]);
        for id in t.accepted() {
            assert!(target.distance(id) >= d0);
        }
    }

    #[test]
    fn test_far_candidates_dropped_when_full() {
        let target = NodeId::zero();
        let mut t = Traversal::new(target, []);
        // Fill the accepted set with very close ids.
        for i in 0..RESPONSIBLE_NODES as u8 {
            let mut b = [0u8; 20];
            b[19] = i + 1;
            t.accept(NodeId::from_bytes(b));
        }
        // Far candidates and bootstrap endpoints are now hopeless.
        t.add_candidates([ident(0xf0, 3000), bootstrap(3001)]);
        assert!(t.next_candidate().is_none());
        assert!(t.is_done());
    }
}
