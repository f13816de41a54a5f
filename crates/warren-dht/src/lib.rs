//! # warren-dht
//!
//! Mainline-DHT node for the Warren distributed cache, implementing peer
//! discovery (BEP 5), the read-only flag (BEP 43), node-id hardening
//! (BEP 42) and arbitrary mutable/immutable key-value storage (BEP 44).
//!
//! This crate implements:
//! - [`bencode`] — BEP-3 value model, parser and canonical emitter
//! - [`node_id`] — 160-bit ids, XOR metric, BEP-42 derivation, compact
//!   endpoint codecs
//! - [`martian`] — unroutable-endpoint filtering
//! - [`routing`] — Kademlia buckets with ping-based eviction and self-split
//! - [`storage`] — server-side peer tracker and BEP-44 record store with
//!   rotating announce tokens
//! - [`lookup`] — the iterative α-parallel traversal state machine
//! - [`node`] — the [`DhtNode`](node::DhtNode): transactions, timeouts,
//!   bootstrap, queries and server-side handling
//! - [`announcer`] — periodic/manual swarm re-announcement
//!
//! ## Key parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | K (bucket size) | 8 |
//! | α (lookup parallelism) | 4 |
//! | Responsible nodes per swarm | 8 |
//! | Reply timeout | adaptive `mean + 3σ`, capped 3 s |
//! | Reply-time window | last 10 replies per query type |
//! | Max BEP-44 value size | 1000 bytes |
//! | Bootstrap port | 6881 |

pub mod announcer;
pub mod bencode;
pub mod lookup;
pub mod martian;
pub mod node;
pub mod node_id;
pub mod routing;
pub mod storage;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use node::DhtNode;
pub use node_id::{NodeContact, NodeId};

/// Kademlia bucket size: maximum contacts per bucket.
pub const K: usize = 8;

/// Lookup parallelism factor.
pub const ALPHA: usize = 4;

/// Number of closest contacts that hold a swarm's peer list or a BEP-44
/// value, and the target count for iterative lookups.
pub const RESPONSIBLE_NODES: usize = 8;

/// Maximum size of a bencoded BEP-44 value in bytes.
pub const MAX_VALUE_SIZE: usize = 1000;

/// Maximum size of a BEP-44 salt in bytes.
pub const MAX_SALT_SIZE: usize = 64;

/// UDP port the well-known bootstrap routers listen on.
pub const BOOTSTRAP_PORT: u16 = 6881;

/// Error types for DHT operations.
#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    /// The operation was cancelled.
    #[error("operation aborted")]
    OperationAborted,

    /// The node is not bootstrapped yet; retry later.
    #[error("not bootstrapped yet, try again")]
    TryAgain,

    /// No queried node returned the requested data.
    #[error("not found")]
    NotFound,

    /// No write query reached any responsible node.
    #[error("network down")]
    NetworkDown,

    /// No DHT node is usable at all.
    #[error("network unreachable")]
    NetworkUnreachable,

    /// The remote reply or local argument was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A remote query timed out.
    #[error("timed out")]
    TimedOut,

    /// The remote answered with a KRPC error reply.
    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    /// Transport failure underneath the DHT.
    #[error("transport: {0}")]
    Transport(#[from] warren_transport::TransportError),

    /// Bootstrap could not complete.
    #[error("bootstrap failed: {0}")]
    BootstrapFailed(String),
}

/// Result alias for DHT operations.
pub type Result<T> = std::result::Result<T, DhtError>;

/// Tunables for a [`DhtNode`](node::DhtNode).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DhtConfig {
    /// Well-known bootstrap router hostnames, tried shuffled.
    pub bootstrap_servers: Vec<String>,
    /// Seconds to back off after a failed bootstrap round.
    pub bootstrap_retry_secs: u64,
    /// Early-cancel delay for mutable gets after the first valid item, in
    /// seconds. `None` lets the traversal run to its natural end. The
    /// reference implementation hardwires 5 s and its author flagged that
    /// as dubious, so it is a knob here.
    pub mutable_get_early_cancel_secs: Option<u64>,
    /// Whether this node answers queries (a read-only node sets `ro=1` and
    /// never enters peers' routing tables, per BEP 43).
    pub read_only: bool,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: vec![
                "router.bittorrent.com".into(),
                "router.utorrent.com".into(),
                "router.transmissionbt.com".into(),
            ],
            bootstrap_retry_secs: 10,
            mutable_get_early_cancel_secs: Some(5),
            read_only: false,
        }
    }
}

impl DhtConfig {
    pub(crate) fn bootstrap_retry(&self) -> Duration {
        Duration::from_secs(self.bootstrap_retry_secs)
    }

    pub(crate) fn mutable_get_early_cancel(&self) -> Option<Duration> {
        self.mutable_get_early_cancel_secs.map(Duration::from_secs)
    }
}
